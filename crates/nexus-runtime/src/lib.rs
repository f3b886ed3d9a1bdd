//! Panel runtime core: sandboxed execution of untrusted panel handlers.
//!
//! This crate exposes the execution engine behind interactive panels:
//! - [`Runtime`]: the executor driving handler invocations end to end.
//! - [`exec`]: the context/result envelopes crossing the boundary.
//! - [`capability`]: the permission grammar checked on every host call.
//! - [`value`]: tagged runtime values with a compact CBOR boundary codec.
//! - [`cache`]: the two-tier compiled-artifact cache.
//!
//! Handlers are JavaScript fragments. Inside the sandbox the only reachable
//! host surface is `$state`, `$args`, `$scope`, `$view`, `$emit`, `$ext` and
//! `$log`; every effect is capability-checked and recorded into the result
//! envelope in call order. `$ext.name.method(args)` suspends the execution
//! and [`Runtime::resume_handler`] continues it once the external call
//! settles.
//!
//! # Quickstart
//!
//! ```no_run
//! use nexus_runtime::{
//!     Runtime, RuntimeConfig,
//!     capability::CapabilitySet,
//!     exec::ExecutionContext,
//!     value::RuntimeValue,
//! };
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Runtime::new(RuntimeConfig::default())?;
//!
//!     let mut context = ExecutionContext::default();
//!     context.panel_id = "demo".into();
//!     context.handler_name = "increment".into();
//!     context.state_snapshot.insert("count".into(), RuntimeValue::Int(5));
//!     context.args = RuntimeValue::from_json(r#"{"by": 3}"#)?;
//!     context.granted_capabilities =
//!         CapabilitySet::parse(["state:read:count", "state:write:count"])?;
//!
//!     let result = runtime
//!         .execute_handler(
//!             "$state.count = ($state.count ?? 0) + $args.by;",
//!             context,
//!             None,
//!         )
//!         .await?;
//!     assert_eq!(result.state_mutations.len(), 1);
//!
//!     runtime.shutdown();
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod capability;
pub mod config;
pub mod error;
pub mod exec;
mod infer;
mod pool;
mod runtime;
mod sandbox;
mod stats;
pub mod value;

pub use config::RuntimeConfig;
pub use error::{Error, ErrorCode, ErrorEnvelope, Result, SourceLocation};
pub use infer::infer_capabilities;
pub use runtime::Runtime;
pub use stats::RuntimeStats;
