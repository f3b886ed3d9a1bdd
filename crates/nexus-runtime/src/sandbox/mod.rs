//! Sandbox instance: one isolated script context with enforced limits.
//!
//! Each instance owns a dedicated thread on which its QuickJS runtime and
//! context live. The async surface talks to the thread over channels, which
//! is what lets `$ext` calls park the script mid-execution: the bridge
//! function blocks the instance thread on a resume channel while the
//! executor returns a `suspended` result to its caller.

mod convert;
mod host;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread,
};

use anyhow::anyhow;
use rand::Rng as _;
use rquickjs::{
    CatchResultExt, CaughtError, Context, Function, Module, Value, promise::MaybePromise,
};
use tokio::sync::{mpsc as async_mpsc, oneshot};

use crate::{
    cache::{CompiledArtifact, HANDLER_EXPORT, SOURCE_LINE_OFFSET},
    config::RuntimeConfig,
    error::{Error, ErrorCode, ErrorEnvelope, SourceLocation},
    exec::{AsyncResult, ExecutionContext, Suspension},
    value::RuntimeValue,
};

pub(crate) use host::{Effects, ExecutionEnv, HostBridge};

/// Tracing target for `$log` output from handler code.
pub(crate) const SCRIPT_LOG_TARGET: &str = "nexus::script";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InstanceState {
    Idle,
    Executing,
    Suspended,
    Terminated,
}

/// Engine knobs shared by every instance of one runtime.
#[derive(Clone, Debug)]
pub(crate) struct SandboxSettings {
    pub memory_limit_bytes: usize,
    pub stack_size_bytes: usize,
    pub gc_threshold_bytes: Option<usize>,
    pub run_gc_after_execution: bool,
}

impl From<&RuntimeConfig> for SandboxSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            memory_limit_bytes: config.memory_limit_bytes,
            stack_size_bytes: config.stack_size_bytes,
            gc_threshold_bytes: config.gc_threshold_bytes,
            run_gc_after_execution: config.run_gc_after_execution,
        }
    }
}

/// Event stream from the instance thread back to the executor. A cycle emits
/// zero or more `Suspended` events followed by exactly one `Finished`.
pub(crate) enum ExecEvent {
    Suspended {
        suspension: Suspension,
        effects: Effects,
        host_call_count: u64,
    },
    Finished(Box<RunOutcome>),
}

pub(crate) struct RunOutcome {
    pub return_value: Option<RuntimeValue>,
    pub error: Option<ErrorEnvelope>,
    pub effects: Effects,
    pub host_call_count: u64,
}

enum Command {
    Execute {
        artifact: Arc<CompiledArtifact>,
        context: Box<ExecutionContext>,
        events: async_mpsc::UnboundedSender<ExecEvent>,
        resume: mpsc::Receiver<AsyncResult>,
    },
    Reset {
        done: oneshot::Sender<Result<(), String>>,
    },
}

pub(crate) fn mint_suspension_id() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

pub(crate) struct SandboxInstance {
    id: u64,
    state: InstanceState,
    commands: mpsc::Sender<Command>,
    events: Option<async_mpsc::UnboundedReceiver<ExecEvent>>,
    resume_tx: Option<mpsc::Sender<AsyncResult>>,
    interrupt: Arc<AtomicBool>,
    memory_used: Arc<AtomicU64>,
}

impl SandboxInstance {
    /// Allocate the underlying engine on a fresh instance thread.
    pub(crate) async fn new(settings: &SandboxSettings) -> Result<Self, Error> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

        let interrupt = Arc::new(AtomicBool::new(false));
        let memory_used = Arc::new(AtomicU64::new(0));
        let (commands, command_rx) = mpsc::channel();
        let (init_tx, init_rx) = oneshot::channel();

        {
            let settings = settings.clone();
            let interrupt = Arc::clone(&interrupt);
            let memory_used = Arc::clone(&memory_used);
            thread::Builder::new()
                .name(format!("nexus-sandbox-{id}"))
                .spawn(move || {
                    instance_thread(&settings, &command_rx, &interrupt, &memory_used, init_tx);
                })
                .map_err(|e| Error::Initialization(e.into()))?;
        }

        init_rx
            .await
            .map_err(|_| Error::Initialization(anyhow!("sandbox thread exited during startup")))?
            .map_err(|message| Error::Initialization(anyhow!(message)))?;

        tracing::debug!(instance = id, "sandbox instance created");
        Ok(Self {
            id,
            state: InstanceState::Idle,
            commands,
            events: None,
            resume_tx: None,
            interrupt,
            memory_used,
        })
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) const fn state(&self) -> InstanceState {
        self.state
    }

    pub(crate) fn memory_used(&self) -> u64 {
        self.memory_used.load(Ordering::Relaxed)
    }

    /// Start one execute cycle; outcomes arrive via [`Self::next_event`].
    pub(crate) fn begin_execute(
        &mut self,
        artifact: Arc<CompiledArtifact>,
        context: ExecutionContext,
    ) -> Result<(), Error> {
        let (events_tx, events_rx) = async_mpsc::unbounded_channel();
        let (resume_tx, resume_rx) = mpsc::channel();
        self.interrupt.store(false, Ordering::Relaxed);
        self.commands
            .send(Command::Execute {
                artifact,
                context: Box::new(context),
                events: events_tx,
                resume: resume_rx,
            })
            .map_err(|_| Error::Runtime(anyhow!("sandbox thread terminated")))?;
        self.events = Some(events_rx);
        self.resume_tx = Some(resume_tx);
        self.state = InstanceState::Executing;
        Ok(())
    }

    /// Deliver an async outcome to the suspension point parked in the thread.
    pub(crate) fn deliver_resume(&mut self, result: AsyncResult) -> Result<(), Error> {
        self.interrupt.store(false, Ordering::Relaxed);
        self.resume_tx
            .as_ref()
            .ok_or_else(|| Error::Runtime(anyhow!("no suspension in flight")))?
            .send(result)
            .map_err(|_| Error::Runtime(anyhow!("sandbox thread terminated while suspended")))?;
        self.state = InstanceState::Executing;
        Ok(())
    }

    pub(crate) async fn next_event(&mut self) -> Result<ExecEvent, Error> {
        let events = self
            .events
            .as_mut()
            .ok_or_else(|| Error::Runtime(anyhow!("no execution in flight")))?;
        events
            .recv()
            .await
            .ok_or_else(|| Error::Runtime(anyhow!("sandbox thread terminated mid-execution")))
    }

    pub(crate) fn mark_suspended(&mut self) {
        self.state = InstanceState::Suspended;
    }

    /// Close out a finished cycle, returning the instance to `idle`.
    pub(crate) fn finish_cycle(&mut self) {
        self.events = None;
        self.resume_tx = None;
        if self.state != InstanceState::Terminated {
            self.state = InstanceState::Idle;
        }
    }

    /// Request a cooperative abort of the running script.
    pub(crate) fn trigger_interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    /// Clear script state so the instance can serve another execution. The
    /// underlying engine is kept; only the context is replaced.
    pub(crate) async fn reset(&mut self) -> Result<(), Error> {
        if self.state == InstanceState::Terminated {
            return Err(Error::Runtime(anyhow!("reset on a terminated instance")));
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Reset { done: done_tx })
            .map_err(|_| Error::Runtime(anyhow!("sandbox thread terminated")))?;
        done_rx
            .await
            .map_err(|_| Error::Runtime(anyhow!("sandbox thread terminated during reset")))?
            .map_err(|message| Error::Runtime(anyhow!(message)))?;
        self.events = None;
        self.resume_tx = None;
        self.state = InstanceState::Idle;
        Ok(())
    }

    /// Mark the instance unusable. Idempotent; dropping the instance closes
    /// its channels, which unwinds any parked execution and stops the thread.
    pub(crate) fn terminate(&mut self) {
        self.state = InstanceState::Terminated;
        self.events = None;
        self.resume_tx = None;
    }
}

/// Engine objects confined to the instance thread.
struct EngineState {
    bridge: HostBridge,
    context: Context,
    runtime: rquickjs::Runtime,
}

impl EngineState {
    fn new(settings: &SandboxSettings, interrupt: &Arc<AtomicBool>) -> Result<Self, String> {
        let runtime =
            rquickjs::Runtime::new().map_err(|e| format!("engine allocation failed: {e}"))?;
        runtime.set_memory_limit(settings.memory_limit_bytes);
        runtime.set_max_stack_size(settings.stack_size_bytes);
        if let Some(threshold) = settings.gc_threshold_bytes {
            runtime.set_gc_threshold(threshold);
        }
        let flag = Arc::clone(interrupt);
        runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::Relaxed))));

        let (context, bridge) = Self::fresh_context(&runtime)?;
        Ok(Self {
            bridge,
            context,
            runtime,
        })
    }

    fn fresh_context(runtime: &rquickjs::Runtime) -> Result<(Context, HostBridge), String> {
        let context =
            Context::full(runtime).map_err(|e| format!("context allocation failed: {e}"))?;
        let bridge = HostBridge::default();
        context
            .with(|ctx| host::install(&ctx, &bridge))
            .map_err(|e| format!("host bridge install failed: {e}"))?;
        Ok((context, bridge))
    }

    fn reset(&mut self) -> Result<(), String> {
        let (context, bridge) = Self::fresh_context(&self.runtime)?;
        self.context = context;
        self.bridge = bridge;
        Ok(())
    }
}

fn instance_thread(
    settings: &SandboxSettings,
    commands: &mpsc::Receiver<Command>,
    interrupt: &Arc<AtomicBool>,
    memory_used: &Arc<AtomicU64>,
    init: oneshot::Sender<Result<(), String>>,
) {
    let mut engine = match EngineState::new(settings, interrupt) {
        Ok(engine) => {
            if init.send(Ok(())).is_err() {
                return;
            }
            engine
        }
        Err(message) => {
            let _ = init.send(Err(message));
            return;
        }
    };

    while let Ok(command) = commands.recv() {
        match command {
            Command::Execute {
                artifact,
                context,
                events,
                resume,
            } => {
                run_execution(
                    &mut engine,
                    settings,
                    interrupt,
                    memory_used,
                    &artifact,
                    *context,
                    &events,
                    resume,
                );
            }
            Command::Reset { done } => {
                let _ = done.send(engine.reset());
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_execution(
    engine: &mut EngineState,
    settings: &SandboxSettings,
    interrupt: &Arc<AtomicBool>,
    memory_used: &Arc<AtomicU64>,
    artifact: &Arc<CompiledArtifact>,
    input: ExecutionContext,
    events: &async_mpsc::UnboundedSender<ExecEvent>,
    resume: mpsc::Receiver<AsyncResult>,
) {
    engine.bridge.seed(ExecutionEnv {
        snapshot: input.state_snapshot,
        state_types: input.state_types,
        capabilities: input.granted_capabilities,
        registry: input.extension_registry,
        effects: Effects::default(),
        host_call_count: 0,
        panel_id: input.panel_id,
        events: Some(events.clone()),
        resume: Some(resume),
    });

    let EngineState {
        bridge,
        context,
        runtime,
    } = engine;
    let was_interrupted = || interrupt.load(Ordering::Relaxed);

    let run = context.with(|ctx| -> Result<Option<RuntimeValue>, ErrorEnvelope> {
        let internal = |e: rquickjs::Error| {
            ErrorEnvelope::new(ErrorCode::RuntimeError, format!("engine failure: {e}"))
        };

        let freezer = convert::Freezer::new(&ctx).map_err(internal)?;
        let args = freezer
            .deep_frozen(&ctx, &input.args)
            .map_err(internal)?;
        ctx.globals().set("$args", args).map_err(internal)?;
        let scope = freezer
            .deep_frozen(&ctx, &RuntimeValue::Map(input.scope_variables))
            .map_err(internal)?;
        ctx.globals().set("$scope", scope).map_err(internal)?;

        let module_name = format!("panel-{}.js", &artifact.fingerprint_hex()[..16]);
        let declared = Module::declare(ctx.clone(), module_name, artifact.module_source())
            .catch(&ctx)
            .map_err(|e| classify_caught(&e, false, artifact.handler_source()))?;
        let (module, promise) = declared
            .eval()
            .catch(&ctx)
            .map_err(|e| classify_caught(&e, false, artifact.handler_source()))?;
        promise
            .finish::<()>()
            .catch(&ctx)
            .map_err(|e| classify_caught(&e, false, artifact.handler_source()))?;
        let function: Function = module
            .get(HANDLER_EXPORT)
            .catch(&ctx)
            .map_err(|e| classify_caught(&e, false, artifact.handler_source()))?;

        // An immediately-resolved promise settles through `finish`; a pending
        // one (nothing in the sandbox can settle it later) is an error.
        let outcome = function
            .call::<_, MaybePromise>(())
            .and_then(|maybe| maybe.finish::<Value>())
            .catch(&ctx);
        match outcome {
            Ok(value) => {
                if value.is_undefined() {
                    Ok(None)
                } else {
                    convert::js_to_value(&value).map(Some).map_err(|e| {
                        ErrorEnvelope::new(
                            ErrorCode::RuntimeError,
                            format!("handler return value: {e}"),
                        )
                    })
                }
            }
            Err(caught) => Err(classify_caught(
                &caught,
                was_interrupted(),
                artifact.handler_source(),
            )),
        }
    });

    let (effects, host_call_count) = bridge.drain();
    let usage = runtime.memory_usage();
    let used = u64::try_from(usage.memory_used_size.max(0)).unwrap_or(0);
    memory_used.store(used, Ordering::Relaxed);
    if settings.run_gc_after_execution {
        context.with(|ctx| ctx.run_gc());
    }

    let outcome = match run {
        Ok(return_value) => RunOutcome {
            return_value,
            error: None,
            effects,
            host_call_count,
        },
        Err(error) => RunOutcome {
            return_value: None,
            error: Some(error),
            effects,
            host_call_count,
        },
    };
    let _ = events.send(ExecEvent::Finished(Box::new(outcome)));
}

/// Map an uncaught script failure onto a stable error envelope.
///
/// Structured failures thrown by the host bridge carry a `code` property and
/// keep it; everything else is classified from the interrupt flag, the
/// engine message, and the exception shape. The engine throws a bare null
/// when it cannot allocate an error object, which with a configured memory
/// limit means the script ran out of heap.
pub(crate) fn classify_caught(
    caught: &CaughtError<'_>,
    interrupted: bool,
    handler_source: &str,
) -> ErrorEnvelope {
    match caught {
        CaughtError::Exception(exception) => {
            let message = exception
                .message()
                .unwrap_or_else(|| "uncaught exception".to_owned());
            let code: Option<String> = exception
                .as_object()
                .get::<_, Option<String>>("code")
                .ok()
                .flatten();
            if let Some(code) = code {
                let mapped = match code.as_str() {
                    "capability_denied" => Some(ErrorCode::CapabilityDenied),
                    "type_mismatch" => Some(ErrorCode::TypeMismatch),
                    "unknown_extension" => Some(ErrorCode::UnknownExtension),
                    _ => None,
                };
                if let Some(mapped) = mapped {
                    let mut envelope = ErrorEnvelope::new(mapped, message);
                    if let Some(required) = exception
                        .as_object()
                        .get::<_, Option<String>>("required")
                        .ok()
                        .flatten()
                    {
                        envelope = envelope.with_required_capability(required);
                    }
                    return envelope;
                }
            }

            if interrupted {
                return timeout_envelope();
            }
            if is_memory_message(&message) {
                return ErrorEnvelope::new(ErrorCode::MemoryLimit, message);
            }

            let name: Option<String> = exception
                .as_object()
                .get::<_, Option<String>>("name")
                .ok()
                .flatten();
            let code = if name.as_deref() == Some("SyntaxError") {
                ErrorCode::CompileError
            } else {
                ErrorCode::RuntimeError
            };
            let mut envelope = ErrorEnvelope::new(code, message);
            let stack: Option<String> = exception
                .as_object()
                .get::<_, Option<String>>("stack")
                .ok()
                .flatten();
            if let Some(location) = stack.as_deref().and_then(stack_location) {
                envelope = envelope.with_location(location);
                if let Some(snippet) = source_snippet(handler_source, location.line) {
                    envelope = envelope.with_snippet(snippet);
                }
            }
            envelope
        }
        CaughtError::Value(value) => {
            if interrupted {
                return timeout_envelope();
            }
            if value.is_null() || value.is_undefined() {
                return ErrorEnvelope::new(ErrorCode::MemoryLimit, "out of memory");
            }
            ErrorEnvelope::new(
                ErrorCode::RuntimeError,
                format!("uncaught thrown value of type {}", value.type_name()),
            )
        }
        CaughtError::Error(error) => {
            let message = error.to_string();
            if interrupted {
                return timeout_envelope();
            }
            if is_memory_message(&message) {
                return ErrorEnvelope::new(ErrorCode::MemoryLimit, message);
            }
            ErrorEnvelope::new(ErrorCode::RuntimeError, message)
        }
    }
}

fn timeout_envelope() -> ErrorEnvelope {
    ErrorEnvelope::new(ErrorCode::Timeout, "execution exceeded its time budget")
}

fn is_memory_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("out of memory")
        || lower.contains("memory limit")
        || lower.contains("stack overflow")
}

/// Pull the first `file:line[:column]` pair out of an engine stack trace and
/// shift it from wrapped-module coordinates back into handler coordinates.
pub(crate) fn stack_location(stack: &str) -> Option<SourceLocation> {
    for line in stack.lines() {
        let frame = line.trim_end_matches(')');
        let mut numbers = frame
            .rsplit(':')
            .take(2)
            .map(str::parse::<u32>)
            .collect::<Vec<_>>();
        numbers.reverse();
        let location = match numbers.as_slice() {
            [Ok(line), Ok(column)] => Some((*line, Some(*column))),
            [_, Ok(line)] | [Ok(line)] => Some((*line, None)),
            _ => None,
        };
        if let Some((line, column)) = location {
            let line = line.saturating_sub(SOURCE_LINE_OFFSET).max(1);
            return Some(SourceLocation { line, column });
        }
    }
    None
}

fn source_snippet(handler_source: &str, line: u32) -> Option<String> {
    handler_source
        .lines()
        .nth(line.saturating_sub(1) as usize)
        .map(|l| l.trim_end().to_owned())
}
