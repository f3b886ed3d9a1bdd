//! Input and output envelopes for one handler invocation.

use std::collections::{BTreeMap, BTreeSet};

use crate::{capability::CapabilitySet, error::ErrorEnvelope, value::RuntimeValue};

/// Declared type of a panel state key, used to validate `state_set`.
///
/// Null is accepted for every declared type; `Float` also accepts integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeclaredType {
    Bool,
    Int,
    Float,
    String,
    List,
    Map,
}

impl DeclaredType {
    #[must_use]
    pub const fn accepts(self, value: &RuntimeValue) -> bool {
        match (self, value) {
            (_, RuntimeValue::Null)
            | (Self::Bool, RuntimeValue::Bool(_))
            | (Self::Int, RuntimeValue::Int(_))
            | (Self::Float, RuntimeValue::Float(_) | RuntimeValue::Int(_))
            | (Self::String, RuntimeValue::String(_))
            | (Self::List, RuntimeValue::List(_))
            | (Self::Map, RuntimeValue::Map(_)) => true,
            _ => false,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::List => "list",
            Self::Map => "map",
        }
    }
}

/// The `(extension, method)` pairs declared callable for one execution.
#[derive(Clone, Debug, Default)]
pub struct ExtensionRegistry {
    methods: BTreeSet<(String, String)>,
}

impl ExtensionRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            methods: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, extension: impl Into<String>, method: impl Into<String>) {
        self.methods.insert((extension.into(), method.into()));
    }

    #[must_use]
    pub fn contains(&self, extension: &str, method: &str) -> bool {
        self.methods
            .iter()
            .any(|(e, m)| e == extension && m == method)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<E: Into<String>, M: Into<String>> FromIterator<(E, M)> for ExtensionRegistry {
    fn from_iter<I: IntoIterator<Item = (E, M)>>(iter: I) -> Self {
        let mut registry = Self::new();
        for (extension, method) in iter {
            registry.insert(extension, method);
        }
        registry
    }
}

/// Input to one handler execution.
#[derive(Clone, Debug, Default)]
pub struct ExecutionContext {
    /// Opaque panel identifier, used for logging and metrics only.
    pub panel_id: String,
    /// Handler name, used for diagnostics only.
    pub handler_name: String,
    pub state_snapshot: BTreeMap<String, RuntimeValue>,
    /// Declared types for state keys; keys without an entry accept any value.
    pub state_types: BTreeMap<String, DeclaredType>,
    pub args: RuntimeValue,
    /// Lexical enclosures (for example iteration bindings), exposed as `$scope`.
    pub scope_variables: BTreeMap<String, RuntimeValue>,
    pub granted_capabilities: CapabilitySet,
    pub extension_registry: ExtensionRegistry,
}

/// One recorded state mutation, in handler call order.
///
/// Deletes are a distinct marker rather than a set-to-null.
#[derive(Clone, Debug, PartialEq)]
pub enum StateMutation {
    Set { key: String, value: RuntimeValue },
    Delete { key: String },
}

impl StateMutation {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EmittedEvent {
    pub name: String,
    pub payload: RuntimeValue,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ViewCommand {
    pub target: String,
    pub command: String,
    /// The call's argument list as a runtime value.
    pub args: RuntimeValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn parse(level: &str) -> Self {
        match level {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Out-of-band log line produced by `$log`.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub data: Option<RuntimeValue>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Suspended,
    Error,
}

/// A pending external call; the execution parks until
/// [`Runtime::resume_handler`](crate::Runtime::resume_handler) delivers its
/// outcome under the same id.
#[derive(Clone, Debug)]
pub struct Suspension {
    pub id: String,
    pub extension: String,
    pub method: String,
    pub args: RuntimeValue,
}

/// Outcome of the external async call a suspension waited for.
#[derive(Clone, Debug)]
pub enum AsyncResult {
    Success(RuntimeValue),
    Failure {
        message: String,
        code: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutionMetrics {
    pub execution_duration_us: u64,
    pub peak_memory_bytes: u64,
    pub host_call_count: u64,
    pub compile_cache_hit: bool,
    pub compile_duration_us: u64,
}

/// Output of one execute or resume call.
///
/// Effect lists accumulate across suspend/resume cycles of the same logical
/// execution: a suspended envelope carries the effects so far, and each later
/// envelope is an extension of it, so a caller flushing intermediates only
/// needs to remember the already-flushed prefix length.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    /// Present when `status == Success` and the handler returned a value.
    pub return_value: Option<RuntimeValue>,
    pub state_mutations: Vec<StateMutation>,
    pub emitted_events: Vec<EmittedEvent>,
    pub view_commands: Vec<ViewCommand>,
    pub logs: Vec<LogEntry>,
    pub suspension: Option<Suspension>,
    pub error: Option<ErrorEnvelope>,
    pub metrics: ExecutionMetrics,
}

impl ExecutionResult {
    pub(crate) fn error(envelope: ErrorEnvelope, metrics: ExecutionMetrics) -> Self {
        Self {
            status: ExecutionStatus::Error,
            return_value: None,
            state_mutations: Vec::new(),
            emitted_events: Vec::new(),
            view_commands: Vec::new(),
            logs: Vec::new(),
            suspension: None,
            error: Some(envelope),
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_types_accept_null_and_widen_ints() {
        assert!(DeclaredType::Int.accepts(&RuntimeValue::Null));
        assert!(DeclaredType::Float.accepts(&RuntimeValue::Int(3)));
        assert!(!DeclaredType::Int.accepts(&RuntimeValue::Float(3.0)));
        assert!(!DeclaredType::String.accepts(&RuntimeValue::Bool(true)));
        assert!(DeclaredType::Map.accepts(&RuntimeValue::Map(BTreeMap::new())));
    }

    #[test]
    fn extension_registry_lookup() {
        let registry: ExtensionRegistry = [("http", "get"), ("db", "query")].into_iter().collect();
        assert!(registry.contains("http", "get"));
        assert!(!registry.contains("http", "post"));
        assert!(!registry.contains("mail", "send"));
    }

    #[test]
    fn log_level_parsing_defaults_to_info() {
        assert_eq!(LogLevel::parse("warn"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("verbose"), LogLevel::Info);
    }
}
