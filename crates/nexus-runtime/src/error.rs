use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Stable machine-readable error codes carried by [`ErrorEnvelope`].
///
/// The string forms are part of the wire contract and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    CompileError,
    RuntimeError,
    Timeout,
    MemoryLimit,
    CapabilityDenied,
    TypeMismatch,
    UnknownExtension,
    UnknownSuspension,
    SuspensionTimeout,
    PoolShutdown,
    InitializationError,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CompileError => "compile_error",
            Self::RuntimeError => "runtime_error",
            Self::Timeout => "timeout",
            Self::MemoryLimit => "memory_limit",
            Self::CapabilityDenied => "capability_denied",
            Self::TypeMismatch => "type_mismatch",
            Self::UnknownExtension => "unknown_extension",
            Self::UnknownSuspension => "unknown_suspension",
            Self::SuspensionTimeout => "suspension_timeout",
            Self::PoolShutdown => "pool_shutdown",
            Self::InitializationError => "initialization_error",
        }
    }

    /// Whether a failure with this code poisons the sandbox instance.
    ///
    /// Instances that hit a resource cap or an uncaught script error are
    /// dropped; everything else is reset and returned to the pool.
    #[must_use]
    pub(crate) const fn terminates_sandbox(self) -> bool {
        matches!(self, Self::RuntimeError | Self::Timeout | Self::MemoryLimit)
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best-effort location of a failure inside the handler source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    /// 1-based line in the handler fragment.
    pub line: u32,
    pub column: Option<u32>,
}

/// Error envelope embedded in an execution result.
///
/// The primary `message` is always a classified message; raw engine text is
/// never surfaced as the code itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEnvelope {
    pub code: ErrorCode,
    pub message: String,
    pub source_location: Option<SourceLocation>,
    pub snippet: Option<String>,
    /// The token that failed the check, present for `capability_denied`.
    pub required_capability: Option<String>,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source_location: None,
            snippet: None,
            required_capability: None,
        }
    }

    #[must_use]
    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.source_location = Some(location);
        self
    }

    #[must_use]
    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    #[must_use]
    pub fn with_required_capability(mut self, token: impl Into<String>) -> Self {
        self.required_capability = Some(token.into());
        self
    }
}

impl core::fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Embedder-facing runtime failure.
///
/// Handler-level failures are reported inside the execution result envelope;
/// this type covers faults of the runtime itself.
#[derive(Error, Debug)]
pub enum Error {
    /// The runtime or a sandbox could not be created.
    #[error("initialization error: {0}")]
    Initialization(#[source] anyhow::Error),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Handler source failed to compile.
    #[error("compile error: {0}")]
    Compile(#[from] crate::cache::CompileError),

    /// Internal runtime failure (engine thread, channel plumbing).
    #[error("runtime error: {0}")]
    Runtime(#[source] anyhow::Error),

    /// Filesystem I/O error (compiled-artifact cache).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::CapabilityDenied.as_str(), "capability_denied");
        assert_eq!(ErrorCode::UnknownSuspension.as_str(), "unknown_suspension");
        assert_eq!(ErrorCode::Timeout.to_string(), "timeout");
    }

    #[test]
    fn termination_policy() {
        assert!(ErrorCode::Timeout.terminates_sandbox());
        assert!(ErrorCode::MemoryLimit.terminates_sandbox());
        assert!(ErrorCode::RuntimeError.terminates_sandbox());
        assert!(!ErrorCode::CapabilityDenied.terminates_sandbox());
        assert!(!ErrorCode::TypeMismatch.terminates_sandbox());
        assert!(!ErrorCode::CompileError.terminates_sandbox());
        assert!(!ErrorCode::UnknownExtension.terminates_sandbox());
    }
}
