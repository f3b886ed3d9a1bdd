use std::{path::PathBuf, time::Duration};

/// Runtime configuration, validated by [`Runtime::new`](crate::Runtime::new).
///
/// All knobs have production defaults; hosts that map environment variables
/// onto configuration do so before constructing the runtime.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Upper bound on outstanding sandboxes (idle + executing + suspended).
    pub max_instances: usize,
    /// Per-instance script heap cap.
    pub memory_limit_bytes: usize,
    /// Per-instance script stack cap.
    pub stack_size_bytes: usize,
    /// Default wall-clock budget for one execute/resume cycle.
    pub execution_timeout: Duration,
    /// How long a suspended instance waits for `resume_handler` before it is
    /// dropped and its suspension id invalidated.
    pub suspension_timeout: Duration,
    /// Directory for the on-disk compiled-artifact tier; `None` disables it.
    pub cache_dir: Option<PathBuf>,
    /// Byte budget of the in-memory artifact tier.
    pub max_cache_bytes: usize,
    /// Entry budget of the on-disk artifact tier.
    pub max_cache_disk_entries: usize,
    /// Allocation pressure at which the engine triggers GC; `None` keeps the
    /// engine default.
    pub gc_threshold_bytes: Option<usize>,
    /// Run a GC cycle after each handler call, before the instance is pooled.
    pub run_gc_after_execution: bool,
}

pub(crate) const MIN_MEMORY_LIMIT_BYTES: usize = 1 << 20;
pub(crate) const MIN_STACK_SIZE_BYTES: usize = 64 << 10;

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_instances: 10,
            memory_limit_bytes: 32 << 20,
            stack_size_bytes: 1 << 20,
            execution_timeout: Duration::from_millis(5000),
            suspension_timeout: Duration::from_millis(30_000),
            cache_dir: None,
            max_cache_bytes: 64 << 20,
            max_cache_disk_entries: 1000,
            gc_threshold_bytes: None,
            run_gc_after_execution: false,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub const fn max_instances(mut self, max_instances: usize) -> Self {
        self.max_instances = max_instances;
        self
    }

    #[must_use]
    pub const fn memory_limit_bytes(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn stack_size_bytes(mut self, bytes: usize) -> Self {
        self.stack_size_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn suspension_timeout(mut self, timeout: Duration) -> Self {
        self.suspension_timeout = timeout;
        self
    }

    #[must_use]
    pub fn cache_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.cache_dir = dir;
        self
    }

    #[must_use]
    pub const fn max_cache_bytes(mut self, bytes: usize) -> Self {
        self.max_cache_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn max_cache_disk_entries(mut self, entries: usize) -> Self {
        self.max_cache_disk_entries = entries;
        self
    }

    #[must_use]
    pub const fn gc_threshold_bytes(mut self, bytes: Option<usize>) -> Self {
        self.gc_threshold_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn run_gc_after_execution(mut self, enabled: bool) -> Self {
        self.run_gc_after_execution = enabled;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.max_instances == 0 {
            return Err("max_instances must be at least 1".into());
        }
        if self.memory_limit_bytes < MIN_MEMORY_LIMIT_BYTES {
            return Err(format!(
                "memory_limit_bytes must be at least {MIN_MEMORY_LIMIT_BYTES}"
            ));
        }
        if self.stack_size_bytes < MIN_STACK_SIZE_BYTES {
            return Err(format!(
                "stack_size_bytes must be at least {MIN_STACK_SIZE_BYTES}"
            ));
        }
        if self.execution_timeout.is_zero() {
            return Err("execution_timeout must be non-zero".into());
        }
        if self.suspension_timeout.is_zero() {
            return Err("suspension_timeout must be non-zero".into());
        }
        Ok(())
    }
}
