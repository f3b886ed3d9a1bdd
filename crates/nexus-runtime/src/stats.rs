use std::sync::atomic::{AtomicU64, Ordering};

use crate::{cache::CacheStats, error::ErrorCode};

/// Aggregate runtime statistics, independent of the metrics recorder.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RuntimeStats {
    pub executions_succeeded: u64,
    pub executions_failed: u64,
    pub executions_timed_out: u64,
    /// Mean duration of terminal execute/resume cycles.
    pub average_execution_us: u64,
    pub peak_execution_us: u64,
    pub compile_cache_hits: u64,
    pub compile_cache_misses: u64,
    pub compile_cache_hit_rate: f64,
    pub cache_entry_count: usize,
    pub cache_total_bytes: usize,
    pub active_instances: usize,
    pub idle_instances: usize,
    pub suspended_instances: usize,
    pub peak_memory_bytes: u64,
}

#[derive(Default)]
pub(crate) struct StatsRecorder {
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    duration_total_us: AtomicU64,
    duration_peak_us: AtomicU64,
    memory_peak_bytes: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn record(&self, code: Option<ErrorCode>, duration_us: u64, memory_bytes: u64) {
        match code {
            None => self.succeeded.fetch_add(1, Ordering::Relaxed),
            Some(ErrorCode::Timeout) => self.timed_out.fetch_add(1, Ordering::Relaxed),
            Some(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        self.duration_total_us.fetch_add(duration_us, Ordering::Relaxed);
        self.duration_peak_us.fetch_max(duration_us, Ordering::Relaxed);
        self.memory_peak_bytes.fetch_max(memory_bytes, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(
        &self,
        cache: CacheStats,
        active: usize,
        idle: usize,
        suspended: usize,
    ) -> RuntimeStats {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let timed_out = self.timed_out.load(Ordering::Relaxed);
        let total = succeeded + failed + timed_out;
        let lookups = cache.hits + cache.misses;
        RuntimeStats {
            executions_succeeded: succeeded,
            executions_failed: failed,
            executions_timed_out: timed_out,
            average_execution_us: self.duration_total_us.load(Ordering::Relaxed) / total.max(1),
            peak_execution_us: self.duration_peak_us.load(Ordering::Relaxed),
            compile_cache_hits: cache.hits,
            compile_cache_misses: cache.misses,
            compile_cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                cache.hits as f64 / lookups as f64
            },
            cache_entry_count: cache.entry_count,
            cache_total_bytes: cache.total_bytes,
            active_instances: active,
            idle_instances: idle,
            suspended_instances: suspended,
            peak_memory_bytes: self.memory_peak_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_aggregates_outcomes() {
        let recorder = StatsRecorder::default();
        recorder.record(None, 100, 1024);
        recorder.record(Some(ErrorCode::RuntimeError), 300, 4096);
        recorder.record(Some(ErrorCode::Timeout), 200, 2048);

        let stats = recorder.snapshot(
            CacheStats {
                hits: 3,
                misses: 1,
                entry_count: 1,
                total_bytes: 64,
            },
            1,
            2,
            3,
        );
        assert_eq!(stats.executions_succeeded, 1);
        assert_eq!(stats.executions_failed, 1);
        assert_eq!(stats.executions_timed_out, 1);
        assert_eq!(stats.average_execution_us, 200);
        assert_eq!(stats.peak_execution_us, 300);
        assert_eq!(stats.peak_memory_bytes, 4096);
        assert!((stats.compile_cache_hit_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.active_instances, 1);
        assert_eq!(stats.idle_instances, 2);
        assert_eq!(stats.suspended_instances, 3);
    }

    #[test]
    fn empty_recorder_has_zero_rates() {
        let stats = StatsRecorder::default().snapshot(CacheStats::default(), 0, 0, 0);
        assert_eq!(stats.average_execution_us, 0);
        assert!(stats.compile_cache_hit_rate.abs() < f64::EPSILON);
    }
}
