//! Executor: drives handler invocations through the cache, pool and sandbox,
//! applying the per-error-code instance disposition and collecting metrics.

use std::{collections::BTreeSet, sync::Arc, time::Duration, time::Instant};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::Instrument as _;

use crate::{
    cache::{CompilationCache, CompileError, CompiledArtifact},
    capability::CapabilityToken,
    config::RuntimeConfig,
    error::{Error, ErrorCode, ErrorEnvelope, Result},
    exec::{
        AsyncResult, ExecutionContext, ExecutionMetrics, ExecutionResult, ExecutionStatus,
        Suspension,
    },
    pool::{AcquireError, InstancePool, Lease},
    sandbox::{Effects, ExecEvent},
    stats::{RuntimeStats, StatsRecorder},
};

/// How long an interrupted script gets to unwind before its instance is
/// dropped without a final outcome.
const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

/// The panel runtime: an instance pool, a compilation cache and the executor
/// over them. One value per process-wide embedding; all shared state is owned
/// here, not in module globals.
pub struct Runtime {
    config: RuntimeConfig,
    cache: Arc<CompilationCache>,
    pool: Arc<InstancePool>,
    stats: StatsRecorder,
    prometheus: Option<PrometheusHandle>,
}

impl Runtime {
    /// Validate the configuration and assemble the runtime.
    ///
    /// Installs a process-global Prometheus recorder on first construction;
    /// when another recorder is already installed, metric emission still
    /// flows to it but [`Runtime::prometheus_metrics`] renders empty.
    ///
    /// # Errors
    /// Returns an error for a rejected configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let prometheus = match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!("metrics recorder already installed, exposition degraded: {err}");
                None
            }
        };
        let cache = Arc::new(CompilationCache::new(&config));
        let pool = Arc::new(InstancePool::new(&config));
        tracing::info!(
            max_instances = config.max_instances,
            memory_limit_bytes = config.memory_limit_bytes,
            "panel runtime initialized"
        );
        Ok(Self {
            config,
            cache,
            pool,
            stats: StatsRecorder::default(),
            prometheus,
        })
    }

    /// Execute a handler from source, compiling through the cache.
    ///
    /// Handler-level failures are reported inside the returned envelope;
    /// `Err` is reserved for faults of the runtime itself.
    ///
    /// # Errors
    /// Returns an error when the sandbox plumbing fails.
    pub async fn execute_handler(
        &self,
        source: &str,
        context: ExecutionContext,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let output = match self.cache.get_or_compile(source).await {
            Ok(output) => output,
            Err(err) => {
                let metrics = ExecutionMetrics {
                    compile_cache_hit: false,
                    compile_duration_us: duration_us(started.elapsed()),
                    ..ExecutionMetrics::default()
                };
                let result = ExecutionResult::error(compile_envelope(&err, source), metrics);
                self.finish_metrics(&result);
                return Ok(result);
            }
        };
        self.execute_artifact_inner(
            output.artifact,
            context,
            timeout,
            output.cache_hit,
            output.compile_duration,
        )
        .await
    }

    /// Compile a handler into the cache without executing it.
    ///
    /// # Errors
    /// Returns [`Error::Compile`] when the source fails to parse.
    pub async fn precompile_handler(&self, source: &str) -> Result<Arc<CompiledArtifact>> {
        let output = self.cache.get_or_compile(source).await?;
        Ok(output.artifact)
    }

    /// Execute a previously compiled artifact.
    ///
    /// # Errors
    /// Returns an error when the sandbox plumbing fails.
    pub async fn execute_compiled_handler(
        &self,
        artifact: Arc<CompiledArtifact>,
        context: ExecutionContext,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        self.execute_artifact_inner(artifact, context, timeout, true, Duration::ZERO)
            .await
    }

    /// Deliver an async outcome to a suspended execution and run it to its
    /// next completion or suspension.
    ///
    /// # Errors
    /// Returns an error when the sandbox plumbing fails.
    pub async fn resume_handler(
        &self,
        suspension_id: &str,
        result: AsyncResult,
    ) -> Result<ExecutionResult> {
        let span = tracing::info_span!("handler.resume", %suspension_id);
        async {
            let Some(mut lease) = self.pool.take_suspended(suspension_id) else {
                return Ok(ExecutionResult::error(
                    ErrorEnvelope::new(
                        ErrorCode::UnknownSuspension,
                        format!("unknown or expired suspension id {suspension_id:?}"),
                    ),
                    ExecutionMetrics::default(),
                ));
            };
            if let Err(e) = lease.instance.deliver_resume(result) {
                lease.instance.terminate();
                self.pool.discard(lease);
                return Err(e);
            }
            self.drive_cycle(lease, self.config.execution_timeout, ExecutionMetrics::default())
                .await
        }
        .instrument(span)
        .await
    }

    /// Propose capability tokens for a handler source. Best effort and never
    /// a security mechanism; enforcement happens on every host call.
    #[must_use]
    pub fn infer_capabilities(&self, source: &str) -> BTreeSet<CapabilityToken> {
        crate::infer::infer_capabilities(source)
    }

    #[must_use]
    pub fn stats(&self) -> RuntimeStats {
        self.stats.snapshot(
            self.cache.stats(),
            self.pool.active_count(),
            self.pool.idle_count(),
            self.pool.suspended_count(),
        )
    }

    /// Render the standard Prometheus text exposition. Empty when the
    /// recorder is owned by another embedding.
    #[must_use]
    pub fn prometheus_metrics(&self) -> String {
        self.prometheus.as_ref().map_or_else(String::new, |handle| {
            handle.run_upkeep();
            handle.render()
        })
    }

    /// Shut the pool down: waiters wake with `pool_shutdown`, suspended
    /// instances are dropped and their ids invalidated. Idempotent.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        tracing::info!("panel runtime shut down");
    }

    async fn execute_artifact_inner(
        &self,
        artifact: Arc<CompiledArtifact>,
        context: ExecutionContext,
        timeout: Option<Duration>,
        cache_hit: bool,
        compile_duration: Duration,
    ) -> Result<ExecutionResult> {
        let timeout = timeout.unwrap_or(self.config.execution_timeout);
        let span = tracing::info_span!(
            "handler.execute",
            panel_id = %context.panel_id,
            handler = %context.handler_name,
        );
        async {
            let base = ExecutionMetrics {
                compile_cache_hit: cache_hit,
                compile_duration_us: duration_us(compile_duration),
                ..ExecutionMetrics::default()
            };

            let mut lease = match self.pool.acquire().await {
                Ok(lease) => lease,
                Err(AcquireError::Shutdown) => {
                    let result = ExecutionResult::error(
                        ErrorEnvelope::new(ErrorCode::PoolShutdown, "instance pool is shut down"),
                        base,
                    );
                    self.finish_metrics(&result);
                    return Ok(result);
                }
                Err(AcquireError::Init(e)) => {
                    let result = ExecutionResult::error(
                        ErrorEnvelope::new(
                            ErrorCode::InitializationError,
                            format!("sandbox could not be created: {e}"),
                        ),
                        base,
                    );
                    self.finish_metrics(&result);
                    return Ok(result);
                }
            };

            if let Err(e) = lease.instance.begin_execute(artifact, context) {
                lease.instance.terminate();
                self.pool.discard(lease);
                return Err(e);
            }
            self.drive_cycle(lease, timeout, base).await
        }
        .instrument(span)
        .await
    }

    /// Await the next suspension or completion of a running cycle and settle
    /// the instance accordingly.
    async fn drive_cycle(
        &self,
        mut lease: Lease,
        timeout: Duration,
        base: ExecutionMetrics,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, lease.instance.next_event()).await {
            Ok(Ok(ExecEvent::Suspended {
                suspension,
                effects,
                host_call_count,
            })) => Ok(self.settle_suspended(lease, suspension, effects, host_call_count, started, base)),
            Ok(Ok(ExecEvent::Finished(outcome))) => {
                lease.instance.finish_cycle();
                let metrics = ExecutionMetrics {
                    execution_duration_us: duration_us(started.elapsed()),
                    peak_memory_bytes: lease.instance.memory_used(),
                    host_call_count: outcome.host_call_count,
                    ..base
                };
                let code = outcome.error.as_ref().map(|e| e.code);
                let result = ExecutionResult {
                    status: if outcome.error.is_some() {
                        ExecutionStatus::Error
                    } else {
                        ExecutionStatus::Success
                    },
                    return_value: outcome.return_value,
                    state_mutations: outcome.effects.state_mutations,
                    emitted_events: outcome.effects.emitted_events,
                    view_commands: outcome.effects.view_commands,
                    logs: outcome.effects.logs,
                    suspension: None,
                    error: outcome.error,
                    metrics,
                };
                self.finish_metrics(&result);

                match code {
                    Some(code) if code.terminates_sandbox() => {
                        lease.instance.terminate();
                        self.pool.discard(lease);
                    }
                    _ => self.pool.release(lease).await,
                }
                Ok(result)
            }
            Ok(Err(e)) => {
                lease.instance.terminate();
                self.pool.discard(lease);
                Err(e)
            }
            Err(_elapsed) => Ok(self.settle_timeout(lease, started, base).await),
        }
    }

    fn settle_suspended(
        &self,
        mut lease: Lease,
        suspension: Suspension,
        effects: Effects,
        host_call_count: u64,
        started: Instant,
        base: ExecutionMetrics,
    ) -> ExecutionResult {
        lease.instance.mark_suspended();
        let metrics = ExecutionMetrics {
            execution_duration_us: duration_us(started.elapsed()),
            peak_memory_bytes: lease.instance.memory_used(),
            host_call_count,
            ..base
        };
        let id = suspension.id.clone();
        self.pool.park_suspended(lease, &id);
        ExecutionResult {
            status: ExecutionStatus::Suspended,
            return_value: None,
            state_mutations: effects.state_mutations,
            emitted_events: effects.emitted_events,
            view_commands: effects.view_commands,
            logs: effects.logs,
            suspension: Some(suspension),
            error: None,
            metrics,
        }
    }

    /// Cooperatively abort an overrunning script, keeping whatever effects
    /// it produced before the deadline.
    async fn settle_timeout(
        &self,
        mut lease: Lease,
        started: Instant,
        base: ExecutionMetrics,
    ) -> ExecutionResult {
        lease.instance.trigger_interrupt();

        let mut effects = Effects::default();
        let mut host_call_count = 0;
        match tokio::time::timeout(INTERRUPT_GRACE, lease.instance.next_event()).await {
            Ok(Ok(ExecEvent::Finished(outcome))) => {
                effects = outcome.effects;
                host_call_count = outcome.host_call_count;
            }
            Ok(Ok(ExecEvent::Suspended {
                effects: partial,
                host_call_count: calls,
                ..
            })) => {
                // Raced a suspension; dropping the lease below closes the
                // resume channel and unwinds the parked script.
                effects = partial;
                host_call_count = calls;
            }
            _ => {
                tracing::warn!(
                    instance = lease.instance.id(),
                    "script did not honor the interrupt, dropping instance"
                );
            }
        }

        let metrics = ExecutionMetrics {
            execution_duration_us: duration_us(started.elapsed()),
            peak_memory_bytes: lease.instance.memory_used(),
            host_call_count,
            ..base
        };
        let result = ExecutionResult {
            status: ExecutionStatus::Error,
            return_value: None,
            state_mutations: effects.state_mutations,
            emitted_events: effects.emitted_events,
            view_commands: effects.view_commands,
            logs: effects.logs,
            suspension: None,
            error: Some(ErrorEnvelope::new(
                ErrorCode::Timeout,
                "execution exceeded its time budget",
            )),
            metrics,
        };
        self.finish_metrics(&result);

        lease.instance.terminate();
        self.pool.discard(lease);
        result
    }

    /// Record stats and emit the terminal-outcome metrics for a result.
    fn finish_metrics(&self, result: &ExecutionResult) {
        if result.status == ExecutionStatus::Suspended {
            return;
        }
        let code = result.error.as_ref().map(|e| e.code);
        let status = match code {
            None => "success",
            Some(ErrorCode::Timeout) => "timeout",
            Some(_) => "error",
        };
        metrics::counter!("nexus_handler_executions_total", "status" => status).increment(1);
        metrics::histogram!("nexus_handler_execution_duration_us")
            .record(result.metrics.execution_duration_us as f64);
        metrics::gauge!("nexus_handler_memory_peak_bytes")
            .set(result.metrics.peak_memory_bytes as f64);
        self.stats.record(
            code,
            result.metrics.execution_duration_us,
            result.metrics.peak_memory_bytes,
        );
    }
}

fn compile_envelope(err: &CompileError, source: &str) -> ErrorEnvelope {
    let mut envelope = ErrorEnvelope::new(ErrorCode::CompileError, err.message.clone());
    if let Some(location) = err.location {
        envelope = envelope.with_location(location);
        if let Some(snippet) = source
            .lines()
            .nth(location.line.saturating_sub(1) as usize)
        {
            envelope = envelope.with_snippet(snippet.trim_end());
        }
    }
    envelope
}

#[allow(clippy::cast_possible_truncation)]
fn duration_us(duration: Duration) -> u64 {
    duration.as_micros() as u64
}
