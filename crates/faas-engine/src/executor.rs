use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sandbox::{ExecRequest, OutputCapture, ProcessExit};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::metrics::{MetricsRecord, MetricsSink};
use crate::pool::{ContainerSlot, PoolManager};
use crate::sampler::{MetricsSampler, SamplerReport};
use crate::types::{ExecutionError, ExecutionOutcome, ExecutionRequest, ExecutionResult};

/// Configuration for executions.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub sample_interval: Duration,
    /// Per-stream output cap.
    pub max_output_bytes: usize,
    pub max_code_bytes: usize,
}

/// Runs code in pooled containers.
///
/// Every call produces an outcome and a metrics record, whatever fails.
pub struct Executor {
    pool: Arc<PoolManager>,
    sink: Arc<dyn MetricsSink>,
    config: ExecutorConfig,
}

/// One execution, owned so it can run on a task of its own.
struct Execution {
    pool: Arc<PoolManager>,
    sink: Arc<dyn MetricsSink>,
    config: ExecutorConfig,
    request: ExecutionRequest,
}

enum RunStatus {
    Exited(sandbox::Result<ProcessExit>),
    TimedOut,
}

/// What an execution produced, before it is shaped into an outcome.
#[derive(Default)]
struct Finished {
    error: Option<ExecutionError>,
    stdout: String,
    stderr: String,
    truncated: bool,
    report: SamplerReport,
}

impl Finished {
    /// Failed before any code ran.
    fn early(error: ExecutionError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    fn into_outcome(self, request: &ExecutionRequest, timestamp: DateTime<Utc>) -> ExecutionOutcome {
        let success = self.error.is_none();
        let metrics = MetricsRecord {
            function_name: request.function_name.clone(),
            language: request.language,
            backend: request.backend,
            timestamp,
            response_time_ms: self.report.response_time_ms(),
            memory_usage_mb: self.report.peak_memory_mb,
            cpu_usage_percent: self.report.avg_cpu_percent,
            cpu_peak_percent: self.report.peak_cpu_percent,
            samples: self.report.samples,
            partial_metrics: self.report.partial(),
            error: !success,
            error_kind: self.error.as_ref().map(|e| e.kind().to_string()),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        };
        let result = ExecutionResult {
            output: self.stdout.trim_end_matches(['\n', '\r']).to_string(),
            stdout: self.stdout,
            stderr: self.stderr,
            success,
            error: self.error,
            output_truncated: self.truncated,
        };
        ExecutionOutcome { result, metrics }
    }
}

impl Executor {
    pub fn new(pool: Arc<PoolManager>, sink: Arc<dyn MetricsSink>, config: ExecutorConfig) -> Self {
        Self { pool, sink, config }
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    /// Run `request` once. Failures are part of the outcome, never an `Err`.
    ///
    /// The run is spawned: if the caller stops waiting, the execution still
    /// finishes under its own timeout, checks its container in and writes
    /// its metrics record.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        let execution = Execution {
            pool: Arc::clone(&self.pool),
            sink: Arc::clone(&self.sink),
            config: self.config.clone(),
            request: request.clone(),
        };
        match tokio::spawn(execution.run()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(function = %request.function_name, error = %e, "execution task failed");
                Finished::early(ExecutionError::Sandbox {
                    message: format!("execution task failed: {e}"),
                })
                .into_outcome(request, Utc::now())
            }
        }
    }
}

impl Execution {
    async fn run(self) -> ExecutionOutcome {
        let request = &self.request;
        let timestamp = Utc::now();
        let key = request.key();

        let finished = match request.validate(self.config.max_code_bytes) {
            Err(error) => Finished::early(error),
            Ok(()) => match self.pool.checkout(key).await {
                Ok(slot) => self.run_in_slot(slot, request).await,
                Err(e) => Finished::early(e.into()),
            },
        };
        let outcome = finished.into_outcome(request, timestamp);

        match &outcome.result.error {
            None => info!(
                function = %request.function_name,
                key = %key,
                response_time_ms = outcome.metrics.response_time_ms,
                "execution succeeded"
            ),
            Some(error) => warn!(
                function = %request.function_name,
                key = %key,
                kind = error.kind(),
                error = %error,
                "execution failed"
            ),
        }

        if let Err(e) = self.sink.record(&outcome.metrics).await {
            warn!(function = %request.function_name, error = %e, "failed to record metrics");
        }
        outcome
    }

    /// Inject the code, race it against the timeout while sampling, then
    /// check the slot back in exactly once.
    async fn run_in_slot(&self, mut slot: ContainerSlot, request: &ExecutionRequest) -> Finished {
        let capture = OutputCapture::new(self.config.max_output_bytes);
        let exec_request = ExecRequest {
            code: &request.code,
        };
        let timeout = request.timeout();

        let mut sampler = MetricsSampler::start(self.config.sample_interval);
        let status = {
            let sandbox = slot.sandbox();
            let run = async {
                tokio::select! {
                    result = sandbox.exec(&exec_request, &capture) => RunStatus::Exited(result),
                    () = tokio::time::sleep(timeout) => RunStatus::TimedOut,
                }
            };
            tokio::select! {
                status = run => status,
                never = sampler.watch(sandbox) => match never {},
            }
        };

        let (error, healthy) = match status {
            RunStatus::Exited(Ok(exit)) if exit.exit_code == 0 => (None, true),
            RunStatus::Exited(Ok(exit)) => {
                // The code failed, not the sandbox.
                slot.record_runtime_error();
                (
                    Some(ExecutionError::RuntimeExecution {
                        exit_code: exit.exit_code,
                    }),
                    true,
                )
            }
            RunStatus::Exited(Err(e)) => {
                warn!(container = %slot.id(), error = %e, "exec failed, discarding container");
                (
                    Some(ExecutionError::Sandbox {
                        message: e.to_string(),
                    }),
                    false,
                )
            }
            RunStatus::TimedOut => {
                warn!(
                    container = %slot.id(),
                    timeout_secs = request.timeout_secs,
                    "execution timed out, killing container"
                );
                if let Err(e) = slot.sandbox_mut().kill().await {
                    warn!(container = %slot.id(), error = %e, "kill failed");
                }
                (
                    Some(ExecutionError::Timeout {
                        timeout_secs: request.timeout_secs,
                    }),
                    false,
                )
            }
        };
        let report = sampler.finish(Instant::now());
        self.pool.checkin(slot, healthy);

        Finished {
            error,
            stdout: capture.stdout(),
            stderr: capture.stderr(),
            truncated: capture.truncated(),
            report,
        }
    }
}

#[cfg(test)]
mod tests {
    use sandbox::{Backend, Language};

    use super::*;
    use crate::metrics::MemorySink;
    use crate::pool::ExhaustionPolicy;
    use crate::testing::{eventually, fake_pool, test_config};

    fn request(code: &str, timeout_secs: u64) -> ExecutionRequest {
        ExecutionRequest {
            code: code.into(),
            language: Language::Python,
            timeout_secs,
            backend: Backend::Standard,
            function_name: "add".into(),
        }
    }

    fn executor(pool: Arc<PoolManager>, sink: Arc<MemorySink>) -> Executor {
        Executor::new(
            pool,
            sink,
            ExecutorConfig {
                sample_interval: Duration::from_millis(100),
                max_output_bytes: 1024,
                max_code_bytes: 64,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn successful_run_returns_output_and_reuses_container() {
        let (pool, fakes) = fake_pool(&test_config());
        let sink = Arc::new(MemorySink::default());
        let executor = executor(Arc::clone(&pool), Arc::clone(&sink));

        let outcome = executor.execute(&request("out:2", 5)).await;
        assert!(outcome.success(), "{outcome:?}");
        assert_eq!(outcome.result.output, "2");
        assert_eq!(outcome.result.stdout, "2\n");
        assert!(!outcome.metrics.error);
        assert!(outcome.metrics.response_time_ms > 0.0);
        assert!(outcome.metrics.response_time_ms < 5000.0);
        assert!(outcome.metrics.memory_usage_mb > 0.0);
        assert!(!outcome.metrics.partial_metrics);

        let key = request("", 1).key();
        assert_eq!(pool.stats(key).idle, 1);
        executor.execute(&request("out:3", 5)).await;
        assert_eq!(fakes.runc.created(), 1);
        assert_eq!(sink.records().len(), 2);

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_kills_and_destroys_container() {
        let (pool, fakes) = fake_pool(&test_config());
        let sink = Arc::new(MemorySink::default());
        let executor = executor(Arc::clone(&pool), Arc::clone(&sink));

        let outcome = executor.execute(&request("out:partial;hang", 2)).await;
        assert_eq!(
            outcome.result.error,
            Some(ExecutionError::Timeout { timeout_secs: 2 })
        );
        assert!(outcome.metrics.error);
        assert_eq!(outcome.metrics.error_kind.as_deref(), Some("timeout"));
        assert_eq!(outcome.result.stdout, "partial\n");
        assert!(outcome.metrics.response_time_ms >= 2000.0);
        assert_eq!(fakes.runc.kills(), 1);

        eventually("destroy", || fakes.runc.destroyed() == 1).await;
        let key = request("", 1).key();
        assert_eq!(pool.stats(key).idle, 0);
        assert_eq!(fakes.runc.live(), 0);

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn non_zero_exit_keeps_container() {
        let (pool, fakes) = fake_pool(&test_config());
        let executor = executor(Arc::clone(&pool), Arc::new(MemorySink::default()));

        let outcome = executor.execute(&request("err:Error: x;exit:1", 5)).await;
        assert_eq!(
            outcome.result.error,
            Some(ExecutionError::RuntimeExecution { exit_code: 1 })
        );
        assert_eq!(outcome.result.stderr, "Error: x\n");
        assert!(outcome.metrics.error);

        let key = request("", 1).key();
        assert_eq!(pool.stats(key).idle, 1);
        assert_eq!(fakes.runc.destroyed(), 0);

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exec_failure_discards_container() {
        let (pool, fakes) = fake_pool(&test_config());
        let executor = executor(Arc::clone(&pool), Arc::new(MemorySink::default()));

        let outcome = executor.execute(&request("out:a;crash", 5)).await;
        assert!(matches!(
            outcome.result.error,
            Some(ExecutionError::Sandbox { .. })
        ));
        assert_eq!(outcome.result.stdout, "a\n");
        eventually("destroy", || fakes.runc.destroyed() == 1).await;

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_request_never_checks_out() {
        let (pool, fakes) = fake_pool(&test_config());
        let sink = Arc::new(MemorySink::default());
        let executor = executor(Arc::clone(&pool), Arc::clone(&sink));

        for req in [request("  ", 5), request("out:1", 0), request(&"x".repeat(65), 5)] {
            let outcome = executor.execute(&req).await;
            assert!(matches!(
                outcome.result.error,
                Some(ExecutionError::InvalidRequest { .. })
            ));
            assert!(outcome.metrics.error);
        }
        assert_eq!(fakes.runc.created(), 0);
        assert_eq!(sink.records().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_pool_is_reported_with_metrics() {
        let mut config = test_config();
        config.pool.max_total = 1;
        let (pool, _fakes) = fake_pool(&config);
        let key = request("", 1).key();
        assert_eq!(
            pool.config(key).map(|c| c.exhaustion),
            Some(ExhaustionPolicy::FailFast)
        );
        let sink = Arc::new(MemorySink::default());
        let executor = executor(Arc::clone(&pool), Arc::clone(&sink));

        let held = pool.checkout(key).await.unwrap();
        let outcome = executor.execute(&request("out:1", 5)).await;
        assert_eq!(
            outcome.result.error,
            Some(ExecutionError::PoolExhausted { key })
        );
        assert_eq!(sink.records().len(), 1);
        assert!(sink.records()[0].error);

        pool.checkin(held, true);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sampling_still_succeeds_with_partial_metrics() {
        let (pool, fakes) = fake_pool(&test_config());
        fakes.runc.fail_samples(true);
        let executor = executor(Arc::clone(&pool), Arc::new(MemorySink::default()));

        let outcome = executor.execute(&request("sleep:150;out:ok", 5)).await;
        assert!(outcome.success());
        assert!(outcome.metrics.partial_metrics);
        assert_eq!(outcome.metrics.samples, 0);

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_runs_use_separate_containers() {
        let (pool, fakes) = fake_pool(&test_config());
        let executor = executor(Arc::clone(&pool), Arc::new(MemorySink::default()));

        let a = request("sleep:50;out:a", 5);
        let b = request("sleep:50;out:b", 5);
        let (ra, rb) = tokio::join!(executor.execute(&a), executor.execute(&b));
        assert_eq!(ra.result.output, "a");
        assert_eq!(rb.result.output, "b");
        assert_eq!(fakes.runc.created(), 2);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_backend_is_an_outcome() {
        let mut config = test_config();
        config.backends = vec![Backend::Standard];
        let (pool, _fakes) = fake_pool(&config);
        let executor = executor(Arc::clone(&pool), Arc::new(MemorySink::default()));

        let mut req = request("out:1", 5);
        req.backend = Backend::Gvisor;
        let outcome = executor.execute(&req).await;
        assert_eq!(
            outcome.result.error,
            Some(ExecutionError::BackendUnavailable {
                backend: Backend::Gvisor
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_execution_still_checks_in() {
        let mut config = test_config();
        config.pool.max_total = 1;
        let (pool, fakes) = fake_pool(&config);
        let sink = Arc::new(MemorySink::default());
        let executor = executor(Arc::clone(&pool), Arc::clone(&sink));
        let key = request("", 1).key();

        for _ in 0..3 {
            let _ = tokio::time::timeout(
                Duration::from_millis(50),
                executor.execute(&request("hang", 30)),
            )
            .await;
            assert!(fakes.runc.live() <= 1, "live {}", fakes.runc.live());
            assert!(pool.stats(key).live <= 1);
        }
        assert_eq!(fakes.runc.created(), 1);
        assert_eq!(pool.stats(key).live, 1);

        // The first run keeps its container until its own timeout fires.
        tokio::time::sleep(Duration::from_secs(31)).await;
        eventually("destroy", || fakes.runc.destroyed() == 1).await;
        assert_eq!(fakes.runc.kills(), 1);
        assert_eq!(fakes.runc.live(), 0);
        assert_eq!(pool.stats(key).live, 0);

        let records = sink.records();
        assert_eq!(records.len(), 3);
        let timeouts = records
            .iter()
            .filter(|r| r.error_kind.as_deref() == Some("timeout"))
            .count();
        assert_eq!(timeouts, 1);

        pool.shutdown().await;
    }
}
