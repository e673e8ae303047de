use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use sandbox::{Backend, Language, PoolKey, SandboxFactory};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::compare::compare;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::executor::{Executor, ExecutorConfig};
use crate::metrics::MetricsSink;
use crate::pool::{PoolManager, PoolStats};
use crate::provisioner::{ImageProvisioner, ImageReport};
use crate::types::{CompareRequest, Comparison, ExecutionOutcome, ExecutionRequest};

/// How long shutdown waits for background pool tasks to let go of the
/// factories.
const DRAIN_POLL: Duration = Duration::from_millis(10);
const DRAIN_POLLS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnavailableBackend {
    pub backend: Backend,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrewarmedPool {
    pub key: PoolKey,
    pub idle: usize,
}

/// What [`Engine::initialize`] found and did, step by step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartupReport {
    pub backends: Vec<Backend>,
    pub unavailable: Vec<UnavailableBackend>,
    pub images: ImageReport,
    pub prewarmed: Vec<PrewarmedPool>,
}

/// The execution engine: image provisioning, warm pools, execution and
/// comparison behind one handle.
pub struct Engine {
    config: EngineConfig,
    factories: Vec<Arc<dyn SandboxFactory>>,
    provisioner: Arc<ImageProvisioner>,
    executor: Executor,
}

impl Engine {
    /// Bring the engine up.
    ///
    /// 1. Start every enabled backend; unavailable ones are reported and
    ///    left out. Fails only if no backend is usable.
    /// 2. Provision every pair's image; failed pairs are reported and
    ///    refused until a later [`ensure_images`](Self::ensure_images).
    /// 3. Prewarm `min_idle` containers for every ready pair.
    /// 4. Start pool maintenance.
    pub async fn initialize(
        config: EngineConfig,
        factories: Vec<Box<dyn SandboxFactory>>,
        sink: Arc<dyn MetricsSink>,
    ) -> EngineResult<(Self, StartupReport)> {
        config.validate()?;

        let mut started: HashMap<Backend, Arc<dyn SandboxFactory>> = HashMap::new();
        let mut unavailable = Vec::new();
        for mut factory in factories {
            let backend = factory.backend();
            if !config.backends.contains(&backend) {
                debug!(backend = %backend, "backend not enabled, skipping");
                continue;
            }
            match factory.startup().await {
                Ok(()) => {
                    info!(backend = %backend, "backend available");
                    started.insert(backend, Arc::from(factory));
                }
                Err(e) => {
                    warn!(backend = %backend, error = %e, "backend unavailable, disabling");
                    unavailable.push(UnavailableBackend {
                        backend,
                        reason: e.to_string(),
                    });
                }
            }
        }
        if started.is_empty() {
            let reasons = unavailable
                .iter()
                .map(|u| format!("{}: {}", u.backend, u.reason))
                .collect::<Vec<_>>();
            return Err(EngineError::NoBackend(if reasons.is_empty() {
                "no factory for any enabled backend".into()
            } else {
                reasons.join("; ")
            }));
        }

        let engine = Self::assemble(config, started, sink);

        let images = engine.provisioner.ensure_images().await;
        for failed in &images.failed {
            error!(key = %failed.key, reason = %failed.reason, "runtime image unavailable, pair disabled");
        }

        let pool = engine.executor.pool();
        let prewarmed = join_all(images.ready.iter().map(|&key| async move {
            let target = pool.config(key).map_or(0, |c| c.min_idle);
            let idle = if target > 0 { pool.prewarm(key, target).await } else { 0 };
            PrewarmedPool { key, idle }
        }))
        .await;

        pool.spawn_maintenance(engine.config.maintenance_interval());

        let mut backends: Vec<Backend> = engine.factories.iter().map(|f| f.backend()).collect();
        backends.sort();
        info!(
            backends = backends.len(),
            ready = images.ready.len(),
            failed = images.failed.len(),
            "engine initialized"
        );
        let report = StartupReport {
            backends,
            unavailable,
            images,
            prewarmed,
        };
        Ok((engine, report))
    }

    fn assemble(
        config: EngineConfig,
        factories: HashMap<Backend, Arc<dyn SandboxFactory>>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let provisioner = Arc::new(ImageProvisioner::new(
            factories.clone(),
            config.languages.clone(),
        ));
        let pool_configs = config
            .keys()
            .into_iter()
            .map(|key| (key, config.pool_config(key)))
            .collect();
        let pool = PoolManager::new(pool_configs, factories.clone(), Arc::clone(&provisioner));
        let executor = Executor::new(
            pool,
            sink,
            ExecutorConfig {
                sample_interval: config.sampler_interval(),
                max_output_bytes: config.execution.max_output_bytes,
                max_code_bytes: config.docker.max_code_bytes,
            },
        );
        Self {
            config,
            factories: factories.into_values().collect(),
            provisioner,
            executor,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Provision every pair, retrying failed ones.
    pub async fn ensure_images(&self) -> ImageReport {
        self.provisioner.ensure_images().await
    }

    /// Start idle containers for a pair; returns the idle count reached.
    pub async fn prewarm(&self, language: Language, backend: Backend, count: usize) -> usize {
        self.executor
            .pool()
            .prewarm(PoolKey::new(language, backend), count)
            .await
    }

    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        self.executor.execute(request).await
    }

    pub async fn compare(&self, request: &CompareRequest) -> Comparison {
        compare(&self.executor, request, self.config.execution.compare).await
    }

    pub fn stats(&self, key: PoolKey) -> PoolStats {
        self.executor.pool().stats(key)
    }

    /// Drain every pool, then shut the backends down.
    pub async fn shutdown(self) {
        let Self {
            factories,
            provisioner,
            executor,
            ..
        } = self;
        let pool = Arc::clone(executor.pool());
        pool.shutdown().await;
        drop(executor);
        drop(provisioner);

        // Retirement and replenish tasks hold the pool until they finish.
        for _ in 0..DRAIN_POLLS {
            if Arc::strong_count(&pool) == 1 {
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        drop(pool);

        for mut factory in factories {
            let backend = factory.backend();
            match Arc::get_mut(&mut factory) {
                Some(factory) => factory.shutdown().await,
                None => warn!(backend = %backend, "factory still in use, skipping shutdown"),
            }
        }
        info!("engine shut down");
    }
}
