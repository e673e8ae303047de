//! In-memory backend for engine tests.
//!
//! Code given to a [`FakeSandbox`] is a `;`-separated script:
//! `out:TEXT`, `err:TEXT`, `sleep:MS`, `exit:N`, `hang`, `crash`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{
    Backend, ExecRequest, Language, OutputCapture, OutputStream, PoolKey, ProcessExit,
    ResourceSample, Sandbox, SandboxConfig, SandboxError, SandboxFactory,
};

use crate::config::{EngineConfig, ExhaustionSection};
use crate::pool::PoolManager;
use crate::provisioner::ImageProvisioner;

const MB: u64 = 1024 * 1024;

#[derive(Default)]
pub(crate) struct FakeState {
    unavailable: AtomicBool,
    images: Mutex<HashSet<Language>>,
    failing_builds: Mutex<HashSet<Language>>,
    builds: Mutex<HashMap<Language, usize>>,
    build_delay: Mutex<Duration>,
    start_failures: AtomicUsize,
    destroy_failures: AtomicUsize,
    fail_samples: AtomicBool,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    kills: AtomicUsize,
    shutdowns: AtomicUsize,
    live: Mutex<HashSet<String>>,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl FakeState {
    pub fn set_unavailable(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }

    pub fn add_image(&self, language: Language) {
        self.images.lock().unwrap().insert(language);
    }

    pub fn fail_builds(&self, language: Language, fail: bool) {
        let mut failing = self.failing_builds.lock().unwrap();
        if fail {
            failing.insert(language);
        } else {
            failing.remove(&language);
        }
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock().unwrap() = delay;
    }

    /// Make the next `n` container starts fail.
    pub fn fail_next_starts(&self, n: usize) {
        self.start_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` destroys fail.
    pub fn fail_next_destroys(&self, n: usize) {
        self.destroy_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_samples(&self, fail: bool) {
        self.fail_samples.store(fail, Ordering::SeqCst);
    }

    pub fn builds(&self, language: Language) -> usize {
        self.builds
            .lock()
            .unwrap()
            .get(&language)
            .copied()
            .unwrap_or(0)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Containers started and not yet destroyed.
    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.live.lock().unwrap().contains(id)
    }
}

pub(crate) struct FakeFactory {
    backend: Backend,
    state: Arc<FakeState>,
}

impl FakeFactory {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            state: Arc::new(FakeState::default()),
        }
    }

    pub fn state(&self) -> Arc<FakeState> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl SandboxFactory for FakeFactory {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn startup(&mut self) -> sandbox::Result<()> {
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(SandboxError::BackendNotAvailable(format!(
                "{} runtime not registered",
                self.backend
            )));
        }
        Ok(())
    }

    async fn image_exists(&self, language: Language) -> sandbox::Result<bool> {
        Ok(self.state.images.lock().unwrap().contains(&language))
    }

    async fn build_image(&self, language: Language) -> sandbox::Result<()> {
        *self.state.builds.lock().unwrap().entry(language).or_default() += 1;
        let delay = *self.state.build_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if self.state.failing_builds.lock().unwrap().contains(&language) {
            return Err(SandboxError::ImageBuildFailed(format!(
                "{language}: base image not found"
            )));
        }
        self.state.add_image(language);
        Ok(())
    }

    async fn create(&self, config: SandboxConfig) -> sandbox::Result<Box<dyn Sandbox>> {
        if config.key.backend != self.backend {
            return Err(SandboxError::InvalidConfig("wrong backend".into()));
        }
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSandbox {
            id: format!("fake-{}-{}", config.key.backend, config.id),
            key: config.key,
            state: Arc::clone(&self.state),
            samples: AtomicU32::new(0),
        }))
    }

    async fn destroy(
        &self,
        sandbox: Box<dyn Sandbox>,
    ) -> Result<(), (Box<dyn Sandbox>, SandboxError)> {
        if take_one(&self.state.destroy_failures) {
            let id = sandbox.id().to_string();
            return Err((sandbox, SandboxError::DestroyFailed(id)));
        }
        self.state.live.lock().unwrap().remove(sandbox.id());
        self.state.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.state.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakeSandbox {
    id: String,
    key: PoolKey,
    state: Arc<FakeState>,
    samples: AtomicU32,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn key(&self) -> PoolKey {
        self.key
    }

    async fn start(&mut self) -> sandbox::Result<()> {
        if take_one(&self.state.start_failures) {
            return Err(SandboxError::StartFailed(format!("{}: runtime error", self.id)));
        }
        self.state.live.lock().unwrap().insert(self.id.clone());
        Ok(())
    }

    async fn kill(&mut self) -> sandbox::Result<()> {
        self.state.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exec(
        &self,
        request: &ExecRequest<'_>,
        output: &OutputCapture,
    ) -> sandbox::Result<ProcessExit> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        for step in request.code.split(';').map(str::trim) {
            let (op, arg) = step.split_once(':').unwrap_or((step, ""));
            match op {
                "out" => output.push(OutputStream::Stdout, format!("{arg}\n").as_bytes()),
                "err" => output.push(OutputStream::Stderr, format!("{arg}\n").as_bytes()),
                "sleep" => {
                    let ms = arg.parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                "exit" => {
                    return Ok(ProcessExit {
                        exit_code: arg.parse().unwrap_or(1),
                    });
                }
                "hang" => std::future::pending::<()>().await,
                "crash" => return Err(SandboxError::ExecFailed("connection reset".into())),
                _ => {}
            }
        }
        Ok(ProcessExit { exit_code: 0 })
    }

    fn begin_sampling(&self) {
        self.samples.store(0, Ordering::SeqCst);
    }

    /// The n-th sample since `begin_sampling` reports `16 * n` MB and,
    /// from the second on, `10 * n` % cpu.
    async fn sample(&self) -> sandbox::Result<ResourceSample> {
        if self.state.fail_samples.load(Ordering::SeqCst) {
            return Err(SandboxError::StatsUnavailable("stats stream closed".into()));
        }
        let n = self.samples.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ResourceSample {
            memory_bytes: 16 * MB * u64::from(n),
            cpu_percent: (n > 1).then(|| 10.0 * f64::from(n)),
        })
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Small pools, no prewarming, fail-fast.
pub(crate) fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.pool.min_idle = 0;
    config.pool.max_total = 4;
    config.pool.exhaustion = ExhaustionSection::FailFast;
    config.sampler.interval_ms = 100;
    config
}

pub(crate) struct FakeBackends {
    pub runc: Arc<FakeState>,
    pub runsc: Arc<FakeState>,
}

impl FakeBackends {
    /// Fresh factories for both backends, sharing this handle's state.
    pub fn new() -> (Self, Vec<FakeFactory>) {
        let runc = FakeFactory::new(Backend::Standard);
        let runsc = FakeFactory::new(Backend::Gvisor);
        let handles = Self {
            runc: runc.state(),
            runsc: runsc.state(),
        };
        (handles, vec![runc, runsc])
    }
}

/// A pool manager over fake factories for the backends `config` enables.
pub(crate) fn fake_pool(config: &EngineConfig) -> (Arc<PoolManager>, FakeBackends) {
    let (fakes, factories) = FakeBackends::new();
    let factories: HashMap<Backend, Arc<dyn SandboxFactory>> = factories
        .into_iter()
        .filter(|f| config.backends.contains(&f.backend()))
        .map(|f| (f.backend(), Arc::new(f) as Arc<dyn SandboxFactory>))
        .collect();
    let provisioner = Arc::new(ImageProvisioner::new(
        factories.clone(),
        config.languages.clone(),
    ));
    let configs = config
        .keys()
        .into_iter()
        .map(|key| (key, config.pool_config(key)))
        .collect();
    (PoolManager::new(configs, factories, provisioner), fakes)
}

/// Poll `check` until it holds, yielding to background tasks in between.
pub(crate) async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("timed out waiting for {what}");
}
