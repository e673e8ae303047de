//! Warm container pools, one per (language, backend) pair.
//!
//! Every live container of a pair holds one permit of that pair's
//! semaphore, whether it is idle, busy, starting or awaiting destruction,
//! so the live count can never exceed `max_total`.

mod slot;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use sandbox::{Backend, PoolKey, ResourceLimits, Sandbox, SandboxConfig, SandboxFactory};
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use slot::{ContainerSlot, SlotState};

use crate::error::{EngineError, EngineResult};
use crate::provisioner::ImageProvisioner;

/// Create+start attempts per container before giving up.
const START_ATTEMPTS: u32 = 2;

/// What checkout does when a pair is at `max_total` with nothing idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    FailFast,
    /// Wait up to `wait` for a container to come back or a permit to free up.
    Block { wait: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub min_idle: usize,
    pub max_total: usize,
    pub max_executions: u32,
    pub max_idle: Duration,
    pub max_runtime_errors: u32,
    pub exhaustion: ExhaustionPolicy,
    pub resources: ResourceLimits,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    /// Containers holding a permit: idle, busy, starting or pending destruction.
    pub live: usize,
    pub starting: usize,
    pub pending_destroy: usize,
}

/// A container whose destruction failed, kept for the next maintenance cycle.
struct Doomed {
    sandbox: Box<dyn Sandbox>,
    permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct KeyState {
    idle: VecDeque<ContainerSlot>,
    starting: usize,
    doomed: Vec<Doomed>,
    closed: bool,
}

struct KeyPool {
    key: PoolKey,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    /// Signalled whenever a slot becomes idle or a permit is released.
    available: Notify,
    state: Mutex<KeyState>,
}

impl KeyPool {
    fn lock(&self) -> MutexGuard<'_, KeyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Acquired {
    Idle(ContainerSlot),
    Permit(OwnedSemaphorePermit),
}

pub struct PoolManager {
    pools: HashMap<PoolKey, KeyPool>,
    factories: HashMap<Backend, Arc<dyn SandboxFactory>>,
    provisioner: Arc<ImageProvisioner>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    /// One pool per entry of `configs` whose backend has a factory.
    pub fn new(
        configs: HashMap<PoolKey, PoolConfig>,
        factories: HashMap<Backend, Arc<dyn SandboxFactory>>,
        provisioner: Arc<ImageProvisioner>,
    ) -> Arc<Self> {
        let pools = configs
            .into_iter()
            .filter(|(key, _)| factories.contains_key(&key.backend))
            .map(|(key, config)| {
                let pool = KeyPool {
                    key,
                    permits: Arc::new(Semaphore::new(config.max_total)),
                    config,
                    available: Notify::new(),
                    state: Mutex::new(KeyState::default()),
                };
                (key, pool)
            })
            .collect();
        Arc::new(Self {
            pools,
            factories,
            provisioner,
            maintenance: Mutex::new(None),
        })
    }

    pub fn keys(&self) -> Vec<PoolKey> {
        let mut keys: Vec<_> = self.pools.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn config(&self, key: PoolKey) -> Option<&PoolConfig> {
        self.pools.get(&key).map(|p| &p.config)
    }

    fn pool(&self, key: PoolKey) -> EngineResult<&KeyPool> {
        self.pools
            .get(&key)
            .ok_or(EngineError::BackendDisabled(key.backend))
    }

    fn factory(&self, backend: Backend) -> EngineResult<&Arc<dyn SandboxFactory>> {
        self.factories
            .get(&backend)
            .ok_or(EngineError::BackendDisabled(backend))
    }

    // ---- checkout / checkin ----

    /// Hand out a running container for `key`, exclusively.
    ///
    /// Prefers an idle container; otherwise starts one if the pair is below
    /// `max_total`; otherwise follows the pair's exhaustion policy.
    pub async fn checkout(self: &Arc<Self>, key: PoolKey) -> EngineResult<ContainerSlot> {
        let pool = self.pool(key)?;
        self.provisioner.ensure(key).await?;

        let mut slot = match self.acquire(pool).await? {
            Acquired::Idle(slot) => {
                debug!(key = %key, container = %slot.id(), "reusing idle container");
                slot
            }
            Acquired::Permit(permit) => self.start_slot(pool, permit).await?,
        };
        slot.mark_busy();
        self.maybe_replenish(key);
        Ok(slot)
    }

    async fn acquire(self: &Arc<Self>, pool: &KeyPool) -> EngineResult<Acquired> {
        let deadline = match pool.config.exhaustion {
            ExhaustionPolicy::FailFast => None,
            ExhaustionPolicy::Block { wait } => Some(Instant::now() + wait),
        };
        loop {
            let notified = pool.available.notified();
            if pool.lock().closed {
                return Err(EngineError::ShuttingDown);
            }
            if let Some(slot) = self.pop_idle(pool) {
                return Ok(Acquired::Idle(slot));
            }
            if let Ok(permit) = Arc::clone(&pool.permits).try_acquire_owned() {
                return Ok(Acquired::Permit(permit));
            }
            let Some(deadline) = deadline else {
                warn!(key = %pool.key, "pool exhausted");
                return Err(EngineError::PoolExhausted(pool.key));
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(key = %pool.key, "pool exhausted after waiting");
                return Err(EngineError::PoolExhausted(pool.key));
            }
        }
    }

    /// Pop the first idle slot that is still within its idle budget.
    fn pop_idle(self: &Arc<Self>, pool: &KeyPool) -> Option<ContainerSlot> {
        loop {
            let slot = pool.lock().idle.pop_front()?;
            if slot.idle_expired(pool.config.max_idle) {
                self.retire(slot, "idle too long");
                continue;
            }
            return Some(slot);
        }
    }

    /// Return a slot after an execution.
    ///
    /// Unhealthy slots, slots over their reuse budget and slots returned
    /// after shutdown are destroyed in the background; everything else goes
    /// back to the idle queue.
    pub fn checkin(self: &Arc<Self>, mut slot: ContainerSlot, healthy: bool) {
        let Ok(pool) = self.pool(slot.key()) else {
            error!(container = %slot.id(), "checkin for unknown pool");
            self.retire(slot, "unknown pool");
            return;
        };

        let reason = if !healthy {
            Some("unhealthy")
        } else if slot.executions() >= pool.config.max_executions {
            Some("execution budget reached")
        } else if slot.runtime_errors() >= pool.config.max_runtime_errors {
            Some("runtime error budget reached")
        } else {
            None
        };
        if let Some(reason) = reason {
            self.retire(slot, reason);
            return;
        }

        let mut state = pool.lock();
        if state.closed {
            drop(state);
            self.retire(slot, "pool closed");
            return;
        }
        slot.mark_idle();
        debug!(key = %pool.key, container = %slot.id(), executions = slot.executions(), "container returned");
        state.idle.push_back(slot);
        drop(state);
        pool.available.notify_one();
    }

    // ---- creation ----

    /// Create and start one container under `permit`, retrying once.
    async fn start_slot(
        &self,
        pool: &KeyPool,
        permit: OwnedSemaphorePermit,
    ) -> EngineResult<ContainerSlot> {
        let factory = self.factory(pool.key.backend)?;
        let mut last_error = String::new();
        for attempt in 1..=START_ATTEMPTS {
            let config = SandboxConfig {
                id: Uuid::new_v4(),
                key: pool.key,
                resources: pool.config.resources.clone(),
            };
            match start_sandbox(factory.as_ref(), config).await {
                Ok(sandbox) => {
                    info!(key = %pool.key, container = %sandbox.id(), "container started");
                    return Ok(ContainerSlot::new(sandbox, permit));
                }
                Err(e) => {
                    warn!(key = %pool.key, attempt, error = %e, "container start failed");
                    last_error = e.to_string();
                }
            }
        }
        drop(permit);
        pool.available.notify_one();
        Err(EngineError::ContainerStart {
            key: pool.key,
            reason: last_error,
        })
    }

    /// Start containers in the background until `key` has `target` idle or
    /// starting, bounded by free permits.
    fn schedule_fill(self: &Arc<Self>, key: PoolKey, target: usize) -> Vec<JoinHandle<()>> {
        let Some(pool) = self.pools.get(&key) else {
            return Vec::new();
        };
        let mut state = pool.lock();
        if state.closed {
            return Vec::new();
        }
        let have = state.idle.len() + state.starting;
        let mut handles = Vec::new();
        for _ in have..target {
            let Ok(permit) = Arc::clone(&pool.permits).try_acquire_owned() else {
                debug!(key = %key, "at max_total, not filling further");
                break;
            };
            state.starting += 1;
            let manager = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                manager.fill_one(key, permit).await;
            }));
        }
        handles
    }

    async fn fill_one(self: Arc<Self>, key: PoolKey, permit: OwnedSemaphorePermit) {
        let Some(pool) = self.pools.get(&key) else {
            return;
        };
        let result = self.start_slot(pool, permit).await;

        let leftover = {
            let mut state = pool.lock();
            state.starting -= 1;
            match result {
                Ok(mut slot) if !state.closed => {
                    slot.mark_idle();
                    state.idle.push_back(slot);
                    pool.available.notify_one();
                    None
                }
                Ok(slot) => Some(slot),
                Err(e) => {
                    warn!(key = %key, error = %e, "replenish failed");
                    None
                }
            }
        };
        if let Some(slot) = leftover {
            self.destroy_slot(slot).await;
        }
    }

    /// Bring `key` back up to `min_idle` in the background.
    pub fn maybe_replenish(self: &Arc<Self>, key: PoolKey) {
        let Some(pool) = self.pools.get(&key) else {
            return;
        };
        if !self.provisioner.is_ready(key) {
            return;
        }
        // Dropping the handles detaches the tasks.
        let scheduled = self.schedule_fill(key, pool.config.min_idle).len();
        if scheduled > 0 {
            debug!(key = %key, scheduled, "replenishing pool");
        }
    }

    /// Start containers until `key` has `count` idle, and wait for them.
    /// Best-effort: returns the idle count reached.
    pub async fn prewarm(self: &Arc<Self>, key: PoolKey, count: usize) -> usize {
        if let Err(e) = self.provisioner.ensure(key).await {
            warn!(key = %key, error = %e, "skipping prewarm");
            return 0;
        }
        for handle in self.schedule_fill(key, count) {
            if let Err(e) = handle.await {
                error!(key = %key, error = %e, "prewarm task panicked");
            }
        }
        let idle = self.stats(key).idle;
        info!(key = %key, idle, "pool prewarmed");
        idle
    }

    // ---- destruction ----

    /// Destroy `slot` in the background; its permit is released once the
    /// container is gone.
    fn retire(self: &Arc<Self>, mut slot: ContainerSlot, reason: &'static str) {
        slot.mark_destroying();
        info!(
            key = %slot.key(),
            container = %slot.id(),
            executions = slot.executions(),
            age_secs = slot.age().as_secs(),
            reason,
            "retiring container"
        );
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let key = slot.key();
            manager.destroy_slot(slot).await;
            manager.maybe_replenish(key);
        });
    }

    async fn destroy_slot(&self, slot: ContainerSlot) {
        let key = slot.key();
        self.destroy(
            key,
            Doomed {
                sandbox: slot.sandbox,
                permit: slot.permit,
            },
        )
        .await;
    }

    async fn destroy(&self, key: PoolKey, doomed: Doomed) {
        let Ok(factory) = self.factory(key.backend) else {
            return;
        };
        match factory.destroy(doomed.sandbox).await {
            Ok(()) => {
                drop(doomed.permit);
                if let Some(pool) = self.pools.get(&key) {
                    pool.available.notify_one();
                }
            }
            Err((sandbox, e)) => {
                warn!(key = %key, container = %sandbox.id(), error = %e, "destroy failed, will retry");
                if let Some(pool) = self.pools.get(&key) {
                    pool.lock().doomed.push(Doomed {
                        sandbox,
                        permit: doomed.permit,
                    });
                }
            }
        }
    }

    // ---- maintenance ----

    /// Run one maintenance cycle over every pool.
    ///
    /// Retires idle containers past their idle budget, retries failed
    /// destructions and replenishes to `min_idle`.
    pub async fn run_maintenance(self: &Arc<Self>) {
        for key in self.keys() {
            let Some(pool) = self.pools.get(&key) else {
                continue;
            };
            let (expired, doomed) = {
                let mut state = pool.lock();
                let (keep, expired): (VecDeque<_>, VecDeque<_>) = state
                    .idle
                    .drain(..)
                    .partition(|s| !s.idle_expired(pool.config.max_idle));
                state.idle = keep;
                (expired, std::mem::take(&mut state.doomed))
            };

            for slot in expired {
                self.retire(slot, "idle too long");
            }
            for d in doomed {
                self.destroy(key, d).await;
            }
            self.maybe_replenish(key);
        }
    }

    /// Run maintenance every `interval` until shutdown.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.run_maintenance().await;
            }
        });
        let previous = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop maintenance and destroy every idle container and pending
    /// destruction. Busy slots are destroyed when they are checked in.
    pub async fn shutdown(&self) {
        let maintenance = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = maintenance {
            handle.abort();
        }

        for key in self.keys() {
            let Some(pool) = self.pools.get(&key) else {
                continue;
            };
            let (idle, doomed) = {
                let mut state = pool.lock();
                state.closed = true;
                (
                    state.idle.drain(..).collect::<Vec<_>>(),
                    std::mem::take(&mut state.doomed),
                )
            };
            pool.available.notify_waiters();
            let count = idle.len() + doomed.len();
            for mut slot in idle {
                slot.mark_destroying();
                self.destroy_slot(slot).await;
            }
            for d in doomed {
                self.destroy(key, d).await;
            }
            if count > 0 {
                info!(key = %key, count, "pool drained");
            }
        }
    }

    pub fn stats(&self, key: PoolKey) -> PoolStats {
        let Some(pool) = self.pools.get(&key) else {
            return PoolStats::default();
        };
        let state = pool.lock();
        PoolStats {
            idle: state.idle.len(),
            live: pool.config.max_total - pool.permits.available_permits(),
            starting: state.starting,
            pending_destroy: state.doomed.len(),
        }
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        let idle: usize = self.pools.values().map(|p| p.lock().idle.len()).sum();
        if idle > 0 {
            warn!(idle, "PoolManager dropped without shutdown(), idle containers leaked");
        }
    }
}

/// Create and start one sandbox; destroys the partial container on failure.
async fn start_sandbox(
    factory: &dyn SandboxFactory,
    config: SandboxConfig,
) -> sandbox::Result<Box<dyn Sandbox>> {
    let mut sandbox = factory.create(config).await?;
    if let Err(e) = sandbox.start().await {
        if let Err((sandbox, de)) = factory.destroy(sandbox).await {
            warn!(container = %sandbox.id(), error = %de, "failed to remove unstarted container");
        }
        return Err(e);
    }
    Ok(sandbox)
}
