use std::time::Duration;

use sandbox::{PoolKey, Sandbox};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Started, not yet handed out or parked.
    Provisioning,
    Idle,
    Busy,
    Destroying,
}

/// One live container plus its reuse bookkeeping.
///
/// A slot only ever wraps a started container; containers still being
/// created are counted in [`PoolStats::starting`](super::PoolStats::starting).
///
/// Holds one of its pool's `max_total` permits until the container is
/// destroyed. A slot handed out by `checkout` must go back through
/// `checkin`; dropping it instead leaks the container until the next
/// stale-container sweep.
pub struct ContainerSlot {
    pub(super) sandbox: Box<dyn Sandbox>,
    pub(super) permit: OwnedSemaphorePermit,
    key: PoolKey,
    state: SlotState,
    executions: u32,
    runtime_errors: u32,
    created_at: Instant,
    idle_since: Instant,
    guard: CheckoutGuard,
}

impl ContainerSlot {
    pub(super) fn new(sandbox: Box<dyn Sandbox>, permit: OwnedSemaphorePermit) -> Self {
        let now = Instant::now();
        Self {
            key: sandbox.key(),
            guard: CheckoutGuard {
                id: sandbox.id().to_string(),
                armed: false,
            },
            sandbox,
            permit,
            state: SlotState::Provisioning,
            executions: 0,
            runtime_errors: 0,
            created_at: now,
            idle_since: now,
        }
    }

    pub fn id(&self) -> &str {
        self.sandbox.id()
    }

    pub fn key(&self) -> PoolKey {
        self.key
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn sandbox(&self) -> &dyn Sandbox {
        self.sandbox.as_ref()
    }

    pub fn sandbox_mut(&mut self) -> &mut dyn Sandbox {
        self.sandbox.as_mut()
    }

    /// Executions started in this container, including the current one.
    pub fn executions(&self) -> u32 {
        self.executions
    }

    pub fn runtime_errors(&self) -> u32 {
        self.runtime_errors
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Count a non-zero exit of user code against this container.
    pub fn record_runtime_error(&mut self) {
        self.runtime_errors += 1;
    }

    pub(super) fn mark_busy(&mut self) {
        self.state = SlotState::Busy;
        self.executions += 1;
        self.guard.armed = true;
    }

    pub(super) fn mark_idle(&mut self) {
        self.state = SlotState::Idle;
        self.idle_since = Instant::now();
        self.guard.armed = false;
    }

    pub(super) fn mark_destroying(&mut self) {
        self.state = SlotState::Destroying;
        self.guard.armed = false;
    }

    pub(super) fn idle_expired(&self, max_idle: Duration) -> bool {
        self.idle_since.elapsed() >= max_idle
    }
}

impl std::fmt::Debug for ContainerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSlot")
            .field("id", &self.id())
            .field("key", &self.key)
            .field("state", &self.state)
            .field("executions", &self.executions)
            .field("runtime_errors", &self.runtime_errors)
            .finish_non_exhaustive()
    }
}

struct CheckoutGuard {
    id: String,
    armed: bool,
}

impl Drop for CheckoutGuard {
    fn drop(&mut self) {
        if self.armed {
            error!(container = %self.id, "checked-out slot dropped without checkin");
        }
    }
}
