use crate::key::PoolKey;

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    /// Fractional CPUs, e.g. `0.5`.
    pub cpus: f64,
    pub pids: u32,
}

pub struct SandboxConfig {
    pub id: uuid::Uuid,
    pub key: PoolKey,
    pub resources: ResourceLimits,
}
