//! Sandboxed code execution over pools of warm containers, with per-run
//! resource metrics and side-by-side comparison of isolation backends.

pub mod compare;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod pool;
pub mod provisioner;
pub mod sampler;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{CompareMode, EngineConfig};
pub use engine::{Engine, StartupReport};
pub use error::{EngineError, EngineResult};
pub use metrics::{JsonLinesSink, MemorySink, MetricsRecord, MetricsSink, TracingSink};
pub use types::{
    BackendRun, CompareRequest, Comparison, ExecutionError, ExecutionOutcome, ExecutionRequest,
    ExecutionResult,
};
