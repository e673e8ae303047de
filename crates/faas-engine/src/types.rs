use std::time::Duration;

use sandbox::{Backend, Language, PoolKey};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::metrics::MetricsRecord;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    pub timeout_secs: u64,
    pub backend: Backend,
    /// Metrics label only.
    pub function_name: String,
}

impl ExecutionRequest {
    pub fn key(&self) -> PoolKey {
        PoolKey::new(self.language, self.backend)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub(crate) fn validate(&self, max_code_bytes: usize) -> Result<(), ExecutionError> {
        let invalid = |message: String| Err(ExecutionError::InvalidRequest { message });
        if self.code.trim().is_empty() {
            return invalid("code is empty".into());
        }
        if self.code.len() > max_code_bytes {
            return invalid(format!(
                "code is {} bytes, limit is {max_code_bytes}",
                self.code.len()
            ));
        }
        if self.timeout_secs == 0 {
            return invalid("timeout must be at least one second".into());
        }
        Ok(())
    }
}

/// The same request for every backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareRequest {
    pub code: String,
    pub language: Language,
    pub timeout_secs: u64,
    pub function_name: String,
}

impl CompareRequest {
    pub fn for_backend(&self, backend: Backend) -> ExecutionRequest {
        ExecutionRequest {
            code: self.code.clone(),
            language: self.language,
            timeout_secs: self.timeout_secs,
            backend,
            function_name: self.function_name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Why an execution did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("backend {backend} is not available")]
    BackendUnavailable { backend: Backend },

    #[error("image build failed: {message}")]
    ImageBuild { message: String },

    #[error("pool exhausted for {key}")]
    PoolExhausted { key: PoolKey },

    #[error("container start failed: {message}")]
    ContainerStart { message: String },

    #[error("timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("code exited with status {exit_code}")]
    RuntimeExecution { exit_code: i64 },

    #[error("sandbox failure: {message}")]
    Sandbox { message: String },
}

impl ExecutionError {
    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::ImageBuild { .. } => "image_build",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::ContainerStart { .. } => "container_start",
            Self::Timeout { .. } => "timeout",
            Self::RuntimeExecution { .. } => "runtime_execution",
            Self::Sandbox { .. } => "sandbox",
        }
    }
}

impl From<EngineError> for ExecutionError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::PoolExhausted(key) => Self::PoolExhausted { key },
            EngineError::BackendDisabled(backend) => Self::BackendUnavailable { backend },
            EngineError::ImageBuild { reason, .. } => Self::ImageBuild { message: reason },
            EngineError::ContainerStart { reason, .. } => Self::ContainerStart { message: reason },
            other => Self::Sandbox {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// Stdout with trailing newlines trimmed.
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub error: Option<ExecutionError>,
    /// Output beyond the capture limit was discarded.
    pub output_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub result: ExecutionResult,
    pub metrics: MetricsRecord,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.result.success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendRun {
    pub backend: Backend,
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
}

/// Both backends' outcomes for identical input, in [`Backend::ALL`] order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub function_name: String,
    pub runs: [BackendRun; 2],
}

impl Comparison {
    pub fn get(&self, backend: Backend) -> Option<&ExecutionOutcome> {
        self.runs
            .iter()
            .find(|r| r.backend == backend)
            .map(|r| &r.outcome)
    }
}
