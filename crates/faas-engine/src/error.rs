use sandbox::{Backend, PoolKey};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error("no sandbox backend available: {0}")]
    NoBackend(String),

    #[error("backend {0} is not enabled")]
    BackendDisabled(Backend),

    #[error("image build failed for {key}: {reason}")]
    ImageBuild { key: PoolKey, reason: String },

    #[error("pool exhausted for {0}")]
    PoolExhausted(PoolKey),

    #[error("container start failed for {key}: {reason}")]
    ContainerStart { key: PoolKey, reason: String },

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
