mod config;
mod error;
mod factory;
mod key;
mod sandbox;
mod types;

pub use config::{ResourceLimits, SandboxConfig};
pub use error::{Result, SandboxError};
pub use factory::SandboxFactory;
pub use key::{Backend, Language, PoolKey};
pub use sandbox::Sandbox;
pub use types::{ExecRequest, OutputCapture, OutputStream, ProcessExit, ResourceSample};
