use async_trait::async_trait;

use crate::error::Result;
use crate::key::PoolKey;
use crate::types::{ExecRequest, OutputCapture, ProcessExit, ResourceSample};

/// One container instance.
#[async_trait]
pub trait Sandbox: Send + Sync {
    // -- identity --
    fn id(&self) -> &str;
    fn key(&self) -> PoolKey;

    // -- lifecycle --
    /// Start the container and leave it idle, waiting for injected code.
    async fn start(&mut self) -> Result<()>;
    /// Forcibly terminate everything running in the container.
    async fn kill(&mut self) -> Result<()>;

    // -- operations --
    /// Run `request.code` with the language's interpreter and wait for it.
    ///
    /// Output is pushed into `output` as it arrives. Dropping the returned
    /// future abandons the wait but does not stop the process; callers must
    /// follow up with [`kill`](Self::kill).
    async fn exec(&self, request: &ExecRequest<'_>, output: &OutputCapture)
    -> Result<ProcessExit>;
    /// Forget cpu readings taken before this point, so the next samples
    /// cover only the execution that is about to start.
    fn begin_sampling(&self);
    /// Point-in-time memory and cpu usage.
    async fn sample(&self) -> Result<ResourceSample>;
}
