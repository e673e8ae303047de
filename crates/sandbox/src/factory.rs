use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::key::{Backend, Language};
use crate::sandbox::Sandbox;

/// One isolation backend.
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    fn backend(&self) -> Backend;
    /// Verify the backend is usable and clear leftovers from a previous run.
    /// Must be called before any other method.
    async fn startup(&mut self) -> Result<()>;
    /// Whether the runtime image for `language` is present and current.
    async fn image_exists(&self, language: Language) -> Result<bool>;
    /// Build the runtime image for `language` on this backend.
    async fn build_image(&self, language: Language) -> Result<()>;
    /// Create a new (not yet started) sandbox.
    async fn create(&self, config: SandboxConfig) -> Result<Box<dyn Sandbox>>;
    /// Tear down a sandbox. On error the sandbox is handed back so the
    /// caller can retry later.
    async fn destroy(
        &self,
        sandbox: Box<dyn Sandbox>,
    ) -> std::result::Result<(), (Box<dyn Sandbox>, crate::SandboxError)>;
    /// Release all factory-level resources.
    async fn shutdown(&mut self);
}
