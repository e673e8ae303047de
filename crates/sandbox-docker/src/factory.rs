use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as DockerApiError;
use bollard::query_parameters::{BuildImageOptionsBuilder, RemoveContainerOptions};
use futures_util::StreamExt;
use sandbox::{Backend, Language, Sandbox, SandboxConfig, SandboxError, SandboxFactory};
use tracing::{debug, info, warn};

use crate::config::DockerConfig;
use crate::image::{DEFINITION_LABEL, ImageDefinition};
use crate::prerequisites::{check_prerequisites, clean_stale_containers};
use crate::sandbox::DockerSandbox;

/// Seconds the API client waits on a single daemon request.
const DAEMON_TIMEOUT_SECS: u64 = 120;

/// Connect to the docker daemon without issuing any request.
pub fn connect(config: &DockerConfig) -> sandbox::Result<Docker> {
    let docker = match &config.socket {
        Some(socket) => {
            Docker::connect_with_socket(socket, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        }
        None => Docker::connect_with_local_defaults(),
    };
    docker.map_err(|e| SandboxError::BackendNotAvailable(format!("docker connect: {e}")))
}

/// Runs sandboxes as docker containers under one OCI runtime.
///
/// The same type serves both backends: [`Backend::Standard`] starts
/// containers under `runc`, [`Backend::Gvisor`] under `runsc`.
pub struct DockerFactory {
    docker: Docker,
    backend: Backend,
    config: DockerConfig,
    started: bool,
}

impl DockerFactory {
    /// Create a new factory without contacting the daemon.
    /// Call `startup()` before use.
    pub fn new(docker: Docker, backend: Backend, config: DockerConfig) -> Self {
        Self {
            docker,
            backend,
            config,
            started: false,
        }
    }

    fn definition(&self, language: Language) -> ImageDefinition {
        ImageDefinition::new(&self.config, language, self.backend)
    }
}

fn is_not_found(e: &DockerApiError) -> bool {
    matches!(
        e,
        DockerApiError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl SandboxFactory for DockerFactory {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn startup(&mut self) -> sandbox::Result<()> {
        if self.started {
            return Err(SandboxError::CreationFailed("factory already started".into()));
        }
        check_prerequisites(&self.docker, self.backend).await?;
        clean_stale_containers(&self.docker, self.backend).await;
        self.started = true;
        info!(backend = %self.backend, "factory started");
        Ok(())
    }

    async fn image_exists(&self, language: Language) -> sandbox::Result<bool> {
        let definition = self.definition(language);
        let image = match self.docker.inspect_image(&definition.tag).await {
            Ok(image) => image,
            Err(e) if is_not_found(&e) => return Ok(false),
            Err(e) => {
                return Err(SandboxError::BackendNotAvailable(format!(
                    "inspect image {}: {e}",
                    definition.tag
                )));
            }
        };

        let current = image
            .config
            .and_then(|c| c.labels)
            .and_then(|labels| labels.get(DEFINITION_LABEL).cloned());
        if current.as_deref() != Some(definition.fingerprint.as_str()) {
            info!(tag = %definition.tag, "runtime image is outdated");
            return Ok(false);
        }
        Ok(true)
    }

    async fn build_image(&self, language: Language) -> sandbox::Result<()> {
        let definition = self.definition(language);
        let context = definition
            .build_context()
            .map_err(|e| SandboxError::ImageBuildFailed(format!("build context: {e}")))?;

        info!(tag = %definition.tag, "building runtime image");
        let options = BuildImageOptionsBuilder::default()
            .dockerfile("Dockerfile")
            .t(&definition.tag)
            .rm(true)
            .forcerm(true)
            .build();

        let mut stream = self.docker.build_image(
            options,
            None,
            Some(bollard::body_full(bytes::Bytes::from(context))),
        );
        while let Some(step) = stream.next().await {
            let info = step.map_err(|e| {
                SandboxError::ImageBuildFailed(format!("{}: {e}", definition.tag))
            })?;
            if let Some(detail) = info.error_detail {
                let message = detail.message.unwrap_or_else(|| "unknown error".into());
                return Err(SandboxError::ImageBuildFailed(format!(
                    "{}: {message}",
                    definition.tag
                )));
            }
            if let Some(line) = info.stream.as_deref().map(str::trim)
                && !line.is_empty()
            {
                debug!(tag = %definition.tag, "{line}");
            }
        }

        info!(tag = %definition.tag, "runtime image built");
        Ok(())
    }

    async fn create(&self, config: SandboxConfig) -> sandbox::Result<Box<dyn Sandbox>> {
        if config.key.backend != self.backend {
            return Err(SandboxError::InvalidConfig(format!(
                "{} factory cannot create {} sandboxes",
                self.backend, config.key
            )));
        }
        let image = self.definition(config.key.language).tag;
        let sandbox = DockerSandbox::create(
            self.docker.clone(),
            &config,
            image,
            self.config.network_disabled,
            self.config.max_code_bytes,
        )
        .await?;
        info!(id = %sandbox.id, "sandbox created");
        Ok(Box::new(sandbox))
    }

    async fn destroy(
        &self,
        sandbox: Box<dyn Sandbox>,
    ) -> Result<(), (Box<dyn Sandbox>, SandboxError)> {
        let id = sandbox.id().to_string();
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&id, Some(options)).await {
            Ok(()) => {}
            // Already gone.
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                warn!(id = %id, error = %e, "failed to remove container");
                return Err((sandbox, SandboxError::DestroyFailed(format!("{id}: {e}"))));
            }
        }
        info!(id = %id, "sandbox destroyed");
        Ok(())
    }

    async fn shutdown(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        clean_stale_containers(&self.docker, self.backend).await;
        info!(backend = %self.backend, "factory shutdown complete");
    }
}
