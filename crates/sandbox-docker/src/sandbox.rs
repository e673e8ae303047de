use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::exec::{StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ExecConfig, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, KillContainerOptions, StartContainerOptions, StatsOptions,
};
use futures_util::StreamExt;
use sandbox::{
    ExecRequest, OutputCapture, OutputStream, PoolKey, ProcessExit, ResourceSample, Sandbox,
    SandboxConfig, SandboxError,
};
use tracing::{debug, info};

use crate::image::{SANDBOX_USER, WORKDIR, interpreter_command};
use crate::stats::{CpuBaseline, RawStats};

pub(crate) const ENGINE_LABEL: &str = "faas.engine";
pub(crate) const LANGUAGE_LABEL: &str = "faas.language";
pub(crate) const BACKEND_LABEL: &str = "faas.backend";

/// How long to wait for the daemon to report an exit code after the
/// output stream of an exec closes.
const EXIT_CODE_POLL: Duration = Duration::from_millis(10);
const EXIT_CODE_ATTEMPTS: u32 = 50;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SandboxState {
    Created = 0,
    Running = 1,
    Killed = 2,
}

impl SandboxState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            _ => Self::Killed,
        }
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Killed => f.write_str("killed"),
        }
    }
}

pub struct DockerSandbox {
    docker: Docker,
    /// Container name, also used as the API identifier.
    pub(crate) id: String,
    key: PoolKey,
    max_code_bytes: usize,
    state: AtomicU8,
    cpu_baseline: Mutex<CpuBaseline>,
}

impl DockerSandbox {
    /// Create the container (not started).
    pub(crate) async fn create(
        docker: Docker,
        config: &SandboxConfig,
        image: String,
        network_disabled: bool,
        max_code_bytes: usize,
    ) -> sandbox::Result<Self> {
        let key = config.key;
        let id = format!("faas-{}-{}-{}", key.language, key.backend, config.id);

        let labels = HashMap::from([
            (ENGINE_LABEL.to_string(), "1".to_string()),
            (LANGUAGE_LABEL.to_string(), key.language.to_string()),
            (BACKEND_LABEL.to_string(), key.backend.to_string()),
        ]);

        let limits = &config.resources;
        let host_config = HostConfig {
            runtime: Some(key.backend.oci_runtime().to_string()),
            memory: Some(i64::from(limits.memory_mb) * 1024 * 1024),
            nano_cpus: Some((limits.cpus * 1_000_000_000.0) as i64),
            pids_limit: Some(i64::from(limits.pids)),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(image),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some(WORKDIR.to_string()),
            network_disabled: Some(network_disabled),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(id.clone()),
            ..Default::default()
        };
        docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| SandboxError::CreationFailed(format!("create container {id}: {e}")))?;

        Ok(Self {
            docker,
            id,
            key,
            max_code_bytes,
            state: AtomicU8::new(SandboxState::Created as u8),
            cpu_baseline: Mutex::new(CpuBaseline::default()),
        })
    }

    fn current_state(&self) -> SandboxState {
        SandboxState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn ensure_running(&self) -> sandbox::Result<()> {
        match self.current_state() {
            SandboxState::Running => Ok(()),
            state => Err(SandboxError::ExecFailed(format!(
                "sandbox not running (state: {state})"
            ))),
        }
    }

    /// Wait for the daemon to publish the exit code of a finished exec.
    async fn exit_code(&self, exec_id: &str) -> sandbox::Result<i64> {
        for _ in 0..EXIT_CODE_ATTEMPTS {
            let inspect = self
                .docker
                .inspect_exec(exec_id)
                .await
                .map_err(|e| SandboxError::ExecFailed(format!("inspect exec: {e}")))?;
            if inspect.running != Some(true)
                && let Some(code) = inspect.exit_code
            {
                return Ok(code);
            }
            tokio::time::sleep(EXIT_CODE_POLL).await;
        }
        Err(SandboxError::ExecFailed(format!(
            "no exit code reported for exec {exec_id}"
        )))
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn key(&self) -> PoolKey {
        self.key
    }

    async fn start(&mut self) -> sandbox::Result<()> {
        if self.current_state() != SandboxState::Created {
            return Err(SandboxError::StartFailed("sandbox already started".into()));
        }
        self.docker
            .start_container(&self.id, None::<StartContainerOptions>)
            .await
            .map_err(|e| SandboxError::StartFailed(format!("start {}: {e}", self.id)))?;
        self.state
            .store(SandboxState::Running as u8, Ordering::Release);
        info!(id = %self.id, key = %self.key, "sandbox started");
        Ok(())
    }

    async fn kill(&mut self) -> sandbox::Result<()> {
        if self.current_state() == SandboxState::Killed {
            return Ok(());
        }
        self.state.store(SandboxState::Killed as u8, Ordering::Release);
        // The default signal is SIGKILL.
        self.docker
            .kill_container(&self.id, None::<KillContainerOptions>)
            .await
            .map_err(|e| SandboxError::KillFailed(format!("kill {}: {e}", self.id)))?;
        info!(id = %self.id, "sandbox killed");
        Ok(())
    }

    async fn exec(
        &self,
        request: &ExecRequest<'_>,
        output: &OutputCapture,
    ) -> sandbox::Result<ProcessExit> {
        self.ensure_running()?;
        if request.code.len() > self.max_code_bytes {
            return Err(SandboxError::InvalidConfig(format!(
                "code is {} bytes, limit is {}",
                request.code.len(),
                self.max_code_bytes
            )));
        }

        let config = ExecConfig {
            cmd: Some(interpreter_command(self.key.language, request.code)),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(WORKDIR.to_string()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&self.id, config)
            .await
            .map_err(|e| SandboxError::ExecFailed(format!("create exec: {e}")))?;

        let started = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| SandboxError::ExecFailed(format!("start exec: {e}")))?;

        let StartExecResults::Attached { output: mut stream, .. } = started else {
            return Err(SandboxError::ExecFailed("exec started detached".into()));
        };

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    debug!(id = %self.id, bytes = message.len(), "stdout chunk");
                    output.push(OutputStream::Stdout, &message);
                }
                Ok(LogOutput::StdErr { message }) => {
                    debug!(id = %self.id, bytes = message.len(), "stderr chunk");
                    output.push(OutputStream::Stderr, &message);
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(SandboxError::ExecFailed(format!("output stream: {e}")));
                }
            }
        }

        let exit_code = self.exit_code(&exec.id).await?;
        Ok(ProcessExit { exit_code })
    }

    fn begin_sampling(&self) {
        self.cpu_baseline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
    }

    async fn sample(&self) -> sandbox::Result<ResourceSample> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(&self.id, Some(options));
        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(SandboxError::StatsUnavailable(e.to_string())),
            None => return Err(SandboxError::StatsUnavailable("empty stats stream".into())),
        };
        let raw = RawStats::from_response(&stats)
            .ok_or_else(|| SandboxError::StatsUnavailable("no memory usage reported".into()))?;

        Ok(self
            .cpu_baseline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(raw))
    }
}
