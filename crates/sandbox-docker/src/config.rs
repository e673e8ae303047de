#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Daemon socket, e.g. `unix:///var/run/docker.sock`. `None` uses the
    /// local defaults (`DOCKER_HOST` or the platform socket).
    pub socket: Option<String>,
    /// Runtime images are tagged `{image_prefix}-{language}:{backend}`.
    pub image_prefix: String,
    pub python_base_image: String,
    pub node_base_image: String,
    /// Disable networking inside sandboxes.
    pub network_disabled: bool,
    /// Largest accepted code payload, in bytes.
    pub max_code_bytes: usize,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            image_prefix: "faas-runtime".into(),
            python_base_image: "python:3.12-slim".into(),
            node_base_image: "node:20-slim".into(),
            network_disabled: true,
            max_code_bytes: 96 * 1024,
        }
    }
}
