use std::collections::HashMap;

use bollard::Docker;
use bollard::query_parameters::{ListContainersOptions, RemoveContainerOptions};
use sandbox::{Backend, SandboxError};
use tracing::{info, warn};

use crate::sandbox::{BACKEND_LABEL, ENGINE_LABEL};

/// Verify the daemon is reachable and knows the backend's OCI runtime.
///
/// Collects all failures and returns them in a single `BackendNotAvailable` error.
pub(crate) async fn check_prerequisites(docker: &Docker, backend: Backend) -> sandbox::Result<()> {
    let mut errors = Vec::new();

    if let Err(e) = docker.ping().await {
        errors.push(format!("docker daemon not reachable: {e}"));
    } else {
        match docker.info().await {
            Ok(info) => {
                let runtimes: Vec<String> = info
                    .runtimes
                    .map(|r| r.into_keys().collect())
                    .unwrap_or_default();
                check_runtime(&runtimes, backend, &mut errors);
            }
            Err(e) => errors.push(format!("docker info: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::BackendNotAvailable(errors.join("; ")))
    }
}

fn check_runtime(registered: &[String], backend: Backend, errors: &mut Vec<String>) {
    let wanted = backend.oci_runtime();
    if !registered.iter().any(|r| r == wanted) {
        errors.push(format!(
            "OCI runtime {wanted} is not registered with the docker daemon (have: {})",
            registered.join(", ")
        ));
    }
}

/// Force-remove containers left behind by a previous engine process (best-effort).
pub(crate) async fn clean_stale_containers(docker: &Docker, backend: Backend) {
    let filters = HashMap::from([(
        "label".to_string(),
        vec![
            format!("{ENGINE_LABEL}=1"),
            format!("{BACKEND_LABEL}={backend}"),
        ],
    )]);
    let options = ListContainersOptions {
        all: true,
        filters: Some(filters),
        ..Default::default()
    };

    let containers = match docker.list_containers(Some(options)).await {
        Ok(containers) => containers,
        Err(e) => {
            warn!(backend = %backend, error = %e, "failed to list stale containers");
            return;
        }
    };

    let mut removed = 0usize;
    for id in containers.into_iter().filter_map(|c| c.id) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match docker.remove_container(&id, Some(options)).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(container = %id, error = %e, "failed to remove stale container"),
        }
    }
    if removed > 0 {
        info!(backend = %backend, removed, "removed stale containers");
    }
}
