mod compare;
mod images;
mod run;

use std::path::Path;
use std::sync::Arc;

use faas_engine::config::{self, EngineConfig};
use faas_engine::{Engine, EngineError, EngineResult, JsonLinesSink, MetricsSink, StartupReport, TracingSink};
use sandbox::SandboxFactory;
use sandbox_docker::DockerFactory;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::info;

pub use compare::{CompareArgs, run_compare};
pub use images::run_images;
pub use run::{RunArgs, run_run};

/// Default per-execution timeout for the CLI.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

async fn load_config(path: Option<&Path>) -> EngineResult<EngineConfig> {
    match path {
        Some(path) => config::load(path).await,
        None => {
            info!("no config given, using defaults");
            Ok(EngineConfig::default())
        }
    }
}

/// One docker factory per enabled backend, sharing one daemon client.
fn docker_factories(config: &EngineConfig) -> EngineResult<Vec<Box<dyn SandboxFactory>>> {
    let docker_config = config.docker_config();
    let docker = sandbox_docker::connect(&docker_config)?;
    Ok(config
        .backends
        .iter()
        .map(|&backend| {
            Box::new(DockerFactory::new(docker.clone(), backend, docker_config.clone()))
                as Box<dyn SandboxFactory>
        })
        .collect())
}

async fn metrics_sink(config: &EngineConfig) -> EngineResult<Arc<dyn MetricsSink>> {
    match &config.metrics.jsonl_path {
        Some(path) => {
            let sink = JsonLinesSink::open(path)
                .await
                .map_err(|e| EngineError::Config(format!("metrics file {}: {e}", path.display())))?;
            info!(path = %sink.path().display(), "writing metrics as JSON lines");
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(TracingSink)),
    }
}

async fn start_engine(config: EngineConfig) -> EngineResult<(Engine, StartupReport)> {
    let factories = docker_factories(&config)?;
    let sink = metrics_sink(&config).await?;
    Engine::initialize(config, factories, sink).await
}

/// Read code from `source`, or from stdin when it is `-`.
async fn read_code(source: &Path) -> EngineResult<String> {
    if source == Path::new("-") {
        let mut code = String::new();
        tokio::io::stdin().read_to_string(&mut code).await?;
        Ok(code)
    } else {
        Ok(tokio::fs::read_to_string(source).await?)
    }
}

fn print_json<T: Serialize>(value: &T) -> EngineResult<()> {
    let json = serde_json::to_string_pretty(value).map_err(std::io::Error::from)?;
    println!("{json}");
    Ok(())
}

/// Function name used in metrics when none is given: the file stem.
fn function_name(name: Option<String>, source: &Path) -> String {
    if let Some(name) = name {
        return name;
    }
    if source == Path::new("-") {
        return "stdin".to_string();
    }
    source
        .file_stem()
        .map_or_else(|| "main".to_string(), |s| s.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_name_defaults_to_file_stem() {
        assert_eq!(function_name(None, Path::new("fns/fib.py")), "fib");
        assert_eq!(function_name(None, Path::new("-")), "stdin");
        assert_eq!(
            function_name(Some("hello".into()), Path::new("fns/fib.py")),
            "hello"
        );
    }

    #[tokio::test]
    async fn reads_code_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.py");
        tokio::fs::write(&path, "print(1+1)\n").await.unwrap();
        assert_eq!(read_code(&path).await.unwrap(), "print(1+1)\n");
        assert!(read_code(&dir.path().join("missing.py")).await.is_err());
    }
}
