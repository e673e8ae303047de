use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox::{Backend, Language, PoolKey, ResourceLimits};
use sandbox_docker::DockerConfig;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::pool::{ExhaustionPolicy, PoolConfig};

pub(crate) const DEFAULT_MIN_IDLE: usize = 1;
pub(crate) const DEFAULT_MAX_TOTAL: usize = 4;
pub(crate) const DEFAULT_MAX_EXECUTIONS: u32 = 50;
pub(crate) const DEFAULT_MAX_IDLE_SECS: u64 = 300;
pub(crate) const DEFAULT_MAX_RUNTIME_ERRORS: u32 = 3;
pub(crate) const DEFAULT_BLOCK_WAIT_MS: u64 = 2000;
pub(crate) const DEFAULT_MEMORY_MB: u32 = 256;
pub(crate) const DEFAULT_CPUS: f64 = 0.5;
pub(crate) const DEFAULT_PIDS: u32 = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backends: Vec<Backend>,
    pub languages: Vec<Language>,
    pub docker: DockerSection,
    /// Defaults for every pool.
    pub pool: PoolSection,
    /// Per-key overrides, keyed `language/backend`.
    pub pools: BTreeMap<String, PoolOverride>,
    pub sampler: SamplerSection,
    pub execution: ExecutionSection,
    pub maintenance: MaintenanceSection,
    pub metrics: MetricsSection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backends: Backend::ALL.to_vec(),
            languages: Language::ALL.to_vec(),
            docker: DockerSection::default(),
            pool: PoolSection::default(),
            pools: BTreeMap::new(),
            sampler: SamplerSection::default(),
            execution: ExecutionSection::default(),
            maintenance: MaintenanceSection::default(),
            metrics: MetricsSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSection {
    /// Daemon socket; the platform default when unset.
    pub socket: Option<String>,
    pub image_prefix: String,
    pub python_base_image: String,
    pub node_base_image: String,
    pub network_disabled: bool,
    pub max_code_bytes: usize,
}

impl Default for DockerSection {
    fn default() -> Self {
        let d = DockerConfig::default();
        Self {
            socket: d.socket,
            image_prefix: d.image_prefix,
            python_base_image: d.python_base_image,
            node_base_image: d.node_base_image,
            network_disabled: d.network_disabled,
            max_code_bytes: d.max_code_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ExhaustionSection {
    FailFast,
    Block { wait_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub min_idle: usize,
    pub max_total: usize,
    pub max_executions: u32,
    pub max_idle_secs: u64,
    pub max_runtime_errors: u32,
    pub exhaustion: ExhaustionSection,
    pub memory_mb: u32,
    pub cpus: f64,
    pub pids: u32,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            min_idle: DEFAULT_MIN_IDLE,
            max_total: DEFAULT_MAX_TOTAL,
            max_executions: DEFAULT_MAX_EXECUTIONS,
            max_idle_secs: DEFAULT_MAX_IDLE_SECS,
            max_runtime_errors: DEFAULT_MAX_RUNTIME_ERRORS,
            exhaustion: ExhaustionSection::Block {
                wait_ms: DEFAULT_BLOCK_WAIT_MS,
            },
            memory_mb: DEFAULT_MEMORY_MB,
            cpus: DEFAULT_CPUS,
            pids: DEFAULT_PIDS,
        }
    }
}

/// Fields left unset inherit from `pool`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolOverride {
    pub min_idle: Option<usize>,
    pub max_total: Option<usize>,
    pub max_executions: Option<u32>,
    pub max_idle_secs: Option<u64>,
    pub max_runtime_errors: Option<u32>,
    pub exhaustion: Option<ExhaustionSection>,
    pub memory_mb: Option<u32>,
    pub cpus: Option<f64>,
    pub pids: Option<u32>,
}

impl PoolSection {
    fn with_override(&self, o: &PoolOverride) -> PoolSection {
        PoolSection {
            min_idle: o.min_idle.unwrap_or(self.min_idle),
            max_total: o.max_total.unwrap_or(self.max_total),
            max_executions: o.max_executions.unwrap_or(self.max_executions),
            max_idle_secs: o.max_idle_secs.unwrap_or(self.max_idle_secs),
            max_runtime_errors: o.max_runtime_errors.unwrap_or(self.max_runtime_errors),
            exhaustion: o.exhaustion.unwrap_or(self.exhaustion),
            memory_mb: o.memory_mb.unwrap_or(self.memory_mb),
            cpus: o.cpus.unwrap_or(self.cpus),
            pids: o.pids.unwrap_or(self.pids),
        }
    }

    fn validate(&self, label: &str) -> EngineResult<()> {
        let fail = |msg: &str| Err(EngineError::Config(format!("{label}: {msg}")));
        if self.max_total == 0 {
            return fail("max_total must be at least 1");
        }
        if self.min_idle > self.max_total {
            return fail("min_idle must not exceed max_total");
        }
        if self.max_executions == 0 {
            return fail("max_executions must be at least 1");
        }
        if self.max_runtime_errors == 0 {
            return fail("max_runtime_errors must be at least 1");
        }
        if self.max_idle_secs == 0 {
            return fail("max_idle_secs must be positive");
        }
        if self.memory_mb == 0 || self.pids == 0 {
            return fail("memory_mb and pids must be positive");
        }
        if !(self.cpus.is_finite() && self.cpus > 0.0) {
            return fail("cpus must be positive");
        }
        Ok(())
    }

    fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_idle: self.min_idle,
            max_total: self.max_total,
            max_executions: self.max_executions,
            max_idle: Duration::from_secs(self.max_idle_secs),
            max_runtime_errors: self.max_runtime_errors,
            exhaustion: match self.exhaustion {
                ExhaustionSection::FailFast => ExhaustionPolicy::FailFast,
                ExhaustionSection::Block { wait_ms } => ExhaustionPolicy::Block {
                    wait: Duration::from_millis(wait_ms),
                },
            },
            resources: ResourceLimits {
                memory_mb: self.memory_mb,
                cpus: self.cpus,
                pids: self.pids,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSection {
    pub interval_ms: u64,
}

impl Default for SamplerSection {
    fn default() -> Self {
        Self { interval_ms: 100 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareMode {
    /// One backend after the other, so the runs do not compete for the host.
    #[default]
    Sequential,
    Concurrent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    /// Per-stream cap on captured output.
    pub max_output_bytes: usize,
    pub compare: CompareMode,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_output_bytes: 1024 * 1024,
            compare: CompareMode::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSection {
    pub interval_secs: u64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    /// Append every metrics record to this JSON-lines file.
    pub jsonl_path: Option<PathBuf>,
}

/// Load and validate an engine config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> EngineResult<EngineConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| EngineError::Config(format!("read {}: {e}", path.display())))?;
    let mut config = parse(&content)
        .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    Ok(config)
}

/// Parse and validate YAML. An empty document yields the defaults.
pub fn parse(content: &str) -> EngineResult<EngineConfig> {
    let config: EngineConfig = if content.trim().is_empty() {
        EngineConfig::default()
    } else {
        serde_yaml_ng::from_str(content)
            .map_err(|e| EngineError::Config(format!("parse: {e}")))?
    };
    config.validate()?;
    Ok(config)
}

impl EngineConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        if let Some(p) = &mut self.metrics.jsonl_path
            && p.is_relative()
        {
            *p = config_dir.join(&*p);
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.backends.is_empty() {
            return Err(EngineError::Config("backends must not be empty".into()));
        }
        if self.languages.is_empty() {
            return Err(EngineError::Config("languages must not be empty".into()));
        }
        if self.sampler.interval_ms == 0 {
            return Err(EngineError::Config("sampler.interval_ms must be positive".into()));
        }
        if self.maintenance.interval_secs == 0 {
            return Err(EngineError::Config(
                "maintenance.interval_secs must be positive".into(),
            ));
        }
        if self.execution.max_output_bytes == 0 || self.docker.max_code_bytes == 0 {
            return Err(EngineError::Config(
                "max_output_bytes and max_code_bytes must be positive".into(),
            ));
        }
        self.pool.validate("pool")?;
        for (name, o) in &self.pools {
            let key: PoolKey = name
                .parse()
                .map_err(|e| EngineError::Config(format!("pools.{name}: {e}")))?;
            self.pool.with_override(o).validate(&format!("pools.{key}"))?;
        }
        Ok(())
    }

    /// Every enabled (language, backend) pair.
    pub fn keys(&self) -> Vec<PoolKey> {
        PoolKey::all()
            .filter(|k| self.languages.contains(&k.language) && self.backends.contains(&k.backend))
            .collect()
    }

    /// Effective pool settings for `key`, overrides applied.
    pub fn pool_config(&self, key: PoolKey) -> PoolConfig {
        let section = self
            .pools
            .iter()
            .find(|(name, _)| name.parse::<PoolKey>().ok() == Some(key))
            .map(|(_, o)| self.pool.with_override(o))
            .unwrap_or_else(|| self.pool.clone());
        section.to_pool_config()
    }

    pub fn sampler_interval(&self) -> Duration {
        Duration::from_millis(self.sampler.interval_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance.interval_secs)
    }

    /// Build a `sandbox_docker::DockerConfig` from this engine config.
    pub fn docker_config(&self) -> DockerConfig {
        DockerConfig {
            socket: self.docker.socket.clone(),
            image_prefix: self.docker.image_prefix.clone(),
            python_base_image: self.docker.python_base_image.clone(),
            node_base_image: self.docker.node_base_image.clone(),
            network_disabled: self.docker.network_disabled,
            max_code_bytes: self.docker.max_code_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default_config() {
        let config = parse("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.keys().len(), 4);
        let pool = config.pool_config(PoolKey::new(Language::Python, Backend::Gvisor));
        assert_eq!(pool.max_executions, 50);
        assert_eq!(pool.max_idle, Duration::from_secs(300));
        assert_eq!(pool.max_runtime_errors, 3);
    }

    #[test]
    fn per_key_override_inherits_defaults() {
        let yaml = r#"
pool:
  min_idle: 2
  max_total: 6
  exhaustion:
    policy: fail_fast
pools:
  python/runsc:
    max_total: 3
    memory_mb: 512
"#;
        let config = parse(yaml).unwrap();
        let key = PoolKey::new(Language::Python, Backend::Gvisor);
        let pool = config.pool_config(key);
        assert_eq!(pool.max_total, 3);
        assert_eq!(pool.min_idle, 2);
        assert_eq!(pool.resources.memory_mb, 512);
        assert_eq!(pool.exhaustion, ExhaustionPolicy::FailFast);

        let other = config.pool_config(PoolKey::new(Language::Node, Backend::Gvisor));
        assert_eq!(other.max_total, 6);
        assert_eq!(other.resources.memory_mb, DEFAULT_MEMORY_MB);
    }

    #[test]
    fn block_policy_parses_wait() {
        let config = parse("pool:\n  exhaustion:\n    policy: block\n    wait_ms: 250\n").unwrap();
        let pool = config.pool_config(PoolKey::new(Language::Node, Backend::Standard));
        assert_eq!(
            pool.exhaustion,
            ExhaustionPolicy::Block {
                wait: Duration::from_millis(250)
            }
        );
    }

    #[test]
    fn enabled_lists_restrict_keys() {
        let config = parse("backends: [runc]\nlanguages: [node]\n").unwrap();
        assert_eq!(
            config.keys(),
            vec![PoolKey::new(Language::Node, Backend::Standard)]
        );
    }

    #[test]
    fn min_idle_above_max_total_is_rejected() {
        let err = parse("pool:\n  min_idle: 5\n  max_total: 2\n").unwrap_err();
        assert!(err.to_string().contains("min_idle"), "got: {err}");
    }

    #[test]
    fn override_is_validated_too() {
        let err = parse("pools:\n  node/runc:\n    max_total: 0\n").unwrap_err();
        assert!(err.to_string().contains("pools.node/runc"), "got: {err}");
    }

    #[test]
    fn unknown_pool_key_is_rejected() {
        let err = parse("pools:\n  ruby/runc:\n    max_total: 2\n").unwrap_err();
        assert!(err.to_string().contains("ruby"), "got: {err}");
    }

    #[test]
    fn zero_sampler_interval_is_rejected() {
        assert!(parse("sampler:\n  interval_ms: 0\n").is_err());
    }

    #[test]
    fn docker_config_carries_section() {
        let config = parse("docker:\n  image_prefix: bench\n  network_disabled: false\n").unwrap();
        let docker = config.docker_config();
        assert_eq!(docker.image_prefix, "bench");
        assert!(!docker.network_disabled);
        assert_eq!(docker.python_base_image, "python:3.12-slim");
    }

    #[tokio::test]
    async fn load_resolves_relative_metrics_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        tokio::fs::write(&path, "metrics:\n  jsonl_path: out/metrics.jsonl\n")
            .await
            .unwrap();

        let config = load(&path).await.unwrap();
        assert_eq!(
            config.metrics.jsonl_path,
            Some(dir.path().join("out/metrics.jsonl"))
        );
    }

    #[tokio::test]
    async fn load_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("nope.yaml")).await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
