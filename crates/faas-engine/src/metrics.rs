//! Per-execution metrics records and where they go.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sandbox::{Backend, Language};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::info;

/// One execution as seen by the metrics store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub function_name: String,
    pub language: Language,
    pub backend: Backend,
    pub timestamp: DateTime<Utc>,
    /// Injection to completion or forced termination.
    pub response_time_ms: f64,
    /// Peak memory.
    pub memory_usage_mb: f64,
    /// Average cpu over the samples.
    pub cpu_usage_percent: f64,
    pub cpu_peak_percent: f64,
    pub samples: u32,
    /// At least one sample failed, or none was taken.
    pub partial_metrics: bool,
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for metrics records.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, record: &MetricsRecord) -> Result<(), SinkError>;
}

/// Emits each record as a structured `tracing` event.
pub struct TracingSink;

#[async_trait]
impl MetricsSink for TracingSink {
    async fn record(&self, r: &MetricsRecord) -> Result<(), SinkError> {
        info!(
            target: "faas_engine::metrics",
            function = %r.function_name,
            language = %r.language,
            backend = %r.backend,
            response_time_ms = r.response_time_ms,
            memory_usage_mb = r.memory_usage_mb,
            cpu_usage_percent = r.cpu_usage_percent,
            samples = r.samples,
            partial = r.partial_metrics,
            error = r.error,
            error_kind = r.error_kind.as_deref().unwrap_or(""),
            "execution metrics"
        );
        Ok(())
    }
}

/// Appends each record as one JSON line.
pub struct JsonLinesSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it and its parent directory.
    pub async fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(dir).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricsSink for JsonLinesSink {
    async fn record(&self, record: &MetricsRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<MetricsRecord>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<MetricsRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MetricsSink for MemorySink {
    async fn record(&self, record: &MetricsRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}
