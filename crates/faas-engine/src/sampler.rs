use std::convert::Infallible;
use std::time::Duration;

use sandbox::{ResourceSample, Sandbox};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Aggregated resource usage of one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SamplerReport {
    pub elapsed: Duration,
    pub peak_memory_mb: f64,
    pub avg_cpu_percent: f64,
    pub peak_cpu_percent: f64,
    pub samples: u32,
    pub failed_samples: u32,
}

impl SamplerReport {
    pub fn response_time_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }

    /// Some samples failed or none were taken.
    pub fn partial(&self) -> bool {
        self.failed_samples > 0 || self.samples == 0
    }
}

/// Polls a container's resource usage while code runs in it.
pub struct MetricsSampler {
    interval: Duration,
    started: Instant,
    peak_memory_bytes: u64,
    cpu_sum: f64,
    cpu_peak: f64,
    /// Samples that carried a cpu figure.
    cpu_samples: u32,
    samples: u32,
    failed_samples: u32,
}

impl MetricsSampler {
    /// Start the response-time clock. Call right before injecting code.
    pub fn start(interval: Duration) -> Self {
        Self {
            interval,
            started: Instant::now(),
            peak_memory_bytes: 0,
            cpu_sum: 0.0,
            cpu_peak: 0.0,
            cpu_samples: 0,
            samples: 0,
            failed_samples: 0,
        }
    }

    /// Sample `sandbox` every interval, starting immediately. Never returns;
    /// race it against the execution and drop it when that finishes.
    pub async fn watch(&mut self, sandbox: &dyn Sandbox) -> Infallible {
        sandbox.begin_sampling();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sandbox.sample().await {
                Ok(sample) => self.observe(sample),
                Err(e) => {
                    self.failed_samples += 1;
                    debug!(container = %sandbox.id(), error = %e, "sample failed");
                }
            }
        }
    }

    fn observe(&mut self, sample: ResourceSample) {
        self.samples += 1;
        self.peak_memory_bytes = self.peak_memory_bytes.max(sample.memory_bytes);
        if let Some(cpu) = sample.cpu_percent {
            self.cpu_samples += 1;
            self.cpu_sum += cpu;
            self.cpu_peak = self.cpu_peak.max(cpu);
        }
    }

    /// Stop the clock at `ended` and aggregate.
    pub fn finish(self, ended: Instant) -> SamplerReport {
        let avg_cpu_percent = if self.cpu_samples == 0 {
            0.0
        } else {
            self.cpu_sum / f64::from(self.cpu_samples)
        };
        SamplerReport {
            elapsed: ended.saturating_duration_since(self.started),
            peak_memory_mb: self.peak_memory_bytes as f64 / BYTES_PER_MB,
            avg_cpu_percent,
            peak_cpu_percent: self.cpu_peak,
            samples: self.samples,
            failed_samples: self.failed_samples,
        }
    }
}
