use bollard::models::ContainerStatsResponse;
use sandbox::ResourceSample;

/// Cumulative cpu counters from one stats reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CpuCounters {
    /// Container cpu time, nanoseconds.
    pub container: u64,
    /// Host cpu time, nanoseconds.
    pub system: u64,
}

/// The subset of a stats reading the sampler needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RawStats {
    pub memory_usage: u64,
    /// Reclaimable page cache included in `memory_usage`.
    pub memory_cache: u64,
    pub cpu: Option<CpuCounters>,
    pub online_cpus: u32,
}

impl RawStats {
    pub fn from_response(stats: &ContainerStatsResponse) -> Option<Self> {
        let memory = stats.memory_stats.as_ref()?;
        let memory_usage = memory.usage?;
        // cgroup v2 reports `inactive_file`, cgroup v1 reports `cache`.
        let memory_cache = memory
            .stats
            .as_ref()
            .and_then(|s| s.get("inactive_file").or_else(|| s.get("cache")).copied())
            .unwrap_or(0);

        let counters = |cpu: &bollard::models::ContainerCpuStats| -> Option<CpuCounters> {
            Some(CpuCounters {
                container: cpu.cpu_usage.as_ref()?.total_usage?,
                system: cpu.system_cpu_usage?,
            })
        };
        let cpu = stats.cpu_stats.as_ref().and_then(counters);
        let online_cpus = stats
            .cpu_stats
            .as_ref()
            .and_then(|c| {
                c.online_cpus.or_else(|| {
                    c.cpu_usage
                        .as_ref()
                        .and_then(|u| u.percpu_usage.as_ref())
                        .map(|p| p.len() as u32)
                })
            })
            .unwrap_or(1)
            .max(1);

        Some(Self {
            memory_usage,
            memory_cache,
            cpu,
            online_cpus,
        })
    }

    /// Convert to a sample with cpu usage measured since `previous`.
    ///
    /// One-shot readings carry no usable `precpu`, so without a previous
    /// reading of our own there is no cpu figure.
    pub fn to_sample(self, previous: Option<CpuCounters>) -> ResourceSample {
        let cpu_percent = match (self.cpu, previous) {
            (Some(now), Some(before)) => Some(cpu_percent(before, now, self.online_cpus)),
            _ => None,
        };
        ResourceSample {
            memory_bytes: self.memory_usage.saturating_sub(self.memory_cache),
            cpu_percent,
        }
    }
}

/// The cpu reading the next sample is measured against.
///
/// Reset when an execution is injected: a pooled container's last reading
/// belongs to the previous execution and spans the idle gap since.
#[derive(Debug, Default)]
pub(crate) struct CpuBaseline {
    last: Option<CpuCounters>,
}

impl CpuBaseline {
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn observe(&mut self, raw: RawStats) -> ResourceSample {
        let sample = raw.to_sample(self.last);
        if raw.cpu.is_some() {
            self.last = raw.cpu;
        }
        sample
    }
}

/// Cpu usage the way `docker stats` computes it.
pub(crate) fn cpu_percent(before: CpuCounters, now: CpuCounters, online_cpus: u32) -> f64 {
    let container_delta = now.container.saturating_sub(before.container);
    let system_delta = now.system.saturating_sub(before.system);
    if system_delta == 0 || container_delta == 0 {
        return 0.0;
    }
    (container_delta as f64 / system_delta as f64) * f64::from(online_cpus) * 100.0
}
