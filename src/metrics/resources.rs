//! Host resource probes.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Host CPU and memory usage at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Busy share of all CPUs since the previous sample, 0-100
    pub cpu_percent: f64,
    /// Used share of physical memory, 0-100
    pub memory_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    /// One-minute load average
    pub load_average: f64,
}

/// Source of host resource samples.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Reads `/proc/stat`, `/proc/meminfo` and `/proc/loadavg`.
///
/// Reports zeros on platforms without procfs.
#[derive(Debug, Default)]
pub struct ProcResourceProbe {
    /// (idle, total) jiffies from the previous sample
    last_cpu: Mutex<Option<(u64, u64)>>,
}

impl ProcResourceProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn cpu_percent(&self, stat: &str) -> f64 {
        let Some((idle, total)) = parse_cpu_jiffies(stat) else {
            return 0.0;
        };
        let Ok(mut last) = self.last_cpu.lock() else {
            return 0.0;
        };
        let previous = last.replace((idle, total));

        match previous {
            Some((prev_idle, prev_total)) if total > prev_total => {
                let busy = (total - prev_total).saturating_sub(idle.saturating_sub(prev_idle));
                busy as f64 * 100.0 / (total - prev_total) as f64
            }
            // First sample: share since boot
            _ if total > 0 => total.saturating_sub(idle) as f64 * 100.0 / total as f64,
            _ => 0.0,
        }
    }
}

impl ResourceProbe for ProcResourceProbe {
    fn sample(&self) -> ResourceUsage {
        let mut usage = ResourceUsage::default();

        #[cfg(target_os = "linux")]
        {
            if let Ok(stat) = std::fs::read_to_string("/proc/stat") {
                usage.cpu_percent = self.cpu_percent(&stat);
            }
            if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
                if let Some((total, available)) = parse_meminfo(&meminfo) {
                    usage.memory_total_bytes = total;
                    usage.memory_used_bytes = total.saturating_sub(available);
                    if total > 0 {
                        usage.memory_percent = usage.memory_used_bytes as f64 * 100.0 / total as f64;
                    }
                }
            }
            if let Ok(load) = std::fs::read_to_string("/proc/loadavg") {
                if let Some(one_minute) = load.split_whitespace().next() {
                    usage.load_average = one_minute.parse().unwrap_or_default();
                }
            }
        }

        usage
    }
}

/// (idle + iowait, total) from the aggregate `cpu` line.
fn parse_cpu_jiffies(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or_default();
    // user..steal; guest and guest_nice are already counted in user and nice.
    Some((idle, fields.iter().take(8).sum()))
}

/// (MemTotal, MemAvailable) in bytes.
fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        let line = meminfo.lines().find(|l| l.starts_with(name))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb * 1024)
    };
    Some((field("MemTotal:")?, field("MemAvailable:")?))
}

/// Fixed readings, settable at runtime. For tests and hosts without procfs.
#[derive(Debug, Default)]
pub struct StaticResourceProbe {
    usage: Mutex<ResourceUsage>,
}

impl StaticResourceProbe {
    pub fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            usage: Mutex::new(ResourceUsage {
                cpu_percent,
                memory_percent,
                ..Default::default()
            }),
        }
    }

    pub fn set(&self, cpu_percent: f64, memory_percent: f64) {
        if let Ok(mut usage) = self.usage.lock() {
            usage.cpu_percent = cpu_percent;
            usage.memory_percent = memory_percent;
        }
    }
}

impl ResourceProbe for StaticResourceProbe {
    fn sample(&self) -> ResourceUsage {
        self.usage.lock().map(|u| *u).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_A: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\n";
    const STAT_B: &str = "cpu  150 0 150 750 150 0 0 0 0 0\ncpu0 75 0 75 375 75 0 0 0 0 0\n";

    #[test]
    fn test_cpu_percent_uses_deltas() {
        let probe = ProcResourceProbe::new();
        // 800 idle of 1000 since boot
        assert!((probe.cpu_percent(STAT_A) - 20.0).abs() < 1e-9);
        // +100 busy, +100 idle
        assert!((probe.cpu_percent(STAT_B) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_guest_time_is_not_counted_twice() {
        // guest (90) is already part of user (100)
        let stat = "cpu  100 0 50 800 50 0 0 0 90 0\n";
        assert_eq!(parse_cpu_jiffies(stat), Some((850, 1000)));
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16000 kB\nMemFree:         1000 kB\nMemAvailable:    4000 kB\n";
        assert_eq!(parse_meminfo(meminfo), Some((16000 * 1024, 4000 * 1024)));
        assert_eq!(parse_meminfo("garbage"), None);
    }

    #[test]
    fn test_static_probe() {
        let probe = StaticResourceProbe::new(10.0, 20.0);
        assert_eq!(probe.sample().cpu_percent, 10.0);
        probe.set(95.0, 30.0);
        let usage = probe.sample();
        assert_eq!(usage.cpu_percent, 95.0);
        assert_eq!(usage.memory_percent, 30.0);
    }
}
