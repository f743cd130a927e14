//! Metrics collection for anvilq.
//!
//! Workers and the submission path only bump atomic counters. A sampler loop
//! periodically records queue depth, pool occupancy and host resources, and
//! [`MetricsCollector::snapshot`] combines both on demand.

use crate::queue::QueueKey;
use crate::task::{TaskPriority, WorkerType};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

pub mod resources;

#[cfg(feature = "prometheus")]
#[cfg_attr(docsrs, doc(cfg(feature = "prometheus")))]
pub mod prometheus;

pub use resources::{ProcResourceProbe, ResourceProbe, ResourceUsage, StaticResourceProbe};

/// Occupancy of one worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub current_workers: usize,
    /// Workers executing an attempt right now
    pub busy_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
}

impl PoolSnapshot {
    /// Busy share of the pool, 0.0-1.0
    pub fn utilization(&self) -> f64 {
        if self.current_workers == 0 {
            0.0
        } else {
            self.busy_workers as f64 / self.current_workers as f64
        }
    }
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricTotals {
    pub submitted: u64,
    /// Submissions refused by validation or rate limiting
    pub rejected: u64,
    pub completed: u64,
    /// Attempts that ended in an error
    pub failed_attempts: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Dead letters replayed by an operator
    pub replayed: u64,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Completions per second over the throughput window
    pub throughput_per_second: f64,
    /// Queued tasks per priority, across all lanes and owned partitions
    pub pending_by_priority: HashMap<TaskPriority, usize>,
    /// Queued tasks per worker-type lane
    pub pending_by_worker_type: HashMap<WorkerType, usize>,
    pub active_workers_by_type: HashMap<WorkerType, PoolSnapshot>,
    pub resource_usage: ResourceUsage,
    pub totals: MetricTotals,
    /// When the sampled fields were last refreshed
    pub sampled_at: Option<SystemTime>,
}

#[derive(Debug, Default)]
struct Sampled {
    pending_by_priority: HashMap<TaskPriority, usize>,
    pending_by_worker_type: HashMap<WorkerType, usize>,
    pools: HashMap<WorkerType, PoolSnapshot>,
    resources: ResourceUsage,
    sampled_at: Option<SystemTime>,
    /// (when, completed total) pairs inside the throughput window
    completions: VecDeque<(Instant, u64)>,
}

/// Counters and the most recent sample.
#[derive(Debug)]
pub struct MetricsCollector {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed_attempts: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    replayed: AtomicU64,
    throughput_window: Duration,
    sampled: RwLock<Sampled>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl MetricsCollector {
    pub fn new(throughput_window: Duration) -> Self {
        Self {
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            throughput_window,
            sampled: RwLock::new(Sampled::default()),
        }
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_attempt(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn totals(&self) -> MetricTotals {
        MetricTotals {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
        }
    }

    /// Record one sampler tick.
    pub fn record_sample(
        &self,
        depths: &HashMap<QueueKey, usize>,
        pools: HashMap<WorkerType, PoolSnapshot>,
        resources: ResourceUsage,
    ) {
        self.record_sample_at(Instant::now(), depths, pools, resources);
    }

    fn record_sample_at(
        &self,
        now: Instant,
        depths: &HashMap<QueueKey, usize>,
        pools: HashMap<WorkerType, PoolSnapshot>,
        resources: ResourceUsage,
    ) {
        let mut by_priority: HashMap<TaskPriority, usize> =
            TaskPriority::ALL_DESCENDING.iter().map(|p| (*p, 0)).collect();
        let mut by_worker_type: HashMap<WorkerType, usize> =
            WorkerType::ALL.iter().map(|w| (*w, 0)).collect();
        for (key, depth) in depths {
            *by_priority.entry(key.priority).or_default() += depth;
            *by_worker_type.entry(key.worker_type).or_default() += depth;
        }

        let completed = self.completed.load(Ordering::Relaxed);
        let Ok(mut sampled) = self.sampled.write() else {
            return;
        };
        sampled.pending_by_priority = by_priority;
        sampled.pending_by_worker_type = by_worker_type;
        sampled.pools = pools;
        sampled.resources = resources;
        sampled.sampled_at = Some(SystemTime::now());

        sampled.completions.push_back((now, completed));
        while let Some((at, _)) = sampled.completions.front() {
            if now.duration_since(*at) > self.throughput_window {
                sampled.completions.pop_front();
            } else {
                break;
            }
        }
    }

    /// Host resources from the latest sample
    pub fn latest_resources(&self) -> ResourceUsage {
        self.sampled
            .read()
            .map(|s| s.resources)
            .unwrap_or_default()
    }

    /// Completions per second across the samples inside the window.
    pub fn throughput_per_second(&self) -> f64 {
        let Ok(sampled) = self.sampled.read() else {
            return 0.0;
        };
        match (sampled.completions.front(), sampled.completions.back()) {
            (Some((first_at, first)), Some((last_at, last))) if last_at > first_at => {
                let elapsed = last_at.duration_since(*first_at).as_secs_f64();
                last.saturating_sub(*first) as f64 / elapsed
            }
            _ => 0.0,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let throughput_per_second = self.throughput_per_second();
        let totals = self.totals();
        let Ok(sampled) = self.sampled.read() else {
            return MetricsSnapshot {
                totals,
                ..Default::default()
            };
        };

        MetricsSnapshot {
            throughput_per_second,
            pending_by_priority: sampled.pending_by_priority.clone(),
            pending_by_worker_type: sampled.pending_by_worker_type.clone(),
            active_workers_by_type: sampled.pools.clone(),
            resource_usage: sampled.resources,
            totals,
            sampled_at: sampled.sampled_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = MetricsCollector::default();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_completed();
        metrics.record_failed_attempt();
        metrics.record_retried();
        metrics.record_dead_lettered();

        let totals = metrics.snapshot().totals;
        assert_eq!(totals.submitted, 2);
        assert_eq!(totals.completed, 1);
        assert_eq!(totals.failed_attempts, 1);
        assert_eq!(totals.retried, 1);
        assert_eq!(totals.dead_lettered, 1);
        assert_eq!(totals.rejected, 0);
    }

    #[test]
    fn test_sample_aggregates_depths() {
        let metrics = MetricsCollector::default();
        let mut depths = HashMap::new();
        depths.insert(QueueKey::new(WorkerType::CpuIntensive, 0, TaskPriority::High), 3);
        depths.insert(QueueKey::new(WorkerType::IoIntensive, 1, TaskPriority::High), 2);
        depths.insert(QueueKey::new(WorkerType::IoIntensive, 1, TaskPriority::Low), 1);

        let mut pools = HashMap::new();
        pools.insert(
            WorkerType::IoIntensive,
            PoolSnapshot {
                current_workers: 4,
                busy_workers: 1,
                min_workers: 2,
                max_workers: 8,
            },
        );
        metrics.record_sample(&depths, pools, ResourceUsage::default());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pending_by_priority[&TaskPriority::High], 5);
        assert_eq!(snapshot.pending_by_priority[&TaskPriority::Low], 1);
        assert_eq!(snapshot.pending_by_priority[&TaskPriority::Emergency], 0);
        assert_eq!(snapshot.pending_by_worker_type[&WorkerType::IoIntensive], 3);
        let io = snapshot.active_workers_by_type[&WorkerType::IoIntensive];
        assert_eq!(io.utilization(), 0.25);
        assert!(snapshot.sampled_at.is_some());
    }

    #[test]
    fn test_throughput_over_window() {
        let metrics = MetricsCollector::new(Duration::from_secs(60));
        let start = Instant::now();
        let empty = HashMap::new();

        metrics.record_sample_at(start, &empty, HashMap::new(), ResourceUsage::default());
        for _ in 0..20 {
            metrics.record_completed();
        }
        metrics.record_sample_at(
            start + Duration::from_secs(10),
            &empty,
            HashMap::new(),
            ResourceUsage::default(),
        );
        assert!((metrics.throughput_per_second() - 2.0).abs() < 1e-9);

        // The first sample falls out of the window.
        metrics.record_sample_at(
            start + Duration::from_secs(75),
            &empty,
            HashMap::new(),
            ResourceUsage::default(),
        );
        assert!((metrics.throughput_per_second() - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = MetricsCollector::default();
        metrics.record_sample(&HashMap::new(), HashMap::new(), ResourceUsage::default());
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["pending_by_priority"]["EMERGENCY"], 0);
    }
}
