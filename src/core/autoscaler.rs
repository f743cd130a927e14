//! Pool auto-scaling.
//!
//! [`evaluate`] decides on one pool from one observation and holds no I/O,
//! so the policy can be tested with synthetic clocks. [`AutoScaler`] feeds it
//! queue depths and host usage on an interval and applies the decisions.

use crate::config::{AutoscalerConfig, PoolConfig};
use crate::core::worker::WorkerPool;
use crate::error::AnvilResult;
use crate::metrics::{MetricsCollector, ResourceUsage};
use crate::queue::TaskQueue;
use crate::task::{PartitionId, WorkerType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// What the autoscaler saw for one pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolObservation {
    /// Queued tasks in the pool's lane across owned partitions
    pub backlog: usize,
    pub current_workers: usize,
    pub resources: ResourceUsage,
}

/// Per-pool memory between evaluations.
#[derive(Debug, Clone, Default)]
pub struct ScalerState {
    last_change: Option<Instant>,
    idle_since: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    ScaleUp { from: usize, to: usize },
    ScaleDown { from: usize, to: usize },
    Hold,
}

impl ScalingDecision {
    /// Target size, if the pool should change
    pub fn target(&self) -> Option<usize> {
        match self {
            Self::ScaleUp { to, .. } | Self::ScaleDown { to, .. } => Some(*to),
            Self::Hold => None,
        }
    }
}

/// Decide whether one pool should grow or shrink.
///
/// Grows by `step_up` while the backlog exceeds the threshold and the host
/// has CPU and memory headroom. Shrinks by `step_down` once the lane has been
/// empty for the idle window. No change happens within the cooldown of the
/// previous one, and targets never leave the pool bounds.
pub fn evaluate(
    state: &mut ScalerState,
    observation: &PoolObservation,
    bounds: &PoolConfig,
    policy: &AutoscalerConfig,
    now: Instant,
) -> ScalingDecision {
    if observation.backlog == 0 {
        state.idle_since.get_or_insert(now);
    } else {
        state.idle_since = None;
    }

    let cooling_down = state
        .last_change
        .is_some_and(|at| now.duration_since(at) < Duration::from_secs(policy.cooldown_secs));
    if cooling_down {
        return ScalingDecision::Hold;
    }

    let min = bounds.min_workers;
    let max = bounds.max_workers.max(min);
    let current = observation.current_workers;

    let decision = if current < min {
        ScalingDecision::ScaleUp { from: current, to: min }
    } else if current > max {
        ScalingDecision::ScaleDown { from: current, to: max }
    } else if observation.backlog > policy.scale_up_threshold
        && current < max
        && observation.resources.cpu_percent < policy.max_cpu_percent
        && observation.resources.memory_percent < policy.max_memory_percent
    {
        ScalingDecision::ScaleUp {
            from: current,
            to: (current + policy.step_up.max(1)).min(max),
        }
    } else if state
        .idle_since
        .is_some_and(|since| now.duration_since(since) >= Duration::from_secs(policy.idle_window_secs))
        && current > min
    {
        ScalingDecision::ScaleDown {
            from: current,
            to: current.saturating_sub(policy.step_down.max(1)).max(min),
        }
    } else {
        ScalingDecision::Hold
    };

    if decision != ScalingDecision::Hold {
        state.last_change = Some(now);
    }
    decision
}

/// Periodically resizes every pool.
pub struct AutoScaler {
    pools: Vec<Arc<WorkerPool>>,
    queue: TaskQueue,
    metrics: Arc<MetricsCollector>,
    partitions: Arc<Vec<PartitionId>>,
    policy: AutoscalerConfig,
    states: HashMap<WorkerType, ScalerState>,
}

impl AutoScaler {
    pub fn new(
        pools: Vec<Arc<WorkerPool>>,
        queue: TaskQueue,
        metrics: Arc<MetricsCollector>,
        partitions: Arc<Vec<PartitionId>>,
        policy: AutoscalerConfig,
    ) -> Self {
        Self {
            pools,
            queue,
            metrics,
            partitions,
            policy,
            states: HashMap::new(),
        }
    }

    /// Evaluate and apply one round of decisions.
    pub async fn tick(&mut self) -> AnvilResult<Vec<(WorkerType, ScalingDecision)>> {
        let depths = self.queue.queue_depths(&self.partitions).await?;
        let mut backlog: HashMap<WorkerType, usize> = HashMap::new();
        for (key, depth) in &depths {
            *backlog.entry(key.worker_type).or_default() += depth;
        }
        let resources = self.metrics.latest_resources();
        let now = Instant::now();

        let mut decisions = Vec::with_capacity(self.pools.len());
        for pool in &self.pools {
            let worker_type = pool.worker_type();
            let observation = PoolObservation {
                backlog: backlog.get(&worker_type).copied().unwrap_or_default(),
                current_workers: pool.current_workers(),
                resources,
            };
            let state = self.states.entry(worker_type).or_default();
            let decision = evaluate(state, &observation, pool.bounds(), &self.policy, now);

            if let Some(target) = decision.target() {
                let size = pool.resize(target).await;
                tracing::info!(
                    "🔨 Scaled {} pool {} -> {} (backlog {}, cpu {:.0}%, mem {:.0}%)",
                    worker_type,
                    observation.current_workers,
                    size,
                    observation.backlog,
                    resources.cpu_percent,
                    resources.memory_percent
                );
            }
            decisions.push((worker_type, decision));
        }
        Ok(decisions)
    }

    /// Tick every `interval_secs` until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.policy.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!("🔨 Autoscaler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick().await {
                tracing::warn!("🔨 Autoscaler tick failed: {}", e);
            }
        }

        tracing::info!("🔨 Autoscaler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AutoscalerConfig {
        AutoscalerConfig {
            scale_up_threshold: 10,
            step_up: 2,
            step_down: 1,
            idle_window_secs: 60,
            cooldown_secs: 30,
            max_cpu_percent: 85.0,
            max_memory_percent: 90.0,
            ..Default::default()
        }
    }

    fn observe(backlog: usize, current_workers: usize, cpu: f64) -> PoolObservation {
        PoolObservation {
            backlog,
            current_workers,
            resources: ResourceUsage {
                cpu_percent: cpu,
                memory_percent: 40.0,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_scales_up_on_backlog() {
        let mut state = ScalerState::default();
        let bounds = PoolConfig::new(1, 8);
        let decision = evaluate(&mut state, &observe(50, 2, 10.0), &bounds, &policy(), Instant::now());
        assert_eq!(decision, ScalingDecision::ScaleUp { from: 2, to: 4 });
    }

    #[test]
    fn test_scale_up_capped_at_max() {
        let mut state = ScalerState::default();
        let bounds = PoolConfig::new(1, 3);
        let decision = evaluate(&mut state, &observe(50, 2, 10.0), &bounds, &policy(), Instant::now());
        assert_eq!(decision, ScalingDecision::ScaleUp { from: 2, to: 3 });

        let mut state = ScalerState::default();
        let decision = evaluate(&mut state, &observe(50, 3, 10.0), &bounds, &policy(), Instant::now());
        assert_eq!(decision, ScalingDecision::Hold);
    }

    #[test]
    fn test_no_scale_up_under_resource_pressure() {
        let mut state = ScalerState::default();
        let bounds = PoolConfig::new(1, 8);
        let decision = evaluate(&mut state, &observe(50, 2, 95.0), &bounds, &policy(), Instant::now());
        assert_eq!(decision, ScalingDecision::Hold);
    }

    #[test]
    fn test_scales_down_after_idle_window() {
        let mut state = ScalerState::default();
        let bounds = PoolConfig::new(1, 8);
        let start = Instant::now();

        assert_eq!(
            evaluate(&mut state, &observe(0, 4, 10.0), &bounds, &policy(), start),
            ScalingDecision::Hold
        );
        assert_eq!(
            evaluate(&mut state, &observe(0, 4, 10.0), &bounds, &policy(), start + Duration::from_secs(30)),
            ScalingDecision::Hold
        );
        assert_eq!(
            evaluate(&mut state, &observe(0, 4, 10.0), &bounds, &policy(), start + Duration::from_secs(60)),
            ScalingDecision::ScaleDown { from: 4, to: 3 }
        );
    }

    #[test]
    fn test_backlog_resets_idle_window() {
        let mut state = ScalerState::default();
        let bounds = PoolConfig::new(1, 8);
        let start = Instant::now();

        evaluate(&mut state, &observe(0, 4, 10.0), &bounds, &policy(), start);
        evaluate(&mut state, &observe(3, 4, 10.0), &bounds, &policy(), start + Duration::from_secs(50));
        let decision = evaluate(
            &mut state,
            &observe(0, 4, 10.0),
            &bounds,
            &policy(),
            start + Duration::from_secs(70),
        );
        assert_eq!(decision, ScalingDecision::Hold);
    }

    #[test]
    fn test_cooldown_blocks_consecutive_changes() {
        let mut state = ScalerState::default();
        let bounds = PoolConfig::new(1, 16);
        let start = Instant::now();

        assert!(matches!(
            evaluate(&mut state, &observe(50, 2, 10.0), &bounds, &policy(), start),
            ScalingDecision::ScaleUp { .. }
        ));
        assert_eq!(
            evaluate(&mut state, &observe(50, 4, 10.0), &bounds, &policy(), start + Duration::from_secs(10)),
            ScalingDecision::Hold
        );
        assert_eq!(
            evaluate(&mut state, &observe(50, 4, 10.0), &bounds, &policy(), start + Duration::from_secs(31)),
            ScalingDecision::ScaleUp { from: 4, to: 6 }
        );
    }

    #[test]
    fn test_never_below_min() {
        let mut state = ScalerState::default();
        let bounds = PoolConfig::new(2, 8);
        let start = Instant::now();

        evaluate(&mut state, &observe(0, 2, 10.0), &bounds, &policy(), start);
        let decision = evaluate(
            &mut state,
            &observe(0, 2, 10.0),
            &bounds,
            &policy(),
            start + Duration::from_secs(120),
        );
        assert_eq!(decision, ScalingDecision::Hold);

        // Out-of-bounds pools are pulled back in regardless of backlog.
        let mut state = ScalerState::default();
        let decision = evaluate(&mut state, &observe(0, 0, 10.0), &bounds, &policy(), start);
        assert_eq!(decision, ScalingDecision::ScaleUp { from: 0, to: 2 });
    }
}
