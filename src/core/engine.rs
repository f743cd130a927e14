//! The anvilq engine - owns the worker pools and the background loops.
//!
//! The engine is responsible for coordinating all the moving parts:
//! - One worker pool per worker type
//! - Pool auto-scaling
//! - Metrics sampling
//! - Retention sweeps
//! - Health monitoring

use crate::config::AnvilConfig;
use crate::core::autoscaler::AutoScaler;
use crate::core::worker::{WorkerContext, WorkerPool};
use crate::metrics::{MetricsCollector, PoolSnapshot, ResourceProbe};
use crate::queue::TaskQueue;
use crate::task::{PartitionId, WorkerType};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};

/// Overall condition reported by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Running on the memory fallback, or some pools are below their minimum
    Degraded,
    /// No workers, or the queue store fails its health check
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Critical => "CRITICAL",
        })
    }
}

/// Running pools and loops of a started scheduler.
pub struct Engine {
    queue: TaskQueue,
    pools: Vec<Arc<WorkerPool>>,
    shutdown: watch::Sender<bool>,
    loops: Vec<(&'static str, JoinHandle<()>)>,
    shutdown_timeout: Duration,
    started_at: Instant,
}

impl Engine {
    /// Spawn every pool at its initial size and start the background loops.
    pub async fn start(
        config: &AnvilConfig,
        ctx: WorkerContext,
        metrics: Arc<MetricsCollector>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        let queue = ctx.queue.clone();
        let partitions = Arc::clone(&ctx.partitions);

        let mut pools = Vec::with_capacity(WorkerType::ALL.len());
        for worker_type in WorkerType::ALL {
            let pool = Arc::new(WorkerPool::new(
                worker_type,
                config.workers.pool(worker_type).clone(),
                ctx.clone(),
            ));
            let started = pool.start().await;
            tracing::info!("🔨 {} pool started with {} workers", worker_type, started);
            pools.push(pool);
        }

        let (shutdown, _) = watch::channel(false);
        let mut loops = Vec::new();

        if config.autoscaler.enabled {
            let scaler = AutoScaler::new(
                pools.clone(),
                queue.clone(),
                Arc::clone(&metrics),
                Arc::clone(&partitions),
                config.autoscaler.clone(),
            );
            loops.push(("autoscaler", tokio::spawn(scaler.run(shutdown.subscribe()))));
        }

        let sampler = {
            let queue = queue.clone();
            let pools = pools.clone();
            let partitions = Arc::clone(&partitions);
            let metrics = Arc::clone(&metrics);
            move || {
                sample(
                    queue.clone(),
                    pools.clone(),
                    Arc::clone(&partitions),
                    Arc::clone(&metrics),
                    Arc::clone(&probe),
                )
            }
        };
        loops.push((
            "metrics sampler",
            spawn_periodic(
                "Metrics sampler",
                Duration::from_secs(config.metrics.sample_interval_secs.max(1)),
                shutdown.subscribe(),
                sampler,
            ),
        ));

        let janitor = {
            let queue = queue.clone();
            let policy = config.retention.clone();
            move || sweep(queue.clone(), policy.clone())
        };
        loops.push((
            "retention janitor",
            spawn_periodic(
                "Retention janitor",
                Duration::from_secs(config.retention.sweep_interval_secs.max(1)),
                shutdown.subscribe(),
                janitor,
            ),
        ));

        let monitor = {
            let queue = queue.clone();
            let pools = pools.clone();
            let metrics = Arc::clone(&metrics);
            let started_at = Instant::now();
            move || monitor(queue.clone(), pools.clone(), Arc::clone(&metrics), started_at)
        };
        loops.push((
            "health monitor",
            spawn_periodic(
                "Health monitor",
                Duration::from_secs(config.engine.health_check_interval_secs.max(1)),
                shutdown.subscribe(),
                monitor,
            ),
        ));

        Self {
            queue,
            pools,
            shutdown,
            loops,
            shutdown_timeout: Duration::from_secs(config.workers.shutdown_timeout_secs),
            started_at: Instant::now(),
        }
    }

    pub fn pools(&self) -> &[Arc<WorkerPool>] {
        &self.pools
    }

    pub fn pool_snapshots(&self) -> HashMap<WorkerType, PoolSnapshot> {
        pool_snapshots(&self.pools)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Current health, checking the queue store on the way.
    pub async fn health(&self) -> HealthStatus {
        health_status(&self.queue, &self.pools).await
    }

    /// Stop the loops, then drain every pool within the shutdown deadline.
    ///
    /// Returns the number of workers that had to be aborted.
    pub async fn stop(self) -> usize {
        tracing::info!("🔨 Shutting down engine...");
        let _ = self.shutdown.send(true);

        for (name, handle) in self.loops {
            let abort = handle.abort_handle();
            if timeout(Duration::from_secs(5), handle).await.is_err() {
                tracing::warn!("🔨 {} did not stop in time, aborted", name);
                abort.abort();
            }
        }

        let drains = self
            .pools
            .iter()
            .map(|pool| pool.shutdown(self.shutdown_timeout));
        let aborted: usize = futures::future::join_all(drains).await.into_iter().sum();

        tracing::info!(
            "🔨 Engine shutdown complete after {:?} ({} workers aborted)",
            self.started_at.elapsed(),
            aborted
        );
        aborted
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("queue", &self.queue.kind())
            .field("pools", &self.pools)
            .field("uptime", &self.uptime())
            .finish()
    }
}

fn pool_snapshots(pools: &[Arc<WorkerPool>]) -> HashMap<WorkerType, PoolSnapshot> {
    pools
        .iter()
        .map(|pool| (pool.worker_type(), pool.snapshot()))
        .collect()
}

async fn health_status(queue: &TaskQueue, pools: &[Arc<WorkerPool>]) -> HealthStatus {
    let workers: usize = pools.iter().map(|p| p.current_workers()).sum();
    if workers == 0 || queue.health_check().await.is_err() {
        return HealthStatus::Critical;
    }

    let below_min = pools
        .iter()
        .any(|p| p.current_workers() < p.bounds().min_workers);
    if below_min || queue.kind() == "memory-fallback" {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Run `tick` every `period` until the shutdown signal.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tracing::info!("🔨 {} started", name);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            tick().await;
        }

        tracing::info!("🔨 {} stopped", name);
    })
}

async fn sample(
    queue: TaskQueue,
    pools: Vec<Arc<WorkerPool>>,
    partitions: Arc<Vec<PartitionId>>,
    metrics: Arc<MetricsCollector>,
    probe: Arc<dyn ResourceProbe>,
) {
    let depths = match queue.queue_depths(&partitions).await {
        Ok(depths) => depths,
        Err(e) => {
            tracing::warn!("🔨 Failed to sample queue depths: {}", e);
            return;
        }
    };
    // procfs reads are blocking
    let resources = match tokio::task::spawn_blocking(move || probe.sample()).await {
        Ok(usage) => usage,
        Err(e) => {
            tracing::warn!("🔨 Resource probe failed: {}", e);
            Default::default()
        }
    };
    metrics.record_sample(&depths, pool_snapshots(&pools), resources);
}

async fn sweep(queue: TaskQueue, policy: crate::config::RetentionPolicy) {
    match queue.enforce_retention(&policy).await {
        Ok(report) if report.tasks_evicted + report.dead_letters_evicted > 0 => {
            tracing::debug!(
                "🔨 Retention evicted {} tasks and {} dead letters",
                report.tasks_evicted,
                report.dead_letters_evicted
            );
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("🔨 Retention sweep failed: {}", e),
    }
}

async fn monitor(
    queue: TaskQueue,
    pools: Vec<Arc<WorkerPool>>,
    metrics: Arc<MetricsCollector>,
    started_at: Instant,
) {
    let status = health_status(&queue, &pools).await;
    let snapshot = metrics.snapshot();
    let workers: usize = pools.iter().map(|p| p.current_workers()).sum();
    let busy: usize = pools.iter().map(|p| p.busy_workers()).sum();
    let pending: usize = snapshot.pending_by_priority.values().sum();
    let totals = snapshot.totals;

    tracing::info!(
        "🔨 HEALTH CHECK - Status: {} | Store: {} | Workers: {} ({} busy) | Pending: {} | C:{} R:{} D:{} | {:.2}/s | Uptime: {:?}",
        status,
        queue.kind(),
        workers,
        busy,
        pending,
        totals.completed,
        totals.retried,
        totals.dead_lettered,
        snapshot.throughput_per_second,
        started_at.elapsed()
    );

    if status == HealthStatus::Critical {
        tracing::error!("🔨 CRITICAL: no workers running or queue store failing its health check");
    }
}
