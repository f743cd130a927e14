//! The `Anvil` scheduler and its components.
//!
//! `Anvil` is the single entry point: it owns the function registry, the
//! queue store, the metrics collector and, while started, the engine with
//! its worker pools.

use crate::config::AnvilConfig;
use crate::error::{AnvilError, AnvilResult};
use crate::metrics::{MetricsCollector, MetricsSnapshot, ProcResourceProbe, ResourceProbe};
use crate::queue::{QueueFactory, TaskQueue};
use crate::task::{DeadLetterEntry, DeadLetterFilter, Task, TaskDescriptor, TaskFilter, TaskId};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub mod autoscaler;
pub mod engine;
pub mod executor;
pub mod lock;
pub mod registry;
pub mod retry;
pub mod router;
pub mod submit;
pub mod worker;

pub use autoscaler::{AutoScaler, PoolObservation, ScalerState, ScalingDecision, evaluate};
pub use engine::{Engine, HealthStatus};
pub use executor::{ExecutionEngine, ExecutionReport};
pub use lock::{LockGuard, LockManager};
pub use registry::{FnHandler, FunctionRegistry, FunctionStats, TaskContext, TaskHandler};
pub use retry::{Disposition, RetryHandler};
pub use router::PartitionRouter;
pub use submit::{BatchError, BatchMode, BatchReport, SubmitReceipt, Submitter};
pub use worker::{WorkerContext, WorkerPool};

/// A scheduler instance.
///
/// # Examples
///
/// ```rust
/// use anvilq::prelude::*;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> AnvilResult<()> {
///     let anvil = Anvil::new(AnvilConfig::testing()).await?;
///     anvil
///         .register_fn("add", |_ctx, args| async move {
///             let sum: i64 = args.iter().filter_map(|a| a.as_i64()).sum();
///             Ok(json!(sum))
///         })
///         .await;
///
///     anvil.start().await?;
///     let receipt = anvil
///         .submit(TaskDescriptor::new("add").args(vec![json!(1), json!(2)]))
///         .await?;
///     println!("queued {}", receipt.task_id);
///     anvil.stop().await?;
///     Ok(())
/// }
/// ```
pub struct Anvil {
    config: AnvilConfig,
    queue: TaskQueue,
    registry: Arc<FunctionRegistry>,
    locks: LockManager,
    metrics: Arc<MetricsCollector>,
    probe: Arc<dyn ResourceProbe>,
    submitter: Submitter,
    retry: RetryHandler,
    executor: ExecutionEngine,
    engine: Mutex<Option<Engine>>,
}

impl Anvil {
    /// Create a scheduler with the queue store described by `config.queue`.
    pub async fn new(config: AnvilConfig) -> AnvilResult<Self> {
        validate(&config)?;
        let queue = QueueFactory::from_config(&config.queue).await?;
        Self::with_queue(config, queue)
    }

    /// Create a scheduler on top of an existing queue store.
    pub fn with_queue(config: AnvilConfig, queue: TaskQueue) -> AnvilResult<Self> {
        validate(&config)?;

        let router = PartitionRouter::new(config.partitions.count);
        let registry = Arc::new(FunctionRegistry::new());
        let locks = LockManager::new(queue.clone());
        let metrics = Arc::new(MetricsCollector::new(Duration::from_secs(
            config.metrics.throughput_window_secs,
        )));

        let submitter = Submitter::new(
            queue.clone(),
            router,
            config.tasks.clone(),
            config.rate_limits.clone(),
            Duration::from_secs(config.queue.visibility_timeout_secs),
            Arc::clone(&metrics),
        );
        let retry = RetryHandler::new(
            queue.clone(),
            config.retry.clone(),
            router,
            Arc::clone(&metrics),
        );
        let executor = ExecutionEngine::new(Arc::clone(&registry), locks.clone());

        tracing::info!(
            "🔨 Anvil ready: {} partitions, queue store '{}'",
            config.partitions.count,
            queue.kind()
        );

        Ok(Self {
            config,
            queue,
            registry,
            locks,
            metrics,
            probe: Arc::new(ProcResourceProbe::new()),
            submitter,
            retry,
            executor,
            engine: Mutex::new(None),
        })
    }

    /// Replace the host resource probe used by the sampler.
    pub fn with_resource_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Register `handler` under `name`.
    pub async fn register<H>(&self, name: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.registry.register(name, handler).await;
    }

    /// Register an async closure under `name`.
    pub async fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(TaskContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AnvilResult<Value>> + Send + 'static,
    {
        self.registry.register_fn(name, f).await;
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Submit one task.
    pub async fn submit(&self, descriptor: TaskDescriptor) -> AnvilResult<SubmitReceipt> {
        self.submitter.submit(descriptor).await
    }

    /// Submit many tasks; rejected descriptors don't stop the rest.
    pub async fn submit_batch(&self, descriptors: Vec<TaskDescriptor>, mode: BatchMode) -> BatchReport {
        self.submitter.submit_batch(descriptors, mode).await
    }

    pub async fn get_task(&self, task_id: &TaskId) -> AnvilResult<Task> {
        self.queue
            .get_task(task_id)
            .await?
            .ok_or_else(|| AnvilError::TaskNotFound {
                task_id: task_id.clone(),
            })
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> AnvilResult<Vec<Task>> {
        self.queue.list_tasks(filter).await
    }

    /// Counters plus fresh queue depths and pool occupancy.
    pub async fn get_metrics(&self) -> AnvilResult<MetricsSnapshot> {
        let partitions = self.config.partitions.assigned();
        let depths = self.queue.queue_depths(&partitions).await?;
        let pools = match self.engine.lock().await.as_ref() {
            Some(engine) => engine.pool_snapshots(),
            None => Default::default(),
        };
        self.metrics
            .record_sample(&depths, pools, self.metrics.latest_resources());
        Ok(self.metrics.snapshot())
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub async fn list_dead_letters(&self, filter: &DeadLetterFilter) -> AnvilResult<Vec<DeadLetterEntry>> {
        self.retry.list_dead_letters(filter).await
    }

    /// Re-submit a dead letter as a fresh task.
    pub async fn retry_dead_letter(&self, task_id: &TaskId) -> AnvilResult<Task> {
        self.retry.retry_dead_letter(task_id).await
    }

    pub async fn purge_dead_letter(&self, task_id: &TaskId) -> AnvilResult<()> {
        self.retry.purge_dead_letter(task_id).await
    }

    /// Distributed locks shared with every handler through [`TaskContext`].
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Start the worker pools and background loops.
    pub async fn start(&self) -> AnvilResult<()> {
        let mut engine = self.engine.lock().await;
        if engine.is_some() {
            return Err(AnvilError::AlreadyRunning);
        }

        let ctx = WorkerContext {
            queue: self.queue.clone(),
            executor: self.executor.clone(),
            retry: self.retry.clone(),
            partitions: Arc::new(self.config.partitions.assigned()),
            idle_wait: Duration::from_millis(self.config.workers.idle_wait_ms),
        };
        *engine = Some(
            Engine::start(
                &self.config,
                ctx,
                Arc::clone(&self.metrics),
                Arc::clone(&self.probe),
            )
            .await,
        );

        tracing::info!("🔨 Anvil started");
        Ok(())
    }

    /// Stop the pools, letting running attempts finish within the shutdown deadline.
    pub async fn stop(&self) -> AnvilResult<()> {
        let engine = self.engine.lock().await.take();
        let Some(engine) = engine else {
            return Err(AnvilError::NotRunning);
        };

        engine.stop().await;
        tracing::info!("🔨 Anvil stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.engine.lock().await.is_some()
    }

    /// Block until Ctrl+C, then stop.
    pub async fn wait_for_shutdown(&self) -> AnvilResult<()> {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("🔨 Failed to listen for Ctrl+C: {}", e);
        } else {
            tracing::info!("🔨 Received Ctrl+C, initiating graceful shutdown...");
        }
        self.stop().await
    }

    /// Health of the running scheduler.
    pub async fn health_check(&self) -> AnvilResult<HealthStatus> {
        let engine = self.engine.lock().await;
        let Some(engine) = engine.as_ref() else {
            return Err(AnvilError::NotRunning);
        };
        self.queue.health_check().await?;
        Ok(engine.health().await)
    }

    pub fn config(&self) -> &AnvilConfig {
        &self.config
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }
}

impl std::fmt::Debug for Anvil {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Anvil")
            .field("queue", &self.queue.kind())
            .field("partitions", &self.config.partitions.count)
            .finish_non_exhaustive()
    }
}

fn validate(config: &AnvilConfig) -> AnvilResult<()> {
    config
        .validate()
        .map_err(|errors| AnvilError::config(errors.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::StaticResourceProbe;
    use crate::task::{TaskPriority, TaskState};
    use serde_json::json;
    use tokio_test::assert_ok;

    async fn anvil() -> Anvil {
        let anvil = Anvil::new(AnvilConfig::testing())
            .await
            .unwrap()
            .with_resource_probe(Arc::new(StaticResourceProbe::new(5.0, 5.0)));
        anvil
            .register_fn("double", |_ctx, args| async move {
                let n = args.first().and_then(|v| v.as_i64()).unwrap_or_default();
                Ok(json!(n * 2))
            })
            .await;
        anvil
    }

    async fn wait_for(anvil: &Anvil, task_id: &TaskId, state: TaskState) -> Task {
        for _ in 0..300 {
            let task = anvil.get_task(task_id).await.unwrap();
            if task.state == state {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached {state}");
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let anvil = anvil().await;
        assert!(!anvil.is_running().await);
        assert!(matches!(anvil.stop().await, Err(AnvilError::NotRunning)));
        assert!(matches!(anvil.health_check().await, Err(AnvilError::NotRunning)));

        assert_ok!(anvil.start().await);
        assert!(anvil.is_running().await);
        assert!(matches!(anvil.start().await, Err(AnvilError::AlreadyRunning)));
        assert_eq!(assert_ok!(anvil.health_check().await), HealthStatus::Healthy);

        assert_ok!(anvil.stop().await);
        assert!(!anvil.is_running().await);
    }

    #[tokio::test]
    async fn test_submit_and_execute() {
        let anvil = anvil().await;
        anvil.start().await.unwrap();

        let receipt = anvil
            .submit(TaskDescriptor::new("double").args(vec![json!(21)]))
            .await
            .unwrap();
        let task = wait_for(&anvil, &receipt.task_id, TaskState::Completed).await;
        assert_eq!(task.result, Some(json!(42)));

        let metrics = anvil.get_metrics().await.unwrap();
        assert_eq!(metrics.totals.submitted, 1);
        assert_eq!(metrics.totals.completed, 1);

        anvil.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_function_is_dead_lettered() {
        let anvil = anvil().await;
        anvil.start().await.unwrap();

        let receipt = anvil.submit(TaskDescriptor::new("missing")).await.unwrap();
        wait_for(&anvil, &receipt.task_id, TaskState::DeadLettered).await;

        let letters = anvil
            .list_dead_letters(&DeadLetterFilter::default())
            .await
            .unwrap();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].reason.contains("not registered"));

        anvil.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_queries_without_engine() {
        let anvil = anvil().await;

        let missing = anvil.get_task(&"nope".to_string()).await;
        assert!(matches!(missing, Err(AnvilError::TaskNotFound { .. })));

        anvil
            .submit(TaskDescriptor::new("double").priority("CRITICAL"))
            .await
            .unwrap();
        let metrics = anvil.get_metrics().await.unwrap();
        assert_eq!(metrics.pending_by_priority[&TaskPriority::Critical], 1);

        let queued = anvil
            .list_tasks(&TaskFilter {
                state: Some(TaskState::Queued),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = AnvilConfig::testing().with_partitions(0);
        assert!(matches!(Anvil::new(config).await, Err(AnvilError::Config { .. })));
    }
}
