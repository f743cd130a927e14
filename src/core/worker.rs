//! Worker pools.
//!
//! There is one [`WorkerPool`] per [`WorkerType`]. Each worker is a tokio
//! task looping over pop, execute, record outcome against its own lane of
//! the queue. Pools are resized by the autoscaler between their bounds.

use crate::config::PoolConfig;
use crate::core::executor::ExecutionEngine;
use crate::core::retry::RetryHandler;
use crate::error::AnvilResult;
use crate::metrics::PoolSnapshot;
use crate::queue::TaskQueue;
use crate::task::{PartitionId, Task, WorkerType};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

/// Everything a worker loop needs, shared by all pools.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: TaskQueue,
    pub executor: ExecutionEngine,
    pub retry: RetryHandler,
    /// Partitions this instance serves
    pub partitions: Arc<Vec<PartitionId>>,
    /// Longest a worker blocks on an empty lane before re-checking its stop flag
    pub idle_wait: Duration,
}

impl WorkerContext {
    /// Run one popped task through a full attempt and record the outcome.
    pub async fn process(&self, task: Task) {
        let task_id = task.id.clone();
        if let Err(e) = self.try_process(task).await {
            tracing::error!("🔨 Failed to record outcome of task {}: {}", task_id, e);
        }
    }

    async fn try_process(&self, mut task: Task) -> AnvilResult<()> {
        // A redelivered task whose final attempt never reported back.
        if !task.has_retry_budget() {
            task.record_failure(format!(
                "Attempt {} did not report an outcome before its visibility timeout",
                task.attempt_count
            ))?;
            let reason = format!(
                "Retry budget exhausted after {} attempts: redelivered after its final attempt",
                task.attempt_count
            );
            return self.retry.dead_letter(task, reason).await;
        }

        task.mark_running()?;
        self.queue.save_task(&task).await?;

        tracing::debug!(
            "🔨 Running task {} ({}) attempt {}",
            task.id,
            task.function_name,
            task.attempt_count
        );
        let report = self.executor.execute(&task).await;
        self.retry.handle(task, report).await?;
        Ok(())
    }
}

struct WorkerHandle {
    id: usize,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PoolState {
    active: Vec<WorkerHandle>,
    /// Told to stop, possibly still finishing an attempt
    retiring: Vec<WorkerHandle>,
}

/// Workers of one worker type.
pub struct WorkerPool {
    worker_type: WorkerType,
    bounds: PoolConfig,
    ctx: WorkerContext,
    state: Mutex<PoolState>,
    current: AtomicUsize,
    busy: Arc<AtomicUsize>,
    next_id: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn new(worker_type: WorkerType, bounds: PoolConfig, ctx: WorkerContext) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            worker_type,
            bounds,
            ctx,
            state: Mutex::new(PoolState::default()),
            current: AtomicUsize::new(0),
            busy: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicUsize::new(0),
            shutdown,
        }
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    pub fn bounds(&self) -> &PoolConfig {
        &self.bounds
    }

    /// Spawn the configured initial workers.
    pub async fn start(&self) -> usize {
        self.resize(self.bounds.startup_size()).await
    }

    /// Grow or shrink the pool to `target`, clamped to the pool bounds.
    ///
    /// Removed workers finish the attempt they are running before exiting.
    /// Returns the new worker count.
    pub async fn resize(&self, target: usize) -> usize {
        let max = self.bounds.max_workers.max(self.bounds.min_workers);
        let target = target.clamp(self.bounds.min_workers, max);

        let mut state = self.state.lock().await;
        state.active.retain(|w| !w.handle.is_finished());
        state.retiring.retain(|w| !w.handle.is_finished());

        while state.active.len() < target {
            let worker = self.spawn_worker();
            state.active.push(worker);
        }
        while state.active.len() > target {
            let Some(worker) = state.active.pop() else {
                break;
            };
            worker.stop.store(true, Ordering::Relaxed);
            tracing::debug!("🔨 {} worker {} retiring", self.worker_type, worker.id);
            state.retiring.push(worker);
        }

        self.current.store(state.active.len(), Ordering::Relaxed);
        state.active.len()
    }

    fn spawn_worker(&self) -> WorkerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_worker(
            id,
            self.worker_type,
            self.ctx.clone(),
            Arc::clone(&stop),
            self.shutdown.subscribe(),
            Arc::clone(&self.busy),
        ));
        WorkerHandle { id, stop, handle }
    }

    /// Number of workers currently assigned to the pool
    pub fn current_workers(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            current_workers: self.current_workers(),
            busy_workers: self.busy_workers(),
            min_workers: self.bounds.min_workers,
            max_workers: self.bounds.max_workers,
        }
    }

    /// Stop every worker and wait up to `grace` for running attempts to end.
    ///
    /// Workers still running at the deadline are aborted together with the
    /// handler they were awaiting; their tasks stay in flight and are
    /// redelivered after the visibility timeout. Returns how many were aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let _ = self.shutdown.send(true);

        let workers: Vec<WorkerHandle> = {
            let mut state = self.state.lock().await;
            let mut workers = std::mem::take(&mut state.active);
            workers.append(&mut state.retiring);
            workers
        };
        self.current.store(0, Ordering::Relaxed);

        let deadline = Instant::now() + grace;
        let mut aborted = 0;
        for worker in workers {
            worker.stop.store(true, Ordering::Relaxed);
            let abort = worker.handle.abort_handle();
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, worker.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("🔨 {} worker {} ended abnormally: {}", self.worker_type, worker.id, e);
                }
                Err(_) => {
                    abort.abort();
                    aborted += 1;
                    tracing::warn!(
                        "🔨 {} worker {} did not stop within {:?}, aborted",
                        self.worker_type,
                        worker.id,
                        grace
                    );
                }
            }
        }

        // Aborted workers never reach their own decrement.
        self.busy.store(0, Ordering::Relaxed);
        tracing::info!("🔨 {} pool stopped ({} aborted)", self.worker_type, aborted);
        aborted
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_type", &self.worker_type)
            .field("bounds", &self.bounds)
            .field("current", &self.current_workers())
            .field("busy", &self.busy_workers())
            .finish()
    }
}

async fn run_worker(
    id: usize,
    worker_type: WorkerType,
    ctx: WorkerContext,
    stop: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
    busy: Arc<AtomicUsize>,
) {
    tracing::debug!("🔨 {} worker {} started", worker_type, id);

    while !stop.load(Ordering::Relaxed) && !*shutdown.borrow() {
        let popped = tokio::select! {
            popped = ctx.queue.pop_blocking(worker_type, &ctx.partitions, ctx.idle_wait) => popped,
            _ = shutdown.changed() => break,
        };

        match popped {
            Ok(Some(task)) => {
                busy.fetch_add(1, Ordering::Relaxed);
                ctx.process(task).await;
                busy.fetch_sub(1, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("🔨 {} worker {} failed to pop: {}", worker_type, id, e);
                sleep(ctx.idle_wait).await;
            }
        }
    }

    tracing::debug!("🔨 {} worker {} stopped", worker_type, id);
}
