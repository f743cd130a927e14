//! Queue store backends for anvilq.
//!
//! Every backend exposes the same partitioned layout: one FIFO queue per
//! `(worker type, partition, priority)`, plus the task records, dead letters
//! and lock keys that live next to them.
//!
//! - **In-Memory**: process-local, used for development, tests and degraded mode
//! - **Redis**: distributed across one or more nodes (feature `redis-queue`)
//! - **Failover**: wraps a distributed backend and degrades to memory mode
//!
//! # Examples
//!
//! ```rust,no_run
//! use anvilq::prelude::*;
//!
//! # async fn example() -> AnvilResult<()> {
//! let queue = QueueFactory::from_config(&QueueConfig::in_memory()).await?;
//! queue.health_check().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{QueueBackendConfig, QueueConfig, RetentionPolicy};
use crate::error::AnvilResult;
use crate::task::{
    DeadLetterEntry, DeadLetterFilter, PartitionId, Task, TaskFilter, TaskId, TaskPriority,
    WorkerType,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

pub mod failover;
pub mod memory;
#[cfg(test)]
pub(crate) mod testing;

pub use failover::FailoverQueue;
pub use memory::InMemoryQueue;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub mod redis;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub use redis::RedisQueue;

/// Address of one FIFO queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub worker_type: WorkerType,
    pub partition: PartitionId,
    pub priority: TaskPriority,
}

impl QueueKey {
    pub fn new(worker_type: WorkerType, partition: PartitionId, priority: TaskPriority) -> Self {
        Self {
            worker_type,
            partition,
            priority,
        }
    }

    /// The queue a task belongs to.
    pub fn of(task: &Task) -> Self {
        Self::new(task.worker_type, task.partition, task.priority)
    }

    /// Keys of one lane in dequeue order: priority-major, then partition.
    pub fn scan_order(
        worker_type: WorkerType,
        partitions: &[PartitionId],
    ) -> impl Iterator<Item = QueueKey> + '_ {
        TaskPriority::ALL_DESCENDING.into_iter().flat_map(move |priority| {
            partitions
                .iter()
                .map(move |partition| QueueKey::new(worker_type, *partition, priority))
        })
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.worker_type, self.partition, self.priority)
    }
}

/// What a retention sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub tasks_evicted: usize,
    pub dead_letters_evicted: usize,
}

/// Ids of finished tasks the policy evicts: the oldest beyond the count
/// bound, plus any older than the age bound.
pub(crate) fn expired_tasks<'a>(
    tasks: impl Iterator<Item = &'a Task>,
    policy: &RetentionPolicy,
    now: SystemTime,
) -> Vec<TaskId> {
    let mut finished: Vec<(SystemTime, &TaskId)> = tasks
        .filter(|t| t.state.is_terminal())
        .map(|t| (t.completed_at.unwrap_or(t.updated_at), &t.id))
        .collect();
    finished.sort();

    let max_age = Duration::from_secs(policy.completed_max_age_secs);
    let over_count = finished.len().saturating_sub(policy.completed_max_count);
    finished
        .into_iter()
        .enumerate()
        .filter(|(index, (finished_at, _))| {
            *index < over_count || now.duration_since(*finished_at).unwrap_or_default() > max_age
        })
        .map(|(_, (_, id))| id.clone())
        .collect()
}

/// Ids of dead letters the policy evicts.
pub(crate) fn expired_dead_letters<'a>(
    entries: impl Iterator<Item = &'a DeadLetterEntry>,
    policy: &RetentionPolicy,
    now: SystemTime,
) -> Vec<TaskId> {
    let mut letters: Vec<(SystemTime, &TaskId)> = entries
        .map(|e| (e.dead_lettered_at, e.task_id()))
        .collect();
    letters.sort();

    let over_count = policy
        .dead_letter_max_count
        .map_or(0, |max| letters.len().saturating_sub(max));
    letters
        .into_iter()
        .enumerate()
        .filter(|(index, (dead_at, _))| {
            let expired = policy.dead_letter_max_age_secs.is_some_and(|secs| {
                now.duration_since(*dead_at).unwrap_or_default() > Duration::from_secs(secs)
            });
            *index < over_count || expired
        })
        .map(|(_, (_, id))| id.clone())
        .collect()
}

/// Trait that all queue backends must implement
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Short backend name for logs and health output
    fn kind(&self) -> &'static str;

    /// Store the task record and append it to the tail of its queue
    async fn push(&self, task: &Task) -> AnvilResult<()>;

    /// Store the task record and append it to its queue once `ready_at` passes
    async fn push_delayed(&self, task: &Task, ready_at: SystemTime) -> AnvilResult<()>;

    /// Pop the next task of a lane without waiting.
    ///
    /// Scans priorities from highest to lowest and, within a priority, the
    /// given partitions in order. The first non-empty queue wins. The task
    /// stays in flight until [`ack`](Self::ack); if not acked within the
    /// visibility timeout it is appended to its queue again.
    async fn try_pop(
        &self,
        worker_type: WorkerType,
        partitions: &[PartitionId],
    ) -> AnvilResult<Option<Task>>;

    /// Pop with a bounded wait
    async fn pop_blocking(
        &self,
        worker_type: WorkerType,
        partitions: &[PartitionId],
        wait: Duration,
    ) -> AnvilResult<Option<Task>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(task) = self.try_pop(worker_type, partitions).await? {
                return Ok(Some(task));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval().min(deadline - now)).await;
        }
    }

    /// Poll interval used by the default `pop_blocking`
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(50)
    }

    /// Clear the in-flight record of a popped task
    async fn ack(&self, task: &Task) -> AnvilResult<()>;

    /// Number of tasks waiting in one queue
    async fn queue_len(&self, key: QueueKey) -> AnvilResult<usize>;

    /// Depth of every queue on the given partitions, across all lanes
    async fn queue_depths(
        &self,
        partitions: &[PartitionId],
    ) -> AnvilResult<HashMap<QueueKey, usize>>;

    /// Insert or replace a task record
    async fn save_task(&self, task: &Task) -> AnvilResult<()>;

    /// Get a task by ID
    async fn get_task(&self, task_id: &TaskId) -> AnvilResult<Option<Task>>;

    /// Task records matching `filter`, oldest first
    async fn list_tasks(&self, filter: &TaskFilter) -> AnvilResult<Vec<Task>>;

    async fn put_dead_letter(&self, entry: &DeadLetterEntry) -> AnvilResult<()>;

    async fn get_dead_letter(&self, task_id: &TaskId) -> AnvilResult<Option<DeadLetterEntry>>;

    /// Dead letters matching `filter`, oldest first
    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> AnvilResult<Vec<DeadLetterEntry>>;

    /// Delete a dead letter; false if it did not exist
    async fn remove_dead_letter(&self, task_id: &TaskId) -> AnvilResult<bool>;

    /// Set `name` to `token` unless held, expiring after `ttl`
    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> AnvilResult<bool>;

    /// Delete `name` only if it still holds `token`
    async fn unlock(&self, name: &str, token: &str) -> AnvilResult<bool>;

    /// Evict finished tasks and dead letters beyond the policy bounds
    async fn enforce_retention(&self, policy: &RetentionPolicy) -> AnvilResult<RetentionReport>;

    /// Health check for the queue backend
    async fn health_check(&self) -> AnvilResult<()>;
}

/// Convenient type alias for a shared queue backend
pub type TaskQueue = Arc<dyn QueueBackend>;

/// Factory methods for creating queue backends
pub struct QueueFactory;

impl QueueFactory {
    /// Create an in-memory queue
    pub fn in_memory(config: QueueConfig) -> TaskQueue {
        Arc::new(InMemoryQueue::with_config(config))
    }

    /// Build the backend described by `config`.
    ///
    /// With `allow_memory_fallback` set, a distributed backend is wrapped in
    /// a [`FailoverQueue`], and an unreachable store at startup yields a
    /// queue that is already degraded instead of an error.
    pub async fn from_config(config: &QueueConfig) -> AnvilResult<TaskQueue> {
        match &config.backend {
            QueueBackendConfig::InMemory => Ok(Self::in_memory(config.clone())),
            #[cfg(feature = "redis-queue")]
            QueueBackendConfig::Redis(redis_config) => {
                match RedisQueue::connect(redis_config.clone(), config.clone()).await {
                    Ok(queue) if config.allow_memory_fallback => {
                        Ok(Arc::new(FailoverQueue::new(Arc::new(queue), config.clone())))
                    }
                    Ok(queue) => Ok(Arc::new(queue)),
                    Err(err) if config.allow_memory_fallback && err.is_unreachable() => {
                        tracing::warn!(
                            "🔨 Queue store unreachable at startup ({}), running in memory mode",
                            err
                        );
                        Ok(Arc::new(FailoverQueue::degraded(config.clone())))
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_order_is_priority_major() {
        let keys: Vec<QueueKey> = QueueKey::scan_order(WorkerType::IoIntensive, &[2, 5]).collect();
        assert_eq!(keys.len(), 16);
        assert_eq!(keys[0], QueueKey::new(WorkerType::IoIntensive, 2, TaskPriority::Emergency));
        assert_eq!(keys[1], QueueKey::new(WorkerType::IoIntensive, 5, TaskPriority::Emergency));
        assert_eq!(keys[2].priority, TaskPriority::Critical);
        assert_eq!(keys[15].priority, TaskPriority::Maintenance);
    }

    #[test]
    fn test_queue_key_display() {
        let key = QueueKey::new(WorkerType::CpuIntensive, 3, TaskPriority::High);
        assert_eq!(key.to_string(), "CPU_INTENSIVE:3:HIGH");
    }

    #[tokio::test]
    async fn test_queue_factory() {
        let queue = QueueFactory::from_config(&QueueConfig::in_memory())
            .await
            .unwrap();
        assert_eq!(queue.kind(), "memory");
        assert!(queue.health_check().await.is_ok());
    }
}
