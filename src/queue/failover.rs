//! Memory-mode fallback for a distributed queue store.
//!
//! [`FailoverQueue`] forwards to its primary until an operation fails because
//! the store is unreachable. From then on it logs a degradation event and
//! serves every call from a process-local [`InMemoryQueue`] for the rest of
//! the process lifetime. Tasks already held by the unreachable store stay
//! there until an operator recovers them.

use super::{InMemoryQueue, QueueBackend, QueueKey, RetentionReport, TaskQueue};
use crate::config::{QueueConfig, RetentionPolicy};
use crate::error::{AnvilError, AnvilResult};
use crate::task::{
    DeadLetterEntry, DeadLetterFilter, PartitionId, Task, TaskFilter, TaskId, WorkerType,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

/// Run `$call` against the primary, or against the fallback once degraded.
macro_rules! failover {
    ($self:ident, $op:literal, $queue:ident => $call:expr) => {{
        if let Some(primary) = $self.primary.as_ref().filter(|_| !$self.is_degraded()) {
            let $queue: &dyn QueueBackend = primary.as_ref();
            match $call {
                Err(err) if err.is_unreachable() => $self.degrade($op, &err),
                other => return other,
            }
        }
        let $queue: &dyn QueueBackend = &$self.fallback;
        $call
    }};
}

/// Queue that degrades to memory mode when its primary store is unreachable
pub struct FailoverQueue {
    /// None when the store was unreachable before the first call
    primary: Option<TaskQueue>,
    fallback: InMemoryQueue,
    degraded: AtomicBool,
}

impl FailoverQueue {
    /// Wrap a distributed backend.
    pub fn new(primary: TaskQueue, config: QueueConfig) -> Self {
        Self {
            primary: Some(primary),
            fallback: InMemoryQueue::with_config(config),
            degraded: AtomicBool::new(false),
        }
    }

    /// A queue that starts out in memory mode.
    pub fn degraded(config: QueueConfig) -> Self {
        Self {
            primary: None,
            fallback: InMemoryQueue::with_config(config),
            degraded: AtomicBool::new(true),
        }
    }

    /// Whether calls are being served from memory mode
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn degrade(&self, op: &str, err: &AnvilError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                "🔨 Queue store '{}' unreachable during {} ({}); degrading to memory mode, \
                 tasks are no longer shared across processes",
                self.primary.as_ref().map_or("none", |p| p.kind()),
                op,
                err
            );
        }
    }
}

#[async_trait]
impl QueueBackend for FailoverQueue {
    fn kind(&self) -> &'static str {
        match &self.primary {
            Some(primary) if !self.is_degraded() => primary.kind(),
            _ => "memory-fallback",
        }
    }

    async fn push(&self, task: &Task) -> AnvilResult<()> {
        failover!(self, "push", q => q.push(task).await)
    }

    async fn push_delayed(&self, task: &Task, ready_at: SystemTime) -> AnvilResult<()> {
        failover!(self, "push_delayed", q => q.push_delayed(task, ready_at).await)
    }

    async fn try_pop(
        &self,
        worker_type: WorkerType,
        partitions: &[PartitionId],
    ) -> AnvilResult<Option<Task>> {
        failover!(self, "try_pop", q => q.try_pop(worker_type, partitions).await)
    }

    async fn pop_blocking(
        &self,
        worker_type: WorkerType,
        partitions: &[PartitionId],
        wait: Duration,
    ) -> AnvilResult<Option<Task>> {
        failover!(self, "pop_blocking", q => q.pop_blocking(worker_type, partitions, wait).await)
    }

    async fn ack(&self, task: &Task) -> AnvilResult<()> {
        failover!(self, "ack", q => q.ack(task).await)
    }

    async fn queue_len(&self, key: QueueKey) -> AnvilResult<usize> {
        failover!(self, "queue_len", q => q.queue_len(key).await)
    }

    async fn queue_depths(
        &self,
        partitions: &[PartitionId],
    ) -> AnvilResult<HashMap<QueueKey, usize>> {
        failover!(self, "queue_depths", q => q.queue_depths(partitions).await)
    }

    async fn save_task(&self, task: &Task) -> AnvilResult<()> {
        failover!(self, "save_task", q => q.save_task(task).await)
    }

    async fn get_task(&self, task_id: &TaskId) -> AnvilResult<Option<Task>> {
        failover!(self, "get_task", q => q.get_task(task_id).await)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> AnvilResult<Vec<Task>> {
        failover!(self, "list_tasks", q => q.list_tasks(filter).await)
    }

    async fn put_dead_letter(&self, entry: &DeadLetterEntry) -> AnvilResult<()> {
        failover!(self, "put_dead_letter", q => q.put_dead_letter(entry).await)
    }

    async fn get_dead_letter(&self, task_id: &TaskId) -> AnvilResult<Option<DeadLetterEntry>> {
        failover!(self, "get_dead_letter", q => q.get_dead_letter(task_id).await)
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> AnvilResult<Vec<DeadLetterEntry>> {
        failover!(self, "list_dead_letters", q => q.list_dead_letters(filter).await)
    }

    async fn remove_dead_letter(&self, task_id: &TaskId) -> AnvilResult<bool> {
        failover!(self, "remove_dead_letter", q => q.remove_dead_letter(task_id).await)
    }

    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> AnvilResult<bool> {
        failover!(self, "try_lock", q => q.try_lock(name, token, ttl).await)
    }

    async fn unlock(&self, name: &str, token: &str) -> AnvilResult<bool> {
        failover!(self, "unlock", q => q.unlock(name, token).await)
    }

    async fn enforce_retention(&self, policy: &RetentionPolicy) -> AnvilResult<RetentionReport> {
        failover!(self, "enforce_retention", q => q.enforce_retention(policy).await)
    }

    async fn health_check(&self) -> AnvilResult<()> {
        failover!(self, "health_check", q => q.health_check().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::testing::FlakyStore;
    use crate::task::{TaskPriority, TaskState};
    use std::sync::Arc;

    fn queued_task() -> Task {
        let mut task = Task::new("job", WorkerType::GeneralPurpose, "tests", 0)
            .with_priority(TaskPriority::High);
        task.state = TaskState::Queued;
        task
    }

    #[tokio::test]
    async fn test_forwards_while_primary_is_healthy() {
        let primary = Arc::new(FlakyStore::new());
        let queue = FailoverQueue::new(primary.clone(), QueueConfig::default());

        let task = queued_task();
        queue.push(&task).await.unwrap();
        assert!(!queue.is_degraded());
        assert_eq!(queue.kind(), "flaky");
        assert!(primary.inner.get_task(&task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_degrades_and_stays_degraded() {
        let primary = Arc::new(FlakyStore::failing_after(1));
        let queue = FailoverQueue::new(primary.clone(), QueueConfig::default());

        queue.push(&queued_task()).await.unwrap();
        assert!(!queue.is_degraded());

        let task = queued_task();
        queue.push(&task).await.unwrap();
        assert!(queue.is_degraded());
        assert_eq!(queue.kind(), "memory-fallback");

        let popped = queue
            .try_pop(WorkerType::GeneralPurpose, &[0])
            .await
            .unwrap();
        assert_eq!(popped.unwrap().id, task.id);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_starts_degraded() {
        let queue = FailoverQueue::degraded(QueueConfig::default());
        assert!(queue.is_degraded());
        assert!(queue.health_check().await.is_ok());
    }
}
