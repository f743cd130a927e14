//! Store doubles for unit tests.

use super::{InMemoryQueue, QueueBackend, QueueKey, RetentionReport};
use crate::config::RetentionPolicy;
use crate::error::{AnvilError, AnvilResult};
use crate::task::{
    DeadLetterEntry, DeadLetterFilter, PartitionId, Task, TaskFilter, TaskId, WorkerType,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

/// In-memory store that turns unreachable on demand.
///
/// Every call fails once `fail_after` calls have been made, and calls to
/// operations named with [`fail`](Self::fail) fail until healed.
pub(crate) struct FlakyStore {
    pub inner: InMemoryQueue,
    pub calls: AtomicUsize,
    fail_after: usize,
    failing: Mutex<HashSet<&'static str>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::failing_after(usize::MAX)
    }

    pub fn failing_after(fail_after: usize) -> Self {
        Self {
            inner: InMemoryQueue::new(),
            calls: AtomicUsize::new(0),
            fail_after,
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn heal(&self, op: &'static str) {
        self.failing.lock().unwrap().remove(op);
    }

    fn check(&self, op: &'static str) -> AnvilResult<()> {
        let exhausted = self.calls.fetch_add(1, Ordering::SeqCst) >= self.fail_after;
        if exhausted || self.failing.lock().unwrap().contains(op) {
            Err(AnvilError::ResourceExhausted {
                message: format!("{op}: connection refused"),
                source: None,
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QueueBackend for FlakyStore {
    fn kind(&self) -> &'static str {
        "flaky"
    }
    async fn push(&self, task: &Task) -> AnvilResult<()> {
        self.check("push")?;
        self.inner.push(task).await
    }
    async fn push_delayed(&self, task: &Task, at: SystemTime) -> AnvilResult<()> {
        self.check("push_delayed")?;
        self.inner.push_delayed(task, at).await
    }
    async fn try_pop(&self, w: WorkerType, p: &[PartitionId]) -> AnvilResult<Option<Task>> {
        self.check("try_pop")?;
        self.inner.try_pop(w, p).await
    }
    async fn ack(&self, task: &Task) -> AnvilResult<()> {
        self.check("ack")?;
        self.inner.ack(task).await
    }
    async fn queue_len(&self, key: QueueKey) -> AnvilResult<usize> {
        self.check("queue_len")?;
        self.inner.queue_len(key).await
    }
    async fn queue_depths(&self, p: &[PartitionId]) -> AnvilResult<HashMap<QueueKey, usize>> {
        self.check("queue_depths")?;
        self.inner.queue_depths(p).await
    }
    async fn save_task(&self, task: &Task) -> AnvilResult<()> {
        self.check("save_task")?;
        self.inner.save_task(task).await
    }
    async fn get_task(&self, id: &TaskId) -> AnvilResult<Option<Task>> {
        self.check("get_task")?;
        self.inner.get_task(id).await
    }
    async fn list_tasks(&self, f: &TaskFilter) -> AnvilResult<Vec<Task>> {
        self.check("list_tasks")?;
        self.inner.list_tasks(f).await
    }
    async fn put_dead_letter(&self, e: &DeadLetterEntry) -> AnvilResult<()> {
        self.check("put_dead_letter")?;
        self.inner.put_dead_letter(e).await
    }
    async fn get_dead_letter(&self, id: &TaskId) -> AnvilResult<Option<DeadLetterEntry>> {
        self.check("get_dead_letter")?;
        self.inner.get_dead_letter(id).await
    }
    async fn list_dead_letters(&self, f: &DeadLetterFilter) -> AnvilResult<Vec<DeadLetterEntry>> {
        self.check("list_dead_letters")?;
        self.inner.list_dead_letters(f).await
    }
    async fn remove_dead_letter(&self, id: &TaskId) -> AnvilResult<bool> {
        self.check("remove_dead_letter")?;
        self.inner.remove_dead_letter(id).await
    }
    async fn try_lock(&self, n: &str, t: &str, ttl: Duration) -> AnvilResult<bool> {
        self.check("try_lock")?;
        self.inner.try_lock(n, t, ttl).await
    }
    async fn unlock(&self, n: &str, t: &str) -> AnvilResult<bool> {
        self.check("unlock")?;
        self.inner.unlock(n, t).await
    }
    async fn enforce_retention(&self, p: &RetentionPolicy) -> AnvilResult<RetentionReport> {
        self.check("enforce_retention")?;
        self.inner.enforce_retention(p).await
    }
    async fn health_check(&self) -> AnvilResult<()> {
        self.check("health_check")
    }
}
