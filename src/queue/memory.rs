//! In-memory queue implementation for anvilq.
//!
//! Keeps one `VecDeque` per queue key inside a single process. It implements
//! the full backend contract (delayed retries, visibility timeouts, dead
//! letters, locks, retention) but nothing is shared across processes, so it is
//! meant for development, tests and degraded operation.

use super::{
    QueueBackend, QueueConfig, QueueKey, RetentionReport, expired_dead_letters, expired_tasks,
};
use crate::config::RetentionPolicy;
use crate::error::AnvilResult;
use crate::task::{
    DeadLetterEntry, DeadLetterFilter, PartitionId, Task, TaskFilter, TaskId, TaskState,
    WorkerType,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Notify, RwLock};

#[derive(Debug, Default)]
struct MemoryState {
    /// FIFO of task ids per queue
    queues: HashMap<QueueKey, VecDeque<TaskId>>,
    /// Task records indexed by task ID
    tasks: HashMap<TaskId, Task>,
    /// Retries waiting for their backoff, ordered by due time then arrival
    delayed: BTreeMap<(SystemTime, u64), (QueueKey, TaskId)>,
    delayed_seq: u64,
    /// Popped tasks and when they become visible again
    in_flight: HashMap<TaskId, (QueueKey, Instant)>,
    dead_letters: HashMap<TaskId, DeadLetterEntry>,
    /// Lock name -> (token, expiry)
    locks: HashMap<String, (String, Instant)>,
}

impl MemoryState {
    fn enqueue(&mut self, key: QueueKey, task_id: TaskId) {
        self.queues.entry(key).or_default().push_back(task_id);
    }

    /// Move due retries to the tail of their queues.
    fn promote_delayed(&mut self, now: SystemTime) -> usize {
        let still_waiting = self.delayed.split_off(&(now, u64::MAX));
        let due = std::mem::replace(&mut self.delayed, still_waiting);
        let moved = due.len();
        for (_, (key, task_id)) in due {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                if task.transition(TaskState::Queued).is_err() {
                    continue;
                }
            }
            self.enqueue(key, task_id);
        }
        moved
    }

    /// Requeue popped tasks whose visibility timeout expired.
    fn process_visibility_timeouts(&mut self, now: Instant) -> usize {
        let expired: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, (_, visible_at))| now >= *visible_at)
            .map(|(id, _)| id.clone())
            .collect();

        for task_id in &expired {
            if let Some((key, _)) = self.in_flight.remove(task_id) {
                let live = self
                    .tasks
                    .get(task_id)
                    .is_some_and(|t| !t.state.is_terminal());
                if live {
                    tracing::warn!("Task {} visibility timeout expired, redelivering", task_id);
                    self.enqueue(key, task_id.clone());
                }
            }
        }
        expired.len()
    }
}

/// In-memory queue backend implementation
#[derive(Debug)]
pub struct InMemoryQueue {
    state: RwLock<MemoryState>,
    /// Wakes blocked poppers on push
    notify: Notify,
    /// Queue configuration
    config: QueueConfig,
}

impl InMemoryQueue {
    /// Create a new in-memory queue with default configuration
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Create a new in-memory queue with custom configuration
    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            notify: Notify::new(),
            config,
        }
    }

    fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.config.visibility_timeout_secs)
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn take_limit<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        items.truncate(limit);
    }
    items
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    async fn push(&self, task: &Task) -> AnvilResult<()> {
        {
            let mut state = self.state.write().await;
            state.tasks.insert(task.id.clone(), task.clone());
            state.enqueue(QueueKey::of(task), task.id.clone());
        }
        self.notify.notify_waiters();

        tracing::debug!("Enqueued task {} on {}", task.id, QueueKey::of(task));
        Ok(())
    }

    async fn push_delayed(&self, task: &Task, ready_at: SystemTime) -> AnvilResult<()> {
        let mut state = self.state.write().await;
        state.tasks.insert(task.id.clone(), task.clone());
        state.delayed_seq += 1;
        let seq = state.delayed_seq;
        state
            .delayed
            .insert((ready_at, seq), (QueueKey::of(task), task.id.clone()));

        tracing::debug!("Delayed task {} on {}", task.id, QueueKey::of(task));
        Ok(())
    }

    async fn try_pop(
        &self,
        worker_type: WorkerType,
        partitions: &[PartitionId],
    ) -> AnvilResult<Option<Task>> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        state.promote_delayed(SystemTime::now());
        state.process_visibility_timeouts(now);

        for key in QueueKey::scan_order(worker_type, partitions) {
            loop {
                let Some(task_id) = state.queues.get_mut(&key).and_then(VecDeque::pop_front)
                else {
                    break;
                };
                // Records evicted or finished while queued are skipped.
                let Some(task) = state.tasks.get(&task_id).filter(|t| !t.state.is_terminal())
                else {
                    continue;
                };
                let task = task.clone();
                state
                    .in_flight
                    .insert(task_id.clone(), (key, now + self.visibility_timeout()));

                tracing::debug!("Dequeued task {} from {}", task_id, key);
                return Ok(Some(task));
            }
        }

        Ok(None)
    }

    async fn pop_blocking(
        &self,
        worker_type: WorkerType,
        partitions: &[PartitionId],
        wait: Duration,
    ) -> AnvilResult<Option<Task>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_pop(worker_type, partitions).await? {
                return Ok(Some(task));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Delayed retries become due without a push, so never sleep past the poll interval.
            let nap = (deadline - now).min(self.poll_interval());
            let _ = tokio::time::timeout(nap, notified).await;
        }
    }

    async fn ack(&self, task: &Task) -> AnvilResult<()> {
        let mut state = self.state.write().await;
        state.in_flight.remove(&task.id);
        Ok(())
    }

    async fn queue_len(&self, key: QueueKey) -> AnvilResult<usize> {
        let state = self.state.read().await;
        Ok(state.queues.get(&key).map_or(0, VecDeque::len))
    }

    async fn queue_depths(
        &self,
        partitions: &[PartitionId],
    ) -> AnvilResult<HashMap<QueueKey, usize>> {
        let state = self.state.read().await;
        Ok(state
            .queues
            .iter()
            .filter(|(key, queue)| partitions.contains(&key.partition) && !queue.is_empty())
            .map(|(key, queue)| (*key, queue.len()))
            .collect())
    }

    async fn save_task(&self, task: &Task) -> AnvilResult<()> {
        let mut state = self.state.write().await;
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> AnvilResult<Option<Task>> {
        let state = self.state.read().await;
        Ok(state.tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> AnvilResult<Vec<Task>> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(take_limit(tasks, filter.limit))
    }

    async fn put_dead_letter(&self, entry: &DeadLetterEntry) -> AnvilResult<()> {
        let mut state = self.state.write().await;
        state
            .dead_letters
            .insert(entry.task_id().clone(), entry.clone());
        Ok(())
    }

    async fn get_dead_letter(&self, task_id: &TaskId) -> AnvilResult<Option<DeadLetterEntry>> {
        let state = self.state.read().await;
        Ok(state.dead_letters.get(task_id).cloned())
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> AnvilResult<Vec<DeadLetterEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<DeadLetterEntry> = state
            .dead_letters
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.dead_lettered_at);
        Ok(take_limit(entries, filter.limit))
    }

    async fn remove_dead_letter(&self, task_id: &TaskId) -> AnvilResult<bool> {
        let mut state = self.state.write().await;
        Ok(state.dead_letters.remove(task_id).is_some())
    }

    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> AnvilResult<bool> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        if let Some((_, expires_at)) = state.locks.get(name) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        state
            .locks
            .insert(name.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn unlock(&self, name: &str, token: &str) -> AnvilResult<bool> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        match state.locks.get(name) {
            Some((held, expires_at)) if held == token => {
                let live = *expires_at > now;
                state.locks.remove(name);
                Ok(live)
            }
            _ => Ok(false),
        }
    }

    async fn enforce_retention(&self, policy: &RetentionPolicy) -> AnvilResult<RetentionReport> {
        let now = SystemTime::now();
        let mut state = self.state.write().await;

        let tasks = expired_tasks(state.tasks.values(), policy, now);
        let letters = expired_dead_letters(state.dead_letters.values(), policy, now);
        for task_id in &tasks {
            state.tasks.remove(task_id);
        }
        for task_id in &letters {
            state.dead_letters.remove(task_id);
        }

        Ok(RetentionReport {
            tasks_evicted: tasks.len(),
            dead_letters_evicted: letters.len(),
        })
    }

    async fn health_check(&self) -> AnvilResult<()> {
        Ok(())
    }
}
