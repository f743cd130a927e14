//! Retry scheduling and the dead-letter queue.
//!
//! Every attempt outcome goes through [`RetryHandler::handle`]. Retriable
//! failures with budget left are re-queued at the tail of the same queue
//! after a backoff; everything else that failed becomes a dead letter with
//! the full error history.

use crate::config::RetryPolicy;
use crate::core::executor::ExecutionReport;
use crate::core::router::PartitionRouter;
use crate::error::{AnvilError, AnvilResult};
use crate::metrics::MetricsCollector;
use crate::queue::TaskQueue;
use crate::task::{DeadLetterEntry, DeadLetterFilter, Task, TaskId, TaskState};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Where a task went after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    /// Re-queued after `delay`
    Retrying { delay: Duration },
    DeadLettered,
}

/// Applies attempt outcomes and serves the dead-letter operator API.
#[derive(Clone)]
pub struct RetryHandler {
    queue: TaskQueue,
    policy: RetryPolicy,
    router: PartitionRouter,
    metrics: Arc<MetricsCollector>,
}

impl RetryHandler {
    pub fn new(
        queue: TaskQueue,
        policy: RetryPolicy,
        router: PartitionRouter,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            queue,
            policy,
            router,
            metrics,
        }
    }

    /// Record the outcome of the attempt `task` just made.
    pub async fn handle(&self, mut task: Task, report: ExecutionReport) -> AnvilResult<Disposition> {
        let err = match report.outcome {
            Ok(value) => {
                task.mark_completed(value)?;
                self.queue.save_task(&task).await?;
                self.queue.ack(&task).await?;
                self.metrics.record_completed();
                return Ok(Disposition::Completed);
            }
            Err(err) => err,
        };

        self.metrics.record_failed_attempt();
        task.record_failure(err.to_string())?;

        if !err.is_retriable() {
            self.dead_letter(task, format!("Non-retriable failure: {}", err))
                .await?;
            return Ok(Disposition::DeadLettered);
        }
        if !task.has_retry_budget() {
            let reason = format!(
                "Retry budget exhausted after {} attempts: {}",
                task.attempt_count, err
            );
            self.dead_letter(task, reason).await?;
            return Ok(Disposition::DeadLettered);
        }

        let delay = self.policy.delay_for(task.attempt_count);
        task.transition(TaskState::Retrying)?;
        self.queue
            .push_delayed(&task, SystemTime::now() + delay)
            .await?;
        self.queue.ack(&task).await?;
        self.metrics.record_retried();

        tracing::debug!(
            "🔨 Task {} attempt {}/{} failed, retrying in {:?}",
            task.id,
            task.attempt_count,
            task.max_retries + 1,
            delay
        );
        Ok(Disposition::Retrying { delay })
    }

    /// Move `task` to the dead-letter queue.
    pub async fn dead_letter(&self, mut task: Task, reason: String) -> AnvilResult<()> {
        task.mark_dead_lettered()?;
        let entry = DeadLetterEntry::new(task.clone(), reason);

        self.queue.put_dead_letter(&entry).await?;
        self.queue.save_task(&task).await?;
        self.queue.ack(&task).await?;
        self.metrics.record_dead_lettered();

        tracing::warn!(
            "🔨 Task {} ({}) dead-lettered after {} attempt(s): {}",
            task.id,
            task.function_name,
            task.attempt_count,
            entry.reason
        );
        Ok(())
    }

    pub async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> AnvilResult<Vec<DeadLetterEntry>> {
        self.queue.list_dead_letters(filter).await
    }

    /// Replay a dead letter as a fresh task with a new id and an empty
    /// attempt count.
    pub async fn retry_dead_letter(&self, task_id: &TaskId) -> AnvilResult<Task> {
        let entry = self
            .queue
            .get_dead_letter(task_id)
            .await?
            .ok_or_else(|| AnvilError::DeadLetterNotFound {
                task_id: task_id.clone(),
            })?;

        let original = &entry.task;
        let partition = self.router.route(&original.category, original.worker_type);
        let mut task = Task::new(
            original.function_name.clone(),
            original.worker_type,
            original.category.clone(),
            partition,
        )
        .with_priority(original.priority)
        .with_args(original.args.clone())
        .with_max_retries(original.max_retries)
        .with_timeout(original.timeout);
        task.name = original.name.clone();
        task.replayed_from = Some(original.id.clone());
        task.transition(TaskState::Queued)?;

        // Claim the entry first so a concurrent or repeated replay finds nothing.
        if !self.queue.remove_dead_letter(task_id).await? {
            return Err(AnvilError::DeadLetterNotFound {
                task_id: task_id.clone(),
            });
        }
        if let Err(e) = self.queue.push(&task).await {
            if let Err(restore) = self.queue.put_dead_letter(&entry).await {
                tracing::error!(
                    "🔨 Dead letter {} lost: replay failed ({}) and restoring it failed ({})",
                    task_id,
                    e,
                    restore
                );
            }
            return Err(e);
        }
        self.metrics.record_replayed();

        tracing::warn!(
            "🔨 Manual intervention: dead letter {} replayed as task {}",
            original.id,
            task.id
        );
        Ok(task)
    }

    /// Delete a dead letter for good.
    pub async fn purge_dead_letter(&self, task_id: &TaskId) -> AnvilResult<()> {
        if !self.queue.remove_dead_letter(task_id).await? {
            return Err(AnvilError::DeadLetterNotFound {
                task_id: task_id.clone(),
            });
        }
        tracing::warn!("🔨 Manual intervention: dead letter {} purged", task_id);
        Ok(())
    }
}
