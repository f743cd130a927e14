//! Runs one attempt of a task.
//!
//! The handler runs in its own spawned task so a panic is contained, and
//! under the task's timeout so a hung handler is aborted. The spawned task
//! is owned by a `JoinSet`, so dropping the attempt (a worker aborted at the
//! shutdown deadline) cancels the handler as well.

use crate::core::lock::LockManager;
use crate::core::registry::{FunctionRegistry, TaskContext};
use crate::error::{AnvilError, AnvilResult};
use crate::task::Task;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::timeout;

/// Outcome and wall time of one attempt.
#[derive(Debug)]
pub struct ExecutionReport {
    pub outcome: AnvilResult<Value>,
    pub duration: Duration,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Resolves a task's function and executes it.
#[derive(Clone)]
pub struct ExecutionEngine {
    registry: Arc<FunctionRegistry>,
    locks: LockManager,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<FunctionRegistry>, locks: LockManager) -> Self {
        Self { registry, locks }
    }

    /// Execute the current attempt of `task`.
    ///
    /// Never fails itself: unknown functions, handler errors, panics and
    /// timeouts all end up in [`ExecutionReport::outcome`].
    pub async fn execute(&self, task: &Task) -> ExecutionReport {
        let start = Instant::now();
        let outcome = self.run(task).await;
        let duration = start.elapsed();

        self.registry
            .record(&task.function_name, &outcome, duration)
            .await;

        match &outcome {
            Ok(_) => tracing::debug!("🔨 Task {} completed in {:?}", task.id, duration),
            Err(e) => tracing::debug!("🔨 Task {} failed after {:?}: {}", task.id, duration, e),
        }

        ExecutionReport { outcome, duration }
    }

    async fn run(&self, task: &Task) -> AnvilResult<Value> {
        let handler = self.registry.resolve(&task.function_name).await?;
        let ctx = TaskContext::new(
            task.id.clone(),
            task.function_name.clone(),
            task.category.clone(),
            task.attempt_count,
            self.locks.clone(),
        );
        let args = task.args.clone();

        let mut attempt = JoinSet::new();
        attempt.spawn(async move { handler.call(ctx, args).await });

        match timeout(task.timeout, attempt.join_next()).await {
            Ok(Some(Ok(result))) => result,
            Ok(Some(Err(join_error))) if join_error.is_panic() => {
                tracing::error!("🔨 Task {} panicked", task.id);
                Err(AnvilError::transient(format!(
                    "Handler panicked: {}",
                    panic_message(join_error.into_panic())
                )))
            }
            Ok(Some(Err(join_error))) => Err(AnvilError::transient(format!(
                "Handler was cancelled: {}",
                join_error
            ))),
            Ok(None) => Err(AnvilError::transient("Handler was never started")),
            Err(_) => {
                attempt.abort_all();
                tracing::warn!("🔨 Task {} timed out after {:?}", task.id, task.timeout);
                Err(AnvilError::Timeout {
                    timeout_ms: task.timeout.as_millis() as u64,
                })
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
