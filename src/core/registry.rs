//! Function registry for anvilq.
//!
//! Tasks name the function that runs them; the registry maps those names to
//! handlers. Every [`Anvil`](crate::core::Anvil) owns its own registry and
//! registration is explicit.
//!
//! # Examples
//!
//! ```rust,no_run
//! use anvilq::prelude::*;
//! use serde_json::{Value, json};
//!
//! # async fn example() -> AnvilResult<()> {
//! let registry = FunctionRegistry::new();
//! registry
//!     .register_fn("add", |_ctx: TaskContext, args: Vec<Value>| async move {
//!         let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
//!         Ok(json!(sum))
//!     })
//!     .await;
//! assert!(registry.is_registered("add").await);
//! # Ok(())
//! # }
//! ```

use crate::core::lock::LockManager;
use crate::error::{AnvilError, AnvilResult};
use crate::task::TaskId;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// What a handler knows about the attempt it is running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub function_name: String,
    pub category: String,
    /// 1-based attempt number
    pub attempt: u32,
    locks: LockManager,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        function_name: impl Into<String>,
        category: impl Into<String>,
        attempt: u32,
        locks: LockManager,
    ) -> Self {
        Self {
            task_id,
            function_name: function_name.into(),
            category: category.into(),
            attempt,
            locks,
        }
    }

    /// Locks shared with every other process on the same store
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }
}

/// An executable unit registered under a function name.
///
/// Return [`AnvilError::transient`] for failures worth retrying and
/// [`AnvilError::permanent`] for those that are not.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, ctx: TaskContext, args: Vec<Value>) -> AnvilResult<Value>;
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = AnvilResult<Value>> + Send,
{
    async fn call(&self, ctx: TaskContext, args: Vec<Value>) -> AnvilResult<Value> {
        (self.0)(ctx, args).await
    }
}

/// Execution statistics for one function.
#[derive(Debug, Clone, Default)]
pub struct FunctionStats {
    /// Total number of attempts executed
    pub total_executed: u64,
    pub successful: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Exponential moving average of attempt duration
    pub avg_duration: Option<Duration>,
    pub last_executed: Option<SystemTime>,
}

/// Maps function names to handlers.
#[derive(Default)]
pub struct FunctionRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    stats: RwLock<HashMap<String, FunctionStats>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry").finish_non_exhaustive()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub async fn register<H>(&self, name: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        let name = name.into();
        let previous = self
            .handlers
            .write()
            .await
            .insert(name.clone(), Arc::new(handler));

        if previous.is_some() {
            tracing::warn!("Replaced handler for function '{}'", name);
        } else {
            tracing::info!("Registered function '{}'", name);
        }
        self.stats.write().await.entry(name).or_default();
    }

    /// Register an async closure under `name`.
    pub async fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(TaskContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AnvilResult<Value>> + Send + 'static,
    {
        self.register(name, FnHandler::new(f)).await;
    }

    /// Handler for `name`, or [`AnvilError::UnknownFunction`].
    pub async fn resolve(&self, name: &str) -> AnvilResult<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| AnvilError::UnknownFunction {
                function_name: name.to_string(),
            })
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.handlers.read().await.contains_key(name)
    }

    /// Registered function names, sorted.
    pub async fn registered_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn stats(&self, name: &str) -> Option<FunctionStats> {
        self.stats.read().await.get(name).cloned()
    }

    pub async fn all_stats(&self) -> HashMap<String, FunctionStats> {
        self.stats.read().await.clone()
    }

    /// Fold one attempt into the function's statistics.
    pub async fn record(&self, name: &str, outcome: &AnvilResult<Value>, duration: Duration) {
        let mut stats = self.stats.write().await;
        let entry = stats.entry(name.to_string()).or_default();

        entry.total_executed += 1;
        entry.last_executed = Some(SystemTime::now());
        match outcome {
            Ok(_) => entry.successful += 1,
            Err(AnvilError::Timeout { .. }) => entry.timed_out += 1,
            Err(_) => entry.failed += 1,
        }

        entry.avg_duration = Some(match entry.avg_duration {
            Some(avg) => {
                let alpha = 0.1;
                let nanos =
                    alpha * duration.as_nanos() as f64 + (1.0 - alpha) * avg.as_nanos() as f64;
                Duration::from_nanos(nanos as u64)
            }
            None => duration,
        });
    }
}
