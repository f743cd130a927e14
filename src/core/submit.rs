//! Submission path: validation, rate limiting, routing, enqueue.

use crate::config::{CategoryRateLimit, RateLimitConfig, RateLimitMode, TaskDefaults};
use crate::core::router::PartitionRouter;
use crate::error::{AnvilError, AnvilResult};
use crate::metrics::MetricsCollector;
use crate::queue::TaskQueue;
use crate::task::{PartitionId, Task, TaskDescriptor, TaskId, TaskPriority, TaskState, WorkerType};
use futures::future::join_all;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{DefaultKeyedRateLimiter, NotUntil, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

type CategoryLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;
type DefaultLimiter = DefaultKeyedRateLimiter<String>;

/// Admissions through the default limit between sweeps of idle categories
const RETAIN_EVERY: u64 = 1024;

/// Returned for every accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    pub partition: PartitionId,
    pub state: TaskState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Submit one after another in input order
    #[default]
    Sequential,
    /// Submit all descriptors at once
    Concurrent,
}

/// A rejected descriptor of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchError {
    /// Position in the submitted batch
    pub index: usize,
    pub error: String,
}

/// Outcome of a batch submission. Never fails as a whole.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub total_submitted: usize,
    pub total_errors: usize,
    /// Sorted by index
    pub errors: Vec<BatchError>,
    /// One slot per descriptor, `None` where it was rejected
    pub results: Vec<Option<SubmitReceipt>>,
}

/// Token buckets per category.
///
/// Configured categories get their own bucket. Every other category shares
/// the default quota through one keyed limiter, whose fully replenished keys
/// are dropped periodically so free-form categories do not pile up.
struct CategoryLimits {
    configured: HashMap<String, (CategoryRateLimit, CategoryLimiter)>,
    fallback: Option<(CategoryRateLimit, DefaultLimiter)>,
    admissions: AtomicU64,
}

fn quota(limit: &CategoryRateLimit) -> Quota {
    let per_second = NonZeroU32::new(limit.per_second.max(1)).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(limit.burst.max(1)).unwrap_or(NonZeroU32::MIN);
    Quota::per_second(per_second).allow_burst(burst)
}

fn rate_limited(category: &str, not_until: NotUntil<<DefaultClock as Clock>::Instant>) -> AnvilError {
    let wait = not_until.wait_time_from(DefaultClock::default().now());
    AnvilError::RateLimited {
        category: category.to_string(),
        retry_after_ms: wait.as_millis() as u64,
    }
}

async fn wait_for_token(
    category: &str,
    limit: &CategoryRateLimit,
    ready: impl Future<Output = ()>,
) -> AnvilResult<()> {
    tokio::time::timeout(Duration::from_millis(limit.max_delay_ms), ready)
        .await
        .map_err(|_| AnvilError::RateLimited {
            category: category.to_string(),
            retry_after_ms: limit.max_delay_ms,
        })
}

impl CategoryLimits {
    fn new(config: RateLimitConfig) -> Self {
        let configured: HashMap<_, _> = config
            .categories
            .into_iter()
            .map(|(category, limit)| {
                let limiter = RateLimiter::direct(quota(&limit));
                (category, (limit, limiter))
            })
            .collect();
        let fallback = config.default_limit.map(|limit| {
            let limiter = RateLimiter::keyed(quota(&limit));
            (limit, limiter)
        });

        Self {
            configured,
            fallback,
            admissions: AtomicU64::new(0),
        }
    }

    /// Admit one submission for `category`, waiting if its mode allows it.
    async fn admit(&self, category: &str) -> AnvilResult<()> {
        if let Some((limit, limiter)) = self.configured.get(category) {
            return match limit.mode {
                RateLimitMode::Reject => limiter.check().map_err(|n| rate_limited(category, n)),
                RateLimitMode::Delay => wait_for_token(category, limit, limiter.until_ready()).await,
            };
        }

        let Some((limit, limiter)) = &self.fallback else {
            return Ok(());
        };
        if self.admissions.fetch_add(1, Ordering::Relaxed) % RETAIN_EVERY == RETAIN_EVERY - 1 {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }

        let key = category.to_string();
        match limit.mode {
            RateLimitMode::Reject => limiter.check_key(&key).map_err(|n| rate_limited(category, n)),
            RateLimitMode::Delay => {
                wait_for_token(category, limit, limiter.until_key_ready(&key)).await
            }
        }
    }

    /// Categories currently holding state in the default limiter
    #[cfg(test)]
    fn tracked_defaults(&self) -> usize {
        self.fallback.as_ref().map_or(0, |(_, limiter)| limiter.len())
    }
}

/// Turns descriptors into queued tasks.
#[derive(Clone)]
pub struct Submitter {
    queue: TaskQueue,
    router: PartitionRouter,
    defaults: TaskDefaults,
    /// Attempts must finish well inside the in-flight window
    visibility_timeout: Duration,
    limits: Arc<CategoryLimits>,
    metrics: Arc<MetricsCollector>,
}

impl Submitter {
    pub fn new(
        queue: TaskQueue,
        router: PartitionRouter,
        defaults: TaskDefaults,
        rate_limits: RateLimitConfig,
        visibility_timeout: Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            queue,
            router,
            defaults,
            visibility_timeout,
            limits: Arc::new(CategoryLimits::new(rate_limits)),
            metrics,
        }
    }

    /// Build the task a descriptor describes, without routing side effects.
    pub fn validate(&self, descriptor: &TaskDescriptor) -> AnvilResult<Task> {
        let function_name = descriptor.function_name.trim();
        if function_name.is_empty() {
            return Err(AnvilError::validation("function_name", "must not be empty"));
        }

        let priority = match &descriptor.priority {
            Some(p) => p.parse::<TaskPriority>()?,
            None => TaskPriority::default(),
        };
        let worker_type = match &descriptor.worker_type {
            Some(w) => w.parse::<WorkerType>()?,
            None => WorkerType::default(),
        };

        let category = match descriptor.category.as_deref().map(str::trim) {
            Some("") => return Err(AnvilError::validation("category", "must not be empty")),
            Some(c) => c.to_string(),
            None => self.defaults.category.clone(),
        };

        let timeout = Duration::from_millis(descriptor.timeout_ms.unwrap_or(self.defaults.timeout_ms));
        if timeout.is_zero() {
            return Err(AnvilError::validation("timeout_ms", "must be greater than 0"));
        }
        if timeout >= self.visibility_timeout {
            return Err(AnvilError::validation(
                "timeout_ms",
                format!(
                    "must be below the queue visibility timeout of {}s",
                    self.visibility_timeout.as_secs()
                ),
            ));
        }

        let partition = self.router.route(&category, worker_type);
        let mut task = Task::new(function_name, worker_type, category, partition)
            .with_priority(priority)
            .with_args(descriptor.args.clone())
            .with_max_retries(descriptor.max_retries.unwrap_or(self.defaults.max_retries))
            .with_timeout(timeout);
        if let Some(name) = &descriptor.name {
            task.name = name.clone();
        }
        Ok(task)
    }

    /// Validate, rate limit, route and enqueue one task.
    pub async fn submit(&self, descriptor: TaskDescriptor) -> AnvilResult<SubmitReceipt> {
        let receipt = self.try_submit(&descriptor).await;
        match &receipt {
            Ok(r) => {
                self.metrics.record_submitted();
                tracing::debug!("🔨 Submitted task {} to partition {}", r.task_id, r.partition);
            }
            Err(e) => {
                self.metrics.record_rejected();
                tracing::debug!("🔨 Rejected '{}': {}", descriptor.function_name, e);
            }
        }
        receipt
    }

    async fn try_submit(&self, descriptor: &TaskDescriptor) -> AnvilResult<SubmitReceipt> {
        let mut task = self.validate(descriptor)?;
        self.limits.admit(&task.category).await?;

        task.transition(TaskState::Queued)?;
        self.queue.push(&task).await?;

        Ok(SubmitReceipt {
            task_id: task.id,
            partition: task.partition,
            state: task.state,
        })
    }

    /// Submit every descriptor; failures are reported per index.
    pub async fn submit_batch(&self, descriptors: Vec<TaskDescriptor>, mode: BatchMode) -> BatchReport {
        let outcomes: Vec<AnvilResult<SubmitReceipt>> = match mode {
            BatchMode::Sequential => {
                let mut outcomes = Vec::with_capacity(descriptors.len());
                for descriptor in descriptors {
                    outcomes.push(self.submit(descriptor).await);
                }
                outcomes
            }
            BatchMode::Concurrent => join_all(descriptors.into_iter().map(|d| self.submit(d))).await,
        };

        let mut report = BatchReport::default();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(receipt) => {
                    report.total_submitted += 1;
                    report.results.push(Some(receipt));
                }
                Err(e) => {
                    report.total_errors += 1;
                    report.errors.push(BatchError {
                        index,
                        error: e.to_string(),
                    });
                    report.results.push(None);
                }
            }
        }

        tracing::info!(
            "🔨 Batch submitted: {} accepted, {} rejected",
            report.total_submitted,
            report.total_errors
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryQueue, QueueBackend};
    use serde_json::json;
    use std::time::Instant;

    fn submitter(rate_limits: RateLimitConfig) -> (Submitter, Arc<InMemoryQueue>, Arc<MetricsCollector>) {
        let queue = Arc::new(InMemoryQueue::new());
        let metrics = Arc::new(MetricsCollector::default());
        let submitter = Submitter::new(
            queue.clone(),
            PartitionRouter::new(8),
            TaskDefaults::default(),
            rate_limits,
            Duration::from_secs(600),
            metrics.clone(),
        );
        (submitter, queue, metrics)
    }

    #[tokio::test]
    async fn test_submit_routes_and_queues() {
        let (submitter, queue, metrics) = submitter(RateLimitConfig::default());

        let receipt = submitter
            .submit(
                TaskDescriptor::new("send_email")
                    .priority("high")
                    .worker_type("IO_INTENSIVE")
                    .category("email")
                    .args(vec![json!("a@example.com")]),
            )
            .await
            .unwrap();

        assert_eq!(receipt.state, TaskState::Queued);
        assert_eq!(receipt.partition, PartitionRouter::new(8).route("email", WorkerType::IoIntensive));

        let task = queue.get_task(&receipt.task_id).await.unwrap().unwrap();
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.max_retries, 3);
        assert_eq!(metrics.totals().submitted, 1);
    }

    #[tokio::test]
    async fn test_validation_errors_name_the_field() {
        let (submitter, _, metrics) = submitter(RateLimitConfig::default());

        let cases = [
            (TaskDescriptor::new("  "), "function_name"),
            (TaskDescriptor::new("job").priority("URGENT"), "priority"),
            (TaskDescriptor::new("job").worker_type("GPU"), "worker_type"),
            (TaskDescriptor::new("job").category(""), "category"),
            (TaskDescriptor::new("job").timeout(Duration::ZERO), "timeout_ms"),
            (TaskDescriptor::new("job").timeout(Duration::from_secs(900)), "timeout_ms"),
        ];
        for (descriptor, expected) in cases {
            match submitter.submit(descriptor).await {
                Err(AnvilError::Validation { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected validation error on {expected}, got {other:?}"),
            }
        }
        assert_eq!(metrics.totals().rejected, 6);
    }

    #[tokio::test]
    async fn test_rate_limit_reject_mode() {
        let limits = RateLimitConfig::default();
        let (submitter, _, _) = submitter(RateLimitConfig {
            categories: HashMap::from([("email".to_string(), CategoryRateLimit::reject(1, 2))]),
            ..limits
        });

        for _ in 0..2 {
            submitter
                .submit(TaskDescriptor::new("job").category("email"))
                .await
                .unwrap();
        }
        let limited = submitter.submit(TaskDescriptor::new("job").category("email")).await;
        assert!(matches!(limited, Err(AnvilError::RateLimited { .. })));

        // Other categories are unaffected.
        assert!(submitter.submit(TaskDescriptor::new("job").category("sms")).await.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_delay_mode() {
        let (patient, _, _) = submitter(RateLimitConfig {
            default_limit: Some(CategoryRateLimit::delay(10, 1, 1_000)),
            ..Default::default()
        });

        let start = Instant::now();
        patient.submit(TaskDescriptor::new("job")).await.unwrap();
        patient.submit(TaskDescriptor::new("job")).await.unwrap();
        // The second submission waits for a token (~100ms at 10/s).
        assert!(start.elapsed() >= Duration::from_millis(50));

        let (strict, _, _) = submitter(RateLimitConfig {
            default_limit: Some(CategoryRateLimit::delay(1, 1, 10)),
            ..Default::default()
        });
        strict.submit(TaskDescriptor::new("job")).await.unwrap();
        let limited = strict.submit(TaskDescriptor::new("job")).await;
        assert!(matches!(limited, Err(AnvilError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn test_default_limit_forgets_idle_categories() {
        let limits = CategoryLimits::new(RateLimitConfig {
            default_limit: Some(CategoryRateLimit::reject(100, 1)),
            ..Default::default()
        });

        for i in 0..1_500 {
            limits.admit(&format!("tenant-{i}")).await.unwrap();
        }
        // Long enough for every bucket above to refill completely.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for i in 0..1_024 {
            limits.admit(&format!("late-{i}")).await.unwrap();
        }

        assert!(limits.tracked_defaults() <= 1_024);
        // A busy category keeps its state across sweeps.
        assert!(limits.admit("late-1023").await.is_err());
    }

    #[tokio::test]
    async fn test_configured_category_overrides_default() {
        let limits = CategoryLimits::new(RateLimitConfig {
            default_limit: Some(CategoryRateLimit::reject(1, 1)),
            categories: HashMap::from([("bulk".to_string(), CategoryRateLimit::reject(1, 3))]),
        });

        for _ in 0..3 {
            limits.admit("bulk").await.unwrap();
        }
        assert!(limits.admit("bulk").await.is_err());
        limits.admit("other").await.unwrap();
        assert!(limits.admit("other").await.is_err());
        assert_eq!(limits.tracked_defaults(), 1);
    }

    #[tokio::test]
    async fn test_batch_reports_partial_success() {
        let (submitter, _, _) = submitter(RateLimitConfig::default());

        for mode in [BatchMode::Sequential, BatchMode::Concurrent] {
            let descriptors: Vec<TaskDescriptor> = (0..10)
                .map(|i| {
                    if i == 3 {
                        TaskDescriptor::new("job").priority("NOT_A_PRIORITY")
                    } else {
                        TaskDescriptor::new("job").args(vec![json!(i)])
                    }
                })
                .collect();

            let report = submitter.submit_batch(descriptors, mode).await;
            assert_eq!(report.total_submitted, 9);
            assert_eq!(report.total_errors, 1);
            assert_eq!(report.errors[0].index, 3);
            assert_eq!(report.results.len(), 10);
            assert!(report.results[3].is_none());
            assert!(report.results[4].is_some());
        }
    }
}
