//! Configuration types for anvilq.
//!
//! Every section has a `Default`, and [`AnvilConfig::from_env`] layers
//! `ANVILQ_*` environment variables over those defaults. Nested keys use a
//! double underscore, e.g. `ANVILQ_QUEUE__ALLOW_MEMORY_FALLBACK=true` or
//! `ANVILQ_WORKERS__IO_INTENSIVE__MAX_WORKERS=64`.

use crate::error::AnvilResult;
use crate::task::{PartitionId, WorkerType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Environment variable prefix read by [`AnvilConfig::from_env`].
pub const ENV_PREFIX: &str = "ANVILQ";

/// Main configuration for an anvilq scheduler.
///
/// # Examples
///
/// ```rust
/// use anvilq::config::{AnvilConfig, CategoryRateLimit};
///
/// let config = AnvilConfig::default()
///     .with_partitions(8)
///     .with_rate_limit("email", CategoryRateLimit::reject(50, 10))
///     .with_memory_fallback(true);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnvilConfig {
    /// Partitioning of the task space
    pub partitions: PartitionConfig,

    /// Worker pool sizing
    pub workers: WorkerConfig,

    /// Defaults applied to submitted tasks
    pub tasks: TaskDefaults,

    /// Backoff between attempts
    pub retry: RetryPolicy,

    /// Queue store configuration
    pub queue: QueueConfig,

    /// Per-category submission rate limits
    pub rate_limits: RateLimitConfig,

    /// Pool auto-scaling
    pub autoscaler: AutoscalerConfig,

    /// Metrics sampling
    pub metrics: MetricsConfig,

    /// Eviction of finished tasks and dead letters
    pub retention: RetentionPolicy,

    /// Background engine loops
    pub engine: EngineConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Partition layout. Fixed for the lifetime of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Number of logical partitions
    pub count: u32,

    /// Partitions this process pulls from (None = all)
    pub owned: Option<Vec<PartitionId>>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            count: 16,
            owned: None,
        }
    }
}

impl PartitionConfig {
    /// Partitions this process should serve.
    pub fn assigned(&self) -> Vec<PartitionId> {
        match &self.owned {
            Some(owned) => owned.clone(),
            None => (0..self.count).collect(),
        }
    }
}

/// Bounds for one worker pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Lower bound the auto-scaler never goes below
    pub min_workers: usize,

    /// Upper bound the auto-scaler never exceeds
    pub max_workers: usize,

    /// Workers spawned at startup, clamped into `[min, max]`
    pub initial_workers: usize,
}

impl PoolConfig {
    pub fn new(min_workers: usize, max_workers: usize) -> Self {
        Self {
            min_workers,
            max_workers,
            initial_workers: min_workers,
        }
    }

    pub fn with_initial(mut self, initial_workers: usize) -> Self {
        self.initial_workers = initial_workers;
        self
    }

    /// Startup size clamped into the pool bounds.
    pub fn startup_size(&self) -> usize {
        self.initial_workers
            .clamp(self.min_workers, self.max_workers.max(self.min_workers))
    }

    /// Sizing heuristic for a worker type on a host with `cores` cores.
    pub fn sized_for(worker_type: WorkerType, cores: usize) -> Self {
        let cores = cores.max(1);
        match worker_type {
            WorkerType::CpuIntensive => Self::new(1, cores).with_initial(cores),
            WorkerType::GeneralPurpose => Self::new(1, cores * 2).with_initial(cores),
            WorkerType::IoIntensive => Self::new(2, cores * 4).with_initial(cores * 2),
            WorkerType::NetworkIntensive => Self::new(2, cores * 8).with_initial(cores * 4),
            WorkerType::MemoryIntensive => {
                Self::new(1, (cores / 2).max(2)).with_initial((cores / 2).max(1))
            }
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub cpu_intensive: PoolConfig,
    pub io_intensive: PoolConfig,
    pub memory_intensive: PoolConfig,
    pub network_intensive: PoolConfig,
    pub general_purpose: PoolConfig,

    /// Bounded wait for a task before an idle worker loops again (in milliseconds)
    pub idle_wait_ms: u64,

    /// Hard deadline for draining pools on shutdown (in seconds)
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::for_cores(num_cpus::get())
    }
}

impl WorkerConfig {
    /// Default pool sizes for a host with `cores` cores.
    pub fn for_cores(cores: usize) -> Self {
        Self {
            cpu_intensive: PoolConfig::sized_for(WorkerType::CpuIntensive, cores),
            io_intensive: PoolConfig::sized_for(WorkerType::IoIntensive, cores),
            memory_intensive: PoolConfig::sized_for(WorkerType::MemoryIntensive, cores),
            network_intensive: PoolConfig::sized_for(WorkerType::NetworkIntensive, cores),
            general_purpose: PoolConfig::sized_for(WorkerType::GeneralPurpose, cores),
            idle_wait_ms: 1000,
            shutdown_timeout_secs: 30,
        }
    }

    /// Every pool fixed at `workers` workers.
    pub fn uniform(workers: usize) -> Self {
        let pool = PoolConfig::new(workers, workers).with_initial(workers);
        Self {
            cpu_intensive: pool.clone(),
            io_intensive: pool.clone(),
            memory_intensive: pool.clone(),
            network_intensive: pool.clone(),
            general_purpose: pool,
            ..Self::for_cores(1)
        }
    }

    pub fn pool(&self, worker_type: WorkerType) -> &PoolConfig {
        match worker_type {
            WorkerType::CpuIntensive => &self.cpu_intensive,
            WorkerType::IoIntensive => &self.io_intensive,
            WorkerType::MemoryIntensive => &self.memory_intensive,
            WorkerType::NetworkIntensive => &self.network_intensive,
            WorkerType::GeneralPurpose => &self.general_purpose,
        }
    }

    pub fn pool_mut(&mut self, worker_type: WorkerType) -> &mut PoolConfig {
        match worker_type {
            WorkerType::CpuIntensive => &mut self.cpu_intensive,
            WorkerType::IoIntensive => &mut self.io_intensive,
            WorkerType::MemoryIntensive => &mut self.memory_intensive,
            WorkerType::NetworkIntensive => &mut self.network_intensive,
            WorkerType::GeneralPurpose => &mut self.general_purpose,
        }
    }

    /// Set the idle wait.
    pub fn with_idle_wait(mut self, wait_ms: u64) -> Self {
        self.idle_wait_ms = wait_ms;
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout_secs: u64) -> Self {
        self.shutdown_timeout_secs = timeout_secs;
        self
    }
}

/// Defaults for descriptors that omit execution constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaults {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub category: String,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000, // 5 minutes
            max_retries: 3,
            category: "default".to_string(),
        }
    }
}

/// Retry backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Base delay between retries (in milliseconds)
    pub base_delay_ms: u64,

    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,

    /// Backoff strategy
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000, // 1 second
            max_delay_ms: 60000, // 1 minute
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff from `base_delay_ms`, capped at `max_delay_ms`.
    pub fn exponential(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            backoff_strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
        }
    }

    /// Create a retry policy with fixed delays.
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay before the attempt following `attempt_count` completed attempts.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        Duration::from_millis(crate::utils::calculate_backoff(self, attempt_count))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear backoff (base + attempt * increment)
    Linear {
        /// Increment per attempt (in milliseconds)
        increment_ms: u64,
    },

    /// Exponential backoff (base * multiplier^attempt)
    Exponential {
        /// Multiplier for exponential growth
        multiplier: f64,
    },
}

/// Queue store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Which store backs the queues
    pub backend: QueueBackendConfig,

    /// Degrade to process-local queues when the store is unreachable
    pub allow_memory_fallback: bool,

    /// How long a popped task stays invisible before redelivery (in seconds)
    pub visibility_timeout_secs: u64,

    /// Timeout for a single store round trip (in milliseconds)
    pub operation_timeout_ms: u64,

    /// Poll interval for backends without push notification (in milliseconds)
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackendConfig::InMemory,
            allow_memory_fallback: false,
            visibility_timeout_secs: 600, // 10 minutes
            operation_timeout_ms: 5000,
            poll_interval_ms: 50,
        }
    }
}

impl QueueConfig {
    /// Create configuration for in-memory queue.
    pub fn in_memory() -> Self {
        Self {
            backend: QueueBackendConfig::InMemory,
            ..Default::default()
        }
    }

    /// Create configuration for a Redis-backed queue spread over `nodes`.
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub fn redis<S: Into<String>>(nodes: impl IntoIterator<Item = S>) -> Self {
        Self {
            backend: QueueBackendConfig::Redis(RedisConfig {
                nodes: nodes.into_iter().map(Into::into).collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Set the visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout_secs: u64) -> Self {
        self.visibility_timeout_secs = timeout_secs;
        self
    }

    /// Allow or forbid the memory-mode fallback.
    pub fn with_memory_fallback(mut self, allow: bool) -> Self {
        self.allow_memory_fallback = allow;
        self
    }
}

/// Queue backend-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueBackendConfig {
    /// Process-local queues
    InMemory,

    /// Redis queue configuration
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    Redis(RedisConfig),
}

/// Redis queue configuration.
#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// One connection string per store node; partitions map onto them in order
    pub nodes: Vec<String>,

    /// Key prefix for Redis keys
    pub key_prefix: String,

    /// Timeout for establishing a node connection (in seconds)
    pub connect_timeout_secs: u64,
}

#[cfg(feature = "redis-queue")]
impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["redis://127.0.0.1:6379".to_string()],
            key_prefix: "anvilq".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

/// What happens to a submission over its category's rate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    /// Fail immediately with `RateLimited`
    Reject,
    /// Wait for capacity, up to `max_delay_ms`
    Delay,
}

/// Token bucket for one category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryRateLimit {
    /// Sustained submissions per second
    pub per_second: u32,

    /// Submissions allowed above the sustained rate
    pub burst: u32,

    pub mode: RateLimitMode,

    /// Longest a delayed submission may wait (in milliseconds)
    pub max_delay_ms: u64,
}

impl CategoryRateLimit {
    pub fn reject(per_second: u32, burst: u32) -> Self {
        Self {
            per_second,
            burst,
            mode: RateLimitMode::Reject,
            max_delay_ms: 0,
        }
    }

    pub fn delay(per_second: u32, burst: u32, max_delay_ms: u64) -> Self {
        Self {
            per_second,
            burst,
            mode: RateLimitMode::Delay,
            max_delay_ms,
        }
    }
}

/// Per-category rate limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Limit applied to categories without their own entry (None = unlimited)
    pub default_limit: Option<CategoryRateLimit>,

    /// Limits keyed by category
    pub categories: HashMap<String, CategoryRateLimit>,
}

impl RateLimitConfig {
    pub fn limit_for(&self, category: &str) -> Option<&CategoryRateLimit> {
        self.categories
            .get(category)
            .or(self.default_limit.as_ref())
    }
}

/// Auto-scaler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    pub enabled: bool,

    /// Evaluation interval (in seconds)
    pub interval_secs: u64,

    /// Backlog above which a pool grows
    pub scale_up_threshold: usize,

    /// Workers added per scale-up
    pub step_up: usize,

    /// Workers removed per scale-down
    pub step_down: usize,

    /// How long backlog must stay at zero before shrinking (in seconds)
    pub idle_window_secs: u64,

    /// Minimum time between two changes to the same pool (in seconds)
    pub cooldown_secs: u64,

    /// No scale-up at or above this host CPU usage
    pub max_cpu_percent: f64,

    /// No scale-up at or above this host memory usage
    pub max_memory_percent: f64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 15,
            scale_up_threshold: 10,
            step_up: 2,
            step_down: 1,
            idle_window_secs: 60,
            cooldown_secs: 30,
            max_cpu_percent: 85.0,
            max_memory_percent: 90.0,
        }
    }
}

/// Metrics sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Sampling interval (in seconds)
    pub sample_interval_secs: u64,

    /// Window for the rolling throughput figure (in seconds)
    pub throughput_window_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 5,
            throughput_window_secs: 60,
        }
    }
}

/// Bounds on stored finished tasks and dead letters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Evict completed tasks older than this (in seconds)
    pub completed_max_age_secs: u64,

    /// Keep at most this many completed tasks
    pub completed_max_count: usize,

    /// Evict dead letters older than this (None = keep until purged)
    pub dead_letter_max_age_secs: Option<u64>,

    /// Keep at most this many dead letters (None = unbounded)
    pub dead_letter_max_count: Option<usize>,

    /// How often the janitor sweeps (in seconds)
    pub sweep_interval_secs: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_max_age_secs: 3600, // 1 hour
            completed_max_count: 10_000,
            dead_letter_max_age_secs: Some(7 * 24 * 3600),
            dead_letter_max_count: Some(100_000),
            sweep_interval_secs: 60,
        }
    }
}

/// Engine-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Health check interval (in seconds)
    pub health_check_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include timestamps in logs
    pub include_timestamps: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_timestamps: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl AnvilConfig {
    /// Load configuration from `ANVILQ_*` environment variables over defaults.
    pub fn from_env() -> AnvilResult<Self> {
        Self::from_env_with_prefix(ENV_PREFIX)
    }

    /// Load configuration from `{prefix}_*` environment variables over defaults.
    pub fn from_env_with_prefix(prefix: &str) -> AnvilResult<Self> {
        let defaults = config::Config::try_from(&Self::default())?;
        let environment = config::Environment::with_prefix(prefix)
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("partitions.owned")
            .with_list_parse_key("queue.backend.nodes")
            .try_parsing(true);

        let loaded = config::Config::builder()
            .add_source(defaults)
            .add_source(environment)
            .build()?
            .try_deserialize::<Self>()?;
        Ok(loaded)
    }

    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            partitions: PartitionConfig {
                count: 4,
                ..Default::default()
            },
            workers: WorkerConfig::for_cores(2),
            tasks: TaskDefaults {
                timeout_ms: 60_000,
                ..Default::default()
            },
            queue: QueueConfig {
                visibility_timeout_secs: 120,
                allow_memory_fallback: true,
                ..Default::default()
            },
            retention: RetentionPolicy {
                completed_max_age_secs: 300, // 5 minutes
                ..Default::default()
            },
            engine: EngineConfig {
                health_check_interval_secs: 10,
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: true,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            workers: WorkerConfig {
                shutdown_timeout_secs: 60,
                ..Default::default()
            },
            retry: RetryPolicy::exponential(1000, 300_000),
            queue: QueueConfig {
                visibility_timeout_secs: 900, // 15 minutes
                allow_memory_fallback: false,
                ..Default::default()
            },
            retention: RetentionPolicy {
                completed_max_age_secs: 86400, // 24 hours
                completed_max_count: 100_000,
                ..Default::default()
            },
            engine: EngineConfig {
                health_check_interval_secs: 60,
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                include_timestamps: true,
                include_targets: false,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            partitions: PartitionConfig {
                count: 4,
                ..Default::default()
            },
            workers: WorkerConfig::uniform(1)
                .with_idle_wait(50)
                .with_shutdown_timeout(5),
            tasks: TaskDefaults {
                timeout_ms: 2_000,
                max_retries: 1,
                ..Default::default()
            },
            retry: RetryPolicy::fixed(10),
            queue: QueueConfig {
                visibility_timeout_secs: 10,
                poll_interval_ms: 10,
                ..Default::default()
            },
            autoscaler: AutoscalerConfig {
                enabled: false,
                ..Default::default()
            },
            metrics: MetricsConfig {
                sample_interval_secs: 1,
                throughput_window_secs: 10,
            },
            retention: RetentionPolicy {
                sweep_interval_secs: 1,
                ..Default::default()
            },
            engine: EngineConfig {
                health_check_interval_secs: 1,
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_timestamps: false,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set the partition count.
    pub fn with_partitions(mut self, count: u32) -> Self {
        self.partitions.count = count;
        self
    }

    /// Override the bounds of one pool.
    pub fn with_pool(mut self, worker_type: WorkerType, pool: PoolConfig) -> Self {
        *self.workers.pool_mut(worker_type) = pool;
        self
    }

    /// Add a rate limit for a category.
    pub fn with_rate_limit(mut self, category: impl Into<String>, limit: CategoryRateLimit) -> Self {
        self.rate_limits.categories.insert(category.into(), limit);
        self
    }

    /// Allow or forbid the memory-mode fallback.
    pub fn with_memory_fallback(mut self, allow: bool) -> Self {
        self.queue.allow_memory_fallback = allow;
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.partitions.count == 0 {
            errors.push("Partition count must be greater than 0".to_string());
        }
        if let Some(owned) = &self.partitions.owned {
            if owned.is_empty() {
                errors.push("Owned partitions must not be empty when set".to_string());
            }
            if let Some(p) = owned.iter().find(|p| **p >= self.partitions.count) {
                errors.push(format!(
                    "Owned partition {} is outside 0..{}",
                    p, self.partitions.count
                ));
            }
        }

        for worker_type in WorkerType::ALL {
            let pool = self.workers.pool(worker_type);
            if pool.max_workers == 0 {
                errors.push(format!("{} max_workers must be greater than 0", worker_type));
            }
            if pool.min_workers > pool.max_workers {
                errors.push(format!(
                    "{} min_workers must not exceed max_workers",
                    worker_type
                ));
            }
        }
        if self.workers.idle_wait_ms == 0 {
            errors.push("Worker idle wait must be greater than 0".to_string());
        }

        if self.tasks.timeout_ms == 0 {
            errors.push("Default task timeout must be greater than 0".to_string());
        }

        if self.queue.visibility_timeout_secs == 0 {
            errors.push("Visibility timeout must be greater than 0".to_string());
        }
        if self.queue.visibility_timeout_secs * 1000 <= self.tasks.timeout_ms {
            errors.push("Visibility timeout must exceed the default task timeout".to_string());
        }
        #[cfg(feature = "redis-queue")]
        if let QueueBackendConfig::Redis(redis) = &self.queue.backend {
            if redis.nodes.is_empty() {
                errors.push("Redis backend needs at least one node".to_string());
            }
        }

        if self.retry.base_delay_ms == 0 {
            errors.push("Retry base delay must be greater than 0".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("Retry max delay must be greater than or equal to base delay".to_string());
        }

        let limits = self
            .rate_limits
            .categories
            .iter()
            .map(|(c, l)| (c.as_str(), l))
            .chain(self.rate_limits.default_limit.iter().map(|l| ("default", l)));
        for (category, limit) in limits {
            if limit.per_second == 0 || limit.burst == 0 {
                errors.push(format!(
                    "Rate limit for '{}' needs per_second and burst greater than 0",
                    category
                ));
            }
        }

        if self.autoscaler.interval_secs == 0 {
            errors.push("Autoscaler interval must be greater than 0".to_string());
        }
        if self.autoscaler.step_up == 0 || self.autoscaler.step_down == 0 {
            errors.push("Autoscaler steps must be greater than 0".to_string());
        }

        if self.metrics.sample_interval_secs == 0 {
            errors.push("Metrics sample interval must be greater than 0".to_string());
        }
        if self.retention.sweep_interval_secs == 0 {
            errors.push("Retention sweep interval must be greater than 0".to_string());
        }
        if self.engine.health_check_interval_secs == 0 {
            errors.push("Health check interval must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
