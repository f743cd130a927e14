//! Error types for anvilq operations.

use thiserror::Error;

/// Result type used throughout anvilq.
pub type AnvilResult<T> = Result<T, AnvilError>;

/// Main error type for anvilq operations.
#[derive(Error, Debug)]
pub enum AnvilError {
    /// A task descriptor was rejected at submission
    #[error("Invalid value for '{field}': {message}")]
    Validation {
        /// Offending descriptor field
        field: String,
        /// What was wrong with it
        message: String,
    },

    /// No handler registered under the task's function name
    #[error("Function '{function_name}' is not registered")]
    UnknownFunction {
        /// The function name that wasn't found
        function_name: String,
    },

    /// Task attempt exceeded its timeout
    #[error("Task attempt timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout in milliseconds
        timeout_ms: u64,
    },

    /// Handler-reported failure that may succeed on a later attempt
    #[error("Task execution failed: {message}")]
    TransientExecution {
        /// Error message
        message: String,
    },

    /// Handler-reported failure that retrying cannot fix
    #[error("Task execution failed permanently: {message}")]
    PermanentExecution {
        /// Error message
        message: String,
    },

    /// The backing store is unreachable or out of capacity
    #[error("Queue store unavailable: {message}")]
    ResourceExhausted {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Lock is held by another owner
    #[error("Lock '{name}' is held by another owner")]
    LockBusy {
        /// Lock name
        name: String,
    },

    /// Category exceeded its submission rate
    #[error("Rate limit exceeded for category '{category}', retry after {retry_after_ms}ms")]
    RateLimited {
        /// Rate-limited category
        category: String,
        /// Suggested wait before resubmitting
        retry_after_ms: u64,
    },

    /// Task not found in the store
    #[error("Task '{task_id}' not found")]
    TaskNotFound {
        /// Missing task id
        task_id: String,
    },

    /// Dead letter not found in the store
    #[error("Dead letter '{task_id}' not found")]
    DeadLetterNotFound {
        /// Missing dead letter id
        task_id: String,
    },

    /// Attempted to mutate a task in a terminal state
    #[error("Task '{task_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// Task id
        task_id: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Queue backend error
    #[error("Queue error: {message}")]
    Queue {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// Scheduler is already running
    #[error("Scheduler is already running")]
    AlreadyRunning,

    /// Scheduler is not running
    #[error("Scheduler is not running")]
    NotRunning,

    /// Redis error
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Prometheus registry or encoding error
    #[cfg(feature = "prometheus")]
    #[cfg_attr(docsrs, doc(cfg(feature = "prometheus")))]
    #[error("Metrics export error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

impl AnvilError {
    /// Create a validation error for a descriptor field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a retriable handler error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientExecution {
            message: message.into(),
        }
    }

    /// Create a non-retriable handler error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::PermanentExecution {
            message: message.into(),
        }
    }

    /// Create a store-unavailable error
    pub fn exhausted<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ResourceExhausted {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new queue error
    pub fn queue<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Queue {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the retry subsystem should schedule another attempt.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::TransientExecution { .. } => true,
            Self::ResourceExhausted { .. } | Self::LockBusy { .. } => true,
            Self::Serialization(_) | Self::Queue { .. } => true,
            #[cfg(feature = "redis-queue")]
            Self::Redis(_) => true,
            _ => false,
        }
    }

    /// Whether this error means the queue store cannot be reached.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::ResourceExhausted { .. } => true,
            #[cfg(feature = "redis-queue")]
            Self::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
            _ => false,
        }
    }
}

impl From<config::ConfigError> for AnvilError {
    fn from(err: config::ConfigError) -> Self {
        Self::config(err.to_string())
    }
}
