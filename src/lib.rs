//! # anvilq
//!
//! A distributed priority task scheduler and execution engine for Rust.
//!
//! ## Features
//!
//! - **Partitioned priority queues**: eight priority levels, strict priority
//!   then FIFO, tasks routed to a fixed partition by category and worker type
//! - **Specialized worker pools**: one auto-scaled pool per worker type
//! - **Retries and dead letters**: exponential backoff with a per-task budget,
//!   full error history on dead letters, operator replay and purge
//! - **Distributed locks**: token-checked locks with expiry on the queue store
//! - **Redis or memory**: sharded Redis store with an optional fallback to
//!   in-process memory mode when the store becomes unreachable
//! - **Observability**: `tracing` logs, pull-based metrics snapshots and an
//!   optional Prometheus exporter
//!
//! ## Quick Start
//!
//! ```rust
//! use anvilq::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> AnvilResult<()> {
//!     let config = AnvilConfig::testing();
//!     anvilq::telemetry::init_tracing(&config.logging);
//!
//!     let anvil = Anvil::new(config).await?;
//!     anvil
//!         .register_fn("send_email", |ctx, args| async move {
//!             let to = args.first().and_then(|v| v.as_str()).unwrap_or_default();
//!             Ok(json!(format!("attempt {} sent to {}", ctx.attempt, to)))
//!         })
//!         .await;
//!
//!     anvil.start().await?;
//!     anvil
//!         .submit(
//!             TaskDescriptor::new("send_email")
//!                 .priority("HIGH")
//!                 .worker_type("IO_INTENSIVE")
//!                 .category("email")
//!                 .args(vec![json!("ops@example.com")]),
//!         )
//!         .await?;
//!     anvil.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod task;
pub mod telemetry;
pub mod utils;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::core::{
        Anvil, BatchMode, BatchReport, FunctionRegistry, HealthStatus, LockGuard, LockManager,
        SubmitReceipt, TaskContext, TaskHandler,
    };
    pub use crate::error::{AnvilError, AnvilResult};
    pub use crate::metrics::MetricsSnapshot;
    pub use crate::queue::{QueueBackend, QueueFactory, TaskQueue};
    pub use crate::task::{
        DeadLetterEntry, DeadLetterFilter, Task, TaskDescriptor, TaskFilter, TaskId, TaskPriority,
        TaskState, WorkerType,
    };
    pub use async_trait::async_trait;
}

pub use crate::config::AnvilConfig;
pub use crate::core::Anvil;
pub use crate::error::{AnvilError, AnvilResult};
pub use crate::queue::{QueueBackend, TaskQueue};
pub use crate::task::{Task, TaskDescriptor, TaskId, TaskPriority, TaskState, WorkerType};
pub use async_trait::async_trait;
