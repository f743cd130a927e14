//! Task model: priorities, worker types, lifecycle states and descriptors.

use crate::error::{AnvilError, AnvilResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

/// Unique identifier for a task
pub type TaskId = String;

/// Logical partition a task is routed to
pub type PartitionId = u32;

/// Scheduling priority. Declared lowest first so the derived `Ord` ranks
/// `Emergency` highest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Maintenance,
    Background,
    Batch,
    Low,
    #[default]
    Normal,
    High,
    Critical,
    Emergency,
}

impl TaskPriority {
    /// All priorities in dequeue order.
    pub const ALL_DESCENDING: [TaskPriority; 8] = [
        TaskPriority::Emergency,
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
        TaskPriority::Batch,
        TaskPriority::Background,
        TaskPriority::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Emergency => "EMERGENCY",
            TaskPriority::Critical => "CRITICAL",
            TaskPriority::High => "HIGH",
            TaskPriority::Normal => "NORMAL",
            TaskPriority::Low => "LOW",
            TaskPriority::Batch => "BATCH",
            TaskPriority::Background => "BACKGROUND",
            TaskPriority::Maintenance => "MAINTENANCE",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = AnvilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskPriority::ALL_DESCENDING
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AnvilError::validation("priority", format!("unknown priority '{s}'")))
    }
}

/// Resource profile a task needs; each has its own worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerType {
    CpuIntensive,
    IoIntensive,
    MemoryIntensive,
    NetworkIntensive,
    #[default]
    GeneralPurpose,
}

impl WorkerType {
    pub const ALL: [WorkerType; 5] = [
        WorkerType::CpuIntensive,
        WorkerType::IoIntensive,
        WorkerType::MemoryIntensive,
        WorkerType::NetworkIntensive,
        WorkerType::GeneralPurpose,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::CpuIntensive => "CPU_INTENSIVE",
            WorkerType::IoIntensive => "IO_INTENSIVE",
            WorkerType::MemoryIntensive => "MEMORY_INTENSIVE",
            WorkerType::NetworkIntensive => "NETWORK_INTENSIVE",
            WorkerType::GeneralPurpose => "GENERAL_PURPOSE",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = AnvilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerType::ALL
            .into_iter()
            .find(|w| w.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                AnvilError::validation("worker_type", format!("unknown worker type '{s}'"))
            })
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Created but not yet in a queue
    Pending,
    /// Waiting in a partition queue
    Queued,
    /// An attempt is executing
    Running,
    /// Failed, waiting for its backoff to elapse
    Retrying,
    /// Finished successfully
    Completed,
    /// Retry budget exhausted or failure was not retriable
    DeadLettered,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::DeadLettered)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Queued => "QUEUED",
            TaskState::Running => "RUNNING",
            TaskState::Retrying => "RETRYING",
            TaskState::Completed => "COMPLETED",
            TaskState::DeadLettered => "DEAD_LETTERED",
        };
        f.write_str(s)
    }
}

/// One failed attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptError {
    pub attempt: u32,
    pub message: String,
    pub at: SystemTime,
}

/// A unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Human-readable label, not used for routing
    pub name: String,
    /// Key into the function registry
    pub function_name: String,
    pub args: Vec<serde_json::Value>,
    pub priority: TaskPriority,
    pub worker_type: WorkerType,
    /// Free-form classification for rate limiting and metrics
    pub category: String,
    pub max_retries: u32,
    pub timeout: Duration,
    pub state: TaskState,
    pub attempt_count: u32,
    /// Fixed at submission
    pub partition: PartitionId,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub updated_at: SystemTime,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub error_history: Vec<AttemptError>,
    /// Dead letter this task was replayed from
    #[serde(default)]
    pub replayed_from: Option<TaskId>,
}

impl Task {
    /// Create a pending task with a fresh id.
    pub fn new(
        function_name: impl Into<String>,
        worker_type: WorkerType,
        category: impl Into<String>,
        partition: PartitionId,
    ) -> Self {
        let function_name = function_name.into();
        let now = SystemTime::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: function_name.clone(),
            function_name,
            args: Vec::new(),
            priority: TaskPriority::Normal,
            worker_type,
            category: category.into(),
            max_retries: 3,
            timeout: Duration::from_secs(300),
            state: TaskState::Pending,
            attempt_count: 0,
            partition,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            result: None,
            error: None,
            error_history: Vec::new(),
            replayed_from: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Move to `to`, refusing any change once the task is terminal.
    pub fn transition(&mut self, to: TaskState) -> AnvilResult<()> {
        if self.state.is_terminal() {
            return Err(AnvilError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        self.updated_at = SystemTime::now();
        Ok(())
    }

    /// Begin a new execution attempt.
    pub fn mark_running(&mut self) -> AnvilResult<()> {
        self.transition(TaskState::Running)?;
        self.attempt_count += 1;
        self.started_at = Some(self.updated_at);
        Ok(())
    }

    pub fn mark_completed(&mut self, result: serde_json::Value) -> AnvilResult<()> {
        self.transition(TaskState::Completed)?;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Record the error of the current attempt.
    pub fn record_failure(&mut self, message: impl Into<String>) -> AnvilResult<()> {
        if self.state.is_terminal() {
            return Err(AnvilError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.state.to_string(),
                to: self.state.to_string(),
            });
        }
        let message = message.into();
        self.error_history.push(AttemptError {
            attempt: self.attempt_count,
            message: message.clone(),
            at: SystemTime::now(),
        });
        self.error = Some(message);
        Ok(())
    }

    pub fn mark_dead_lettered(&mut self) -> AnvilResult<()> {
        self.transition(TaskState::DeadLettered)?;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Whether another attempt fits the retry budget.
    pub fn has_retry_budget(&self) -> bool {
        self.attempt_count <= self.max_retries
    }
}

/// What a caller submits. Enumerated fields are plain strings so unknown
/// values surface as validation errors instead of deserialization failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    pub function_name: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub worker_type: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl TaskDescriptor {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    pub fn priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn worker_type(mut self, worker_type: impl Into<String>) -> Self {
        self.worker_type = Some(worker_type.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Filter for `list_tasks`
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub category: Option<String>,
    pub state: Option<TaskState>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.category.as_ref().is_none_or(|c| *c == task.category)
            && self.state.is_none_or(|s| s == task.state)
    }
}

/// Terminal snapshot of a task that exhausted or could not use its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task: Task,
    /// Every error across all attempts, oldest first
    pub errors: Vec<AttemptError>,
    pub reason: String,
    pub dead_lettered_at: SystemTime,
}

impl DeadLetterEntry {
    pub fn new(task: Task, reason: impl Into<String>) -> Self {
        Self {
            errors: task.error_history.clone(),
            task,
            reason: reason.into(),
            dead_lettered_at: SystemTime::now(),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task.id
    }
}

/// Filter for `list_dead_letters`
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub category: Option<String>,
    pub function_name: Option<String>,
    pub worker_type: Option<WorkerType>,
    pub limit: Option<usize>,
}

impl DeadLetterFilter {
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        let task = &entry.task;
        self.category.as_ref().is_none_or(|c| *c == task.category)
            && self
                .function_name
                .as_ref()
                .is_none_or(|f| *f == task.function_name)
            && self.worker_type.is_none_or(|w| w == task.worker_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(TaskPriority::Emergency > TaskPriority::Critical);
        assert!(TaskPriority::High > TaskPriority::Low);
        assert!(TaskPriority::Background > TaskPriority::Maintenance);

        let mut sorted = TaskPriority::ALL_DESCENDING.to_vec();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(sorted, TaskPriority::ALL_DESCENDING.to_vec());
    }

    #[test]
    fn test_parse_enums_case_insensitive() {
        assert_eq!("high".parse::<TaskPriority>().unwrap(), TaskPriority::High);
        assert_eq!(
            "Io_Intensive".parse::<WorkerType>().unwrap(),
            WorkerType::IoIntensive
        );

        let err = "URGENT".parse::<TaskPriority>().unwrap_err();
        assert!(matches!(err, AnvilError::Validation { ref field, .. } if field == "priority"));

        let err = "GPU".parse::<WorkerType>().unwrap_err();
        assert!(matches!(err, AnvilError::Validation { ref field, .. } if field == "worker_type"));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&WorkerType::NetworkIntensive).unwrap();
        assert_eq!(json, "\"NETWORK_INTENSIVE\"");
        let json = serde_json::to_string(&TaskState::DeadLettered).unwrap();
        assert_eq!(json, "\"DEAD_LETTERED\"");
    }

    #[test]
    fn test_attempt_lifecycle() {
        let mut task = Task::new("resize", WorkerType::CpuIntensive, "images", 3).with_max_retries(1);
        task.transition(TaskState::Queued).unwrap();

        task.mark_running().unwrap();
        assert_eq!(task.attempt_count, 1);
        assert!(task.started_at.is_some());
        task.record_failure("boom").unwrap();
        assert!(task.has_retry_budget());

        task.transition(TaskState::Retrying).unwrap();
        task.transition(TaskState::Queued).unwrap();
        task.mark_running().unwrap();
        task.record_failure("boom again").unwrap();
        assert!(!task.has_retry_budget());

        task.mark_dead_lettered().unwrap();
        assert_eq!(task.error_history.len(), 2);
        assert_eq!(task.error_history[1].attempt, 2);
    }

    #[test]
    fn test_terminal_tasks_are_immutable() {
        let mut task = Task::new("noop", WorkerType::GeneralPurpose, "misc", 0);
        task.mark_running().unwrap();
        task.mark_completed(serde_json::json!("done")).unwrap();

        assert!(matches!(
            task.transition(TaskState::Queued),
            Err(AnvilError::InvalidTransition { .. })
        ));
        assert!(task.mark_running().is_err());
        assert!(task.record_failure("late").is_err());
        assert_eq!(task.attempt_count, 1);
        assert_eq!(task.state, TaskState::Completed);
    }

    #[test]
    fn test_filters() {
        let task = Task::new("send", WorkerType::NetworkIntensive, "email", 1);
        let filter = TaskFilter {
            category: Some("email".to_string()),
            state: Some(TaskState::Pending),
            limit: None,
        };
        assert!(filter.matches(&task));
        assert!(!TaskFilter {
            category: Some("billing".to_string()),
            ..Default::default()
        }
        .matches(&task));

        let entry = DeadLetterEntry::new(task, "exhausted");
        let filter = DeadLetterFilter {
            worker_type: Some(WorkerType::NetworkIntensive),
            function_name: Some("send".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&entry));
    }
}
