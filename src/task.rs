//! Task definition and lifecycle states.

use crate::error::{SessionqError, SessionqResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a task
pub type TaskId = String;

/// Highest urgency a task can carry.
pub const MIN_PRIORITY: u8 = 1;
/// Lowest urgency a task can carry; demotion never goes past it.
pub const MAX_PRIORITY: u8 = 10;

/// Status of a task in the queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is waiting to be processed
    Queued,
    /// Task is currently being executed by a worker
    Processing,
    /// Task completed successfully
    Completed,
    /// Task failed and is waiting out a retry delay
    FailedRetrying,
    /// Task failed permanently (max retries exceeded)
    DeadLetter,
}

impl TaskStatus {
    /// Name used in the persisted `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::FailedRetrying => "failed_retrying",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Completed and dead-lettered tasks never move again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter)
    }

    /// Statuses that recovery puts back into the pending queue.
    pub fn is_unfinished(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Processing | Self::FailedRetrying
        )
    }

    /// Whether the lifecycle state machine allows `self -> next`.
    ///
    /// `processing -> queued` covers both an immediate retry and recovery of
    /// an interrupted task.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Queued, Queued | Processing) => true,
            (Processing, Queued | Completed | FailedRetrying | DeadLetter) => true,
            (FailedRetrying, Queued | Processing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = SessionqError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed_retrying" => Ok(Self::FailedRetrying),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(SessionqError::store(format!("unknown task status '{other}'"))),
        }
    }
}

/// A unit of work: one command bound for the execution session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique task identifier
    pub task_id: TaskId,
    /// Opaque payload handed verbatim to the executor
    pub command: String,
    /// 1 (most urgent) to 10 (least urgent)
    pub priority: u8,
    /// Rate limiting bucket
    pub category: String,
    /// Admission time
    pub created_at: DateTime<Utc>,
    /// Maximum number of retries allowed
    pub max_retries: u32,
    /// Number of retries already consumed
    pub retry_count: u32,
    /// Advisory runtime estimate in seconds
    pub estimated_duration: f64,
    /// Current status
    pub status: TaskStatus,
    /// When the last attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure reason
    pub error_message: Option<String>,
}

impl Task {
    /// Whether another attempt is allowed after a failure.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Short, log-friendly prefix of the command.
    pub fn command_preview(&self) -> String {
        preview(&self.command)
    }
}

pub(crate) fn preview(command: &str) -> String {
    const LIMIT: usize = 50;
    match command.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &command[..idx]),
        None => command.to_string(),
    }
}

/// An admission request, before the queue assigns an id and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    /// Command to execute
    pub command: String,
    /// 1 (most urgent) to 10 (least urgent)
    pub priority: u8,
    /// Rate limiting bucket
    pub category: String,
    /// Advisory runtime estimate in seconds
    pub estimated_duration: f64,
    /// Maximum number of retries allowed
    pub max_retries: u32,
}

impl NewTask {
    /// Request with the default priority (5), category and retry budget (3).
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            priority: 5,
            category: "default".to_string(),
            estimated_duration: 2.0,
            max_retries: 3,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the rate limiting category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the advisory duration estimate.
    pub fn with_estimated_duration(mut self, secs: f64) -> Self {
        self.estimated_duration = secs;
        self
    }

    /// Reject priorities outside 1..=10.
    pub fn validate(&self) -> SessionqResult<()> {
        if (MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            Ok(())
        } else {
            Err(SessionqError::InvalidPriority {
                priority: self.priority,
            })
        }
    }

    /// Materialise the request into a queued task.
    pub(crate) fn into_task(self, task_id: TaskId, created_at: DateTime<Utc>) -> Task {
        Task {
            task_id,
            command: self.command,
            priority: self.priority,
            category: self.category,
            created_at,
            max_retries: self.max_retries,
            retry_count: 0,
            estimated_duration: self.estimated_duration,
            status: TaskStatus::Queued,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }
}

/// Derive a task id from the command, its priority, the admission timestamp
/// and the admission sequence number.
pub(crate) fn generate_task_id(
    command: &str,
    priority: u8,
    created_at: DateTime<Utc>,
    sequence: u64,
) -> TaskId {
    let name = format!(
        "{}_{}_{}_{}",
        command,
        priority,
        created_at.timestamp_nanos_opt().unwrap_or_default(),
        sequence
    );
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes())
        .simple()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_column_names() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::FailedRetrying,
            TaskStatus::DeadLetter,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("failed".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses_never_transition() {
        for next in [
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::FailedRetrying,
            TaskStatus::DeadLetter,
        ] {
            assert!(!TaskStatus::Completed.can_transition_to(next));
            assert!(!TaskStatus::DeadLetter.can_transition_to(next));
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::DeadLetter));
        assert!(TaskStatus::FailedRetrying.can_transition_to(TaskStatus::Processing));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_new_task_validation() {
        assert!(NewTask::new("echo hi").validate().is_ok());
        assert!(NewTask::new("echo hi").with_priority(1).validate().is_ok());
        assert!(NewTask::new("echo hi").with_priority(10).validate().is_ok());

        let err = NewTask::new("echo hi").with_priority(0).validate().unwrap_err();
        assert!(matches!(err, SessionqError::InvalidPriority { priority: 0 }));
        assert!(NewTask::new("echo hi").with_priority(11).validate().is_err());
    }

    #[test]
    fn test_task_ids_differ_by_sequence() {
        let now = Utc::now();
        let a = generate_task_id("echo hi", 5, now, 1);
        let b = generate_task_id("echo hi", 5, now, 2);
        assert_ne!(a, b);
        assert_eq!(a, generate_task_id("echo hi", 5, now, 1));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_command_preview_truncates_long_commands() {
        let task = NewTask::new("x".repeat(80)).into_task("t".into(), Utc::now());
        assert_eq!(task.command_preview().len(), 53);
        assert_eq!(preview("short"), "short");
    }
}
