//! Error types for SessionQ operations.

use crate::task::{TaskId, TaskStatus};
use thiserror::Error;

/// Result type used throughout SessionQ.
pub type SessionqResult<T> = Result<T, SessionqError>;

/// Main error type for SessionQ operations.
#[derive(Error, Debug)]
pub enum SessionqError {
    /// Priority outside the accepted 1..=10 range
    #[error("Invalid priority {priority}: expected a value between 1 and 10")]
    InvalidPriority {
        /// The rejected priority
        priority: u8,
    },

    /// The pending queue already holds `max_queue_size` tasks
    #[error("Queue is full (max size: {max_size})")]
    AtCapacity {
        /// Configured capacity
        max_size: usize,
    },

    /// The category exceeded its admissions per second
    #[error("Category '{category}' is rate limited ({limit}/s)")]
    RateLimited {
        /// Category that was throttled
        category: String,
        /// Configured per-second limit
        limit: usize,
    },

    /// Admissions are closed because the queue is shutting down
    #[error("Queue is shutting down, admissions are closed")]
    ShuttingDown,

    /// Command execution failed
    #[error("Command execution failed: {message}")]
    ExecutionFailed {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Command execution exceeded the task timeout
    #[error("Command execution timed out after {timeout_secs} seconds")]
    Timeout {
        /// Timeout duration in seconds
        timeout_secs: u64,
    },

    /// Store refused a status change on a task that already finished
    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Task identifier
        task_id: TaskId,
        /// Current status
        from: TaskStatus,
        /// Requested status
        to: TaskStatus,
    },

    /// Store backend error
    #[error("Store error: {message}")]
    StoreError {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// Workers are already running
    #[error("Queue workers are already running")]
    AlreadyRunning,

    /// Workers are not running
    #[error("Queue workers are not running")]
    NotRunning,

    /// Database error
    #[cfg(feature = "sqlite-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "sqlite-store")))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl SessionqError {
    /// Create a new execution error with an underlying cause
    pub fn execution<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ExecutionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new execution error from a message only
    pub fn execution_msg(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Whether this error is an admission rejection (no task was created).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidPriority { .. }
                | Self::AtCapacity { .. }
                | Self::RateLimited { .. }
                | Self::ShuttingDown
        )
    }
}
