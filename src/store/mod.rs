//! Durable task records for SessionQ.
//!
//! The store is the recovery source at startup and the history of every task
//! ever admitted. The queue never waits on it for correctness: failed writes
//! are logged and in-memory state stays authoritative until the next
//! successful write.
//!
//! - **In-Memory**: for tests and embedders that do not need durability
//! - **SQLite**: durable, via `sqlx` (requires the `sqlite-store` feature)
//!
//! # Examples
//!
//! ```rust,no_run
//! use sessionq::store::MemoryStore;
//!
//! let store = MemoryStore::new();
//!
//! # #[cfg(feature = "sqlite-store")]
//! # async fn example() -> sessionq::SessionqResult<()> {
//! let store = sessionq::store::SqliteStore::connect("sqlite:///tmp/sessionq.db", 5).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::SessionqResult;
use crate::stats::StatsSnapshot;
use crate::task::{Task, TaskId, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod memory;
pub use memory::MemoryStore;

#[cfg(feature = "sqlite-store")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite-store")))]
pub mod sqlite;

#[cfg(feature = "sqlite-store")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite-store")))]
pub use sqlite::SqliteStore;

/// Partial update applied on a status transition. `None` fields keep their
/// stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    /// New status
    pub status: TaskStatus,
    /// Attempt start time
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason
    pub error_message: Option<String>,
}

impl StatusUpdate {
    /// Change only the status.
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Set the attempt start time.
    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    /// Set the terminal time.
    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    /// Set the failure reason.
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// One row of the per-execution metrics stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    /// Task the metric belongs to
    pub task_id: TaskId,
    /// Task category
    pub category: String,
    /// Seconds from attempt start to outcome
    pub processing_time: f64,
    /// Seconds from admission to attempt start
    pub queue_wait_time: f64,
    /// Worker that ran the attempt
    pub worker_id: String,
    /// When the metric was recorded
    pub timestamp: DateTime<Utc>,
}

/// Trait that all store backends must implement
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace a task record, keyed by `task_id`.
    async fn persist_task(&self, task: &Task) -> SessionqResult<()>;

    /// Apply a partial status update.
    ///
    /// Fails with [`SessionqError::InvalidTransition`](crate::SessionqError::InvalidTransition)
    /// when the stored task is already completed or dead-lettered.
    async fn update_status(&self, task_id: &TaskId, update: StatusUpdate) -> SessionqResult<()>;

    /// Every unfinished task, ordered by `(priority, created_at)`, then by
    /// the order the records were first persisted.
    async fn restore_unfinished(&self) -> SessionqResult<Vec<Task>>;

    /// Number of unfinished tasks, as [`restore_unfinished`](Self::restore_unfinished)
    /// would return them.
    async fn count_unfinished(&self) -> SessionqResult<usize>;

    /// Persist a stats snapshot.
    async fn snapshot_stats(&self, snapshot: &StatsSnapshot) -> SessionqResult<()>;

    /// Append a performance metric.
    async fn record_metric(&self, metric: &PerformanceMetric) -> SessionqResult<()>;

    /// Get a task by ID
    async fn get_task(&self, task_id: &TaskId) -> SessionqResult<Option<Task>>;

    /// Tasks with the given status, newest first.
    async fn tasks_by_status(
        &self,
        status: TaskStatus,
        limit: Option<usize>,
    ) -> SessionqResult<Vec<Task>>;

    /// Most recent stats snapshot, if any was written.
    async fn latest_stats(&self) -> SessionqResult<Option<StatsSnapshot>>;

    /// Health check for the store backend
    async fn health_check(&self) -> SessionqResult<()>;
}
