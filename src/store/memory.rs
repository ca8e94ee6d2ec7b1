//! In-memory store implementation for SessionQ.
//!
//! Records live in process memory, so nothing survives a restart of the
//! process. Cloning the store shares the same records, which lets tests
//! simulate a restart by handing one store to two queue managers.

use super::{PerformanceMetric, StatusUpdate, TaskStore};
use crate::error::{SessionqError, SessionqResult};
use crate::stats::StatsSnapshot;
use crate::task::{Task, TaskId, TaskStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A task record and the order in which it was first persisted.
#[derive(Debug)]
struct StoredTask {
    inserted: u64,
    task: Task,
}

#[derive(Debug, Default)]
struct TaskTable {
    rows: HashMap<TaskId, StoredTask>,
    next_insert: u64,
}

impl TaskTable {
    fn by_status(&self, keep: impl Fn(TaskStatus) -> bool) -> Vec<&StoredTask> {
        self.rows
            .values()
            .filter(|row| keep(row.task.status))
            .collect()
    }
}

/// In-memory store backend implementation
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    /// Task records indexed by task ID
    tasks: Arc<RwLock<TaskTable>>,
    /// Stats snapshots, oldest first
    snapshots: Arc<RwLock<Vec<StatsSnapshot>>>,
    /// Performance metrics, oldest first
    metrics: Arc<RwLock<Vec<PerformanceMetric>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded performance metric.
    pub async fn metrics(&self) -> Vec<PerformanceMetric> {
        self.metrics.read().await.clone()
    }

    /// Number of persisted stats snapshots.
    pub async fn snapshot_count(&self) -> usize {
        self.snapshots.read().await.len()
    }

    /// Number of task records.
    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.rows.len()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn persist_task(&self, task: &Task) -> SessionqResult<()> {
        let mut table = self.tasks.write().await;
        if let Some(existing) = table.rows.get_mut(&task.task_id) {
            if existing.task.status.is_terminal() {
                return Err(SessionqError::InvalidTransition {
                    task_id: task.task_id.clone(),
                    from: existing.task.status,
                    to: task.status,
                });
            }
            existing.task = task.clone();
            return Ok(());
        }

        let inserted = table.next_insert;
        table.next_insert += 1;
        table.rows.insert(
            task.task_id.clone(),
            StoredTask {
                inserted,
                task: task.clone(),
            },
        );
        Ok(())
    }

    async fn update_status(&self, task_id: &TaskId, update: StatusUpdate) -> SessionqResult<()> {
        let mut table = self.tasks.write().await;

        let task = table
            .rows
            .get_mut(task_id)
            .map(|row| &mut row.task)
            .ok_or_else(|| SessionqError::store(format!("task {task_id} not found")))?;

        if task.status.is_terminal() {
            return Err(SessionqError::InvalidTransition {
                task_id: task_id.clone(),
                from: task.status,
                to: update.status,
            });
        }

        task.status = update.status;
        if let Some(started_at) = update.started_at {
            task.started_at = Some(started_at);
        }
        if let Some(completed_at) = update.completed_at {
            task.completed_at = Some(completed_at);
        }
        if let Some(error_message) = update.error_message {
            task.error_message = Some(error_message);
        }

        tracing::trace!("Task {} is now {}", task_id, task.status);
        Ok(())
    }

    async fn restore_unfinished(&self) -> SessionqResult<Vec<Task>> {
        let table = self.tasks.read().await;
        let mut rows = table.by_status(|status| status.is_unfinished());

        rows.sort_by(|a, b| {
            a.task
                .priority
                .cmp(&b.task.priority)
                .then_with(|| a.task.created_at.cmp(&b.task.created_at))
                .then_with(|| a.inserted.cmp(&b.inserted))
        });
        Ok(rows.into_iter().map(|row| row.task.clone()).collect())
    }

    async fn count_unfinished(&self) -> SessionqResult<usize> {
        let table = self.tasks.read().await;
        Ok(table.by_status(|status| status.is_unfinished()).len())
    }

    async fn snapshot_stats(&self, snapshot: &StatsSnapshot) -> SessionqResult<()> {
        self.snapshots.write().await.push(snapshot.clone());
        Ok(())
    }

    async fn record_metric(&self, metric: &PerformanceMetric) -> SessionqResult<()> {
        self.metrics.write().await.push(metric.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> SessionqResult<Option<Task>> {
        let table = self.tasks.read().await;
        Ok(table.rows.get(task_id).map(|row| row.task.clone()))
    }

    async fn tasks_by_status(
        &self,
        status: TaskStatus,
        limit: Option<usize>,
    ) -> SessionqResult<Vec<Task>> {
        let table = self.tasks.read().await;
        let mut rows = table.by_status(|candidate| candidate == status);

        // Newest first
        rows.sort_by(|a, b| {
            b.task
                .created_at
                .cmp(&a.task.created_at)
                .then_with(|| b.inserted.cmp(&a.inserted))
        });

        let limit = limit.unwrap_or(rows.len());
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|row| row.task.clone())
            .collect())
    }

    async fn latest_stats(&self) -> SessionqResult<Option<StatsSnapshot>> {
        Ok(self.snapshots.read().await.last().cloned())
    }

    async fn health_check(&self) -> SessionqResult<()> {
        let task_count = self.tasks.read().await.rows.len();
        tracing::debug!("Store health check: {} task records", task_count);
        Ok(())
    }
}
