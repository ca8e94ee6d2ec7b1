//! Terminal storage for tasks that used up their retries.

use crate::task::Task;
use tokio::sync::RwLock;

/// Additive-only record of dead-lettered tasks, kept for manual inspection.
///
/// Nothing is ever retried from here; resubmitting requires a fresh admission.
#[derive(Debug, Default)]
pub struct DeadLetterSink {
    tasks: RwLock<Vec<Task>>,
}

impl DeadLetterSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task.
    pub async fn push(&self, task: Task) {
        self.tasks.write().await.push(task);
    }

    /// Number of dead-lettered tasks.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Whether nothing has been dead-lettered.
    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Copy of every dead-lettered task, oldest first.
    pub async fn list(&self) -> Vec<Task> {
        self.tasks.read().await.clone()
    }
}
