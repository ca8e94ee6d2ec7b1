//! Worker implementation for SessionQ.
//!
//! Each worker pulls the most urgent task from the shared queue, hands its
//! command to the executor under a timeout and records the outcome. Failures
//! go through the [`RetryController`](super::retry::RetryController).

use super::QueueContext;
use super::retry::RetryDecision;
use crate::error::SessionqError;
use crate::stats::Outcome;
use crate::store::{PerformanceMetric, StatusUpdate};
use crate::task::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Result of one execution attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Executor reported success
    Success,
    /// Executor reported failure
    Failed(String),
    /// Execution exceeded the task timeout
    TimedOut,
    /// Executor panicked
    Panicked(String),
}

impl ExecutionResult {
    fn failure_message(&self, timeout_secs: u64) -> Option<String> {
        match self {
            Self::Success => None,
            Self::Failed(message) => Some(message.clone()),
            Self::TimedOut => Some(SessionqError::Timeout { timeout_secs }.to_string()),
            Self::Panicked(message) => Some(format!("Executor panicked: {message}")),
        }
    }
}

/// Aborts the execution if the worker itself is aborted mid-task.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Why a worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Queue was empty while draining for shutdown
    Drained,
    /// Stop was requested
    Stopped,
}

/// Shutdown signals shared by every worker of a pool.
#[derive(Debug, Default)]
pub(crate) struct WorkerSignals {
    /// Finish what is queued, then exit
    pub draining: AtomicBool,
    /// Exit before taking another task
    pub stop: AtomicBool,
}

/// Individual worker that processes tasks
pub struct Worker {
    id: String,
    ctx: Arc<QueueContext>,
    signals: Arc<WorkerSignals>,
}

impl Worker {
    /// Create a new worker with the given ID
    pub(crate) fn new(id: String, ctx: Arc<QueueContext>, signals: Arc<WorkerSignals>) -> Self {
        Self { id, ctx, signals }
    }

    /// Run the worker loop
    pub async fn run(&self) -> WorkerExit {
        tracing::info!("Worker {} started", self.id);
        let poll_interval = self.ctx.config.workers.poll_interval();

        let exit = loop {
            if self.signals.stop.load(Ordering::Relaxed) {
                break WorkerExit::Stopped;
            }

            match self.ctx.queue.pop_timeout(poll_interval).await {
                Some(task) => self.process_task(task).await,
                None => {
                    if self.signals.draining.load(Ordering::Relaxed)
                        && self.ctx.queue.is_empty().await
                    {
                        break WorkerExit::Drained;
                    }
                }
            }
        };

        tracing::info!("Worker {} stopped ({:?})", self.id, exit);
        exit
    }

    /// Process a single task from dequeue to outcome
    pub(crate) async fn process_task(&self, mut task: Task) {
        let started_at = Utc::now();
        let clock = Instant::now();

        tracing::info!(
            "Worker {} processing task {}: {} (priority {}, attempt {})",
            self.id,
            task.task_id,
            task.command_preview(),
            task.priority,
            task.retry_count + 1
        );

        task.status = TaskStatus::Processing;
        task.started_at = Some(started_at);
        if let Err(e) = self
            .ctx
            .store
            .update_status(
                &task.task_id,
                StatusUpdate::new(TaskStatus::Processing).started_at(started_at),
            )
            .await
        {
            tracing::error!("Failed to mark task {} as processing: {}", task.task_id, e);
        }

        let result = self.execute(&task).await;
        let processing_time = clock.elapsed();

        match result.failure_message(self.ctx.config.workers.task_timeout_secs) {
            None => {
                self.complete(task, started_at, processing_time).await;
            }
            Some(error) => {
                tracing::error!("Task {} failed: {}", task.task_id, error);
                self.handle_failure(task, error, started_at, processing_time)
                    .await;
            }
        }
    }

    /// Execute a single command under the task timeout
    async fn execute(&self, task: &Task) -> ExecutionResult {
        let timeout_duration = self.ctx.config.workers.task_timeout();
        let executor = Arc::clone(&self.ctx.executor);
        let command = task.command.clone();

        let mut execution = AbortOnDrop(tokio::spawn(async move {
            executor.execute(&command).await
        }));

        match timeout(timeout_duration, &mut execution.0).await {
            Ok(Ok(Ok(true))) => ExecutionResult::Success,
            Ok(Ok(Ok(false))) => ExecutionResult::Failed("Command execution failed".to_string()),
            Ok(Ok(Err(error))) => ExecutionResult::Failed(error.to_string()),
            Ok(Err(join_error)) => ExecutionResult::Panicked(join_error.to_string()),
            Err(_) => {
                tracing::error!(
                    "Task {} timed out after {:?}",
                    task.task_id,
                    timeout_duration
                );
                ExecutionResult::TimedOut
            }
        }
    }

    async fn complete(&self, mut task: Task, started_at: DateTime<Utc>, processing_time: Duration) {
        let completed_at = Utc::now();
        task.status = TaskStatus::Completed;
        task.completed_at = Some(completed_at);

        if let Err(e) = self
            .ctx
            .store
            .update_status(
                &task.task_id,
                StatusUpdate::new(TaskStatus::Completed).completed_at(completed_at),
            )
            .await
        {
            tracing::error!("Failed to mark task {} as completed: {}", task.task_id, e);
        }

        self.ctx
            .stats
            .record_outcome(Outcome::Completed, processing_time)
            .await;
        self.record_metric(&task, started_at, processing_time).await;

        tracing::info!(
            "Task {} completed successfully in {:?}",
            task.task_id,
            processing_time
        );
    }

    async fn handle_failure(
        &self,
        mut task: Task,
        error: String,
        started_at: DateTime<Utc>,
        processing_time: Duration,
    ) {
        match self.ctx.retry.decide(&task) {
            RetryDecision::Retry { delay } => {
                self.ctx.retry.prepare_retry(&mut task, &error);
                self.ctx.stats.record_retry().await;

                tracing::info!(
                    "Retrying task {} (attempt {}/{}, priority now {})",
                    task.task_id,
                    task.retry_count,
                    task.max_retries,
                    task.priority
                );

                if let Err(e) = self.ctx.store.persist_task(&task).await {
                    tracing::error!("Failed to persist retry of task {}: {}", task.task_id, e);
                }

                match delay {
                    Some(delay) => self.ctx.queue.push_delayed(task, delay).await,
                    None => self.ctx.queue.push(task).await,
                };
            }
            RetryDecision::DeadLetter => {
                let completed_at = Utc::now();
                task.status = TaskStatus::DeadLetter;
                task.completed_at = Some(completed_at);
                task.error_message = Some(error.clone());

                if let Err(e) = self
                    .ctx
                    .store
                    .update_status(
                        &task.task_id,
                        StatusUpdate::new(TaskStatus::DeadLetter)
                            .completed_at(completed_at)
                            .error(error),
                    )
                    .await
                {
                    tracing::error!("Failed to dead-letter task {}: {}", task.task_id, e);
                }

                self.ctx
                    .stats
                    .record_outcome(Outcome::DeadLettered, processing_time)
                    .await;
                self.record_metric(&task, started_at, processing_time).await;

                tracing::error!(
                    "Task {} moved to dead letter queue after {} retries",
                    task.task_id,
                    task.retry_count
                );
                self.ctx.dead_letters.push(task).await;
            }
        }
    }

    async fn record_metric(&self, task: &Task, started_at: DateTime<Utc>, processing_time: Duration) {
        let queue_wait_time = (started_at - task.created_at)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();

        let metric = PerformanceMetric {
            task_id: task.task_id.clone(),
            category: task.category.clone(),
            processing_time: processing_time.as_secs_f64(),
            queue_wait_time,
            worker_id: self.id.clone(),
            timestamp: Utc::now(),
        };

        if let Err(e) = self.ctx.store.record_metric(&metric).await {
            tracing::error!("Failed to store performance metrics: {}", e);
        }
    }
}

/// Manages the worker pool
#[derive(Clone)]
pub struct WorkerPool {
    /// Number of currently active workers
    active_workers: Arc<AtomicUsize>,
    /// Handles to all worker tasks
    worker_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    signals: Arc<WorkerSignals>,
    ctx: Arc<QueueContext>,
}

impl WorkerPool {
    /// Create an empty pool
    pub(crate) fn new(ctx: Arc<QueueContext>) -> Self {
        Self {
            active_workers: Arc::new(AtomicUsize::new(0)),
            worker_handles: Arc::new(Mutex::new(Vec::new())),
            signals: Arc::new(WorkerSignals::default()),
            ctx,
        }
    }

    /// Spawn a new worker
    pub async fn spawn_worker(&self, worker_number: usize) {
        let worker_id = format!("worker-{worker_number}");
        let active_workers = Arc::clone(&self.active_workers);
        let worker = Worker::new(
            worker_id.clone(),
            Arc::clone(&self.ctx),
            Arc::clone(&self.signals),
        );

        // Counted before the spawn so status never under-reports a fresh pool.
        active_workers.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(async move {
            let _exit = worker.run().await;
            active_workers.fetch_sub(1, Ordering::Relaxed);
        });

        self.worker_handles.lock().await.push(handle);
        tracing::debug!("Spawned worker {}", worker_id);
    }

    /// Let workers finish the queue, then wait up to `grace` for them to exit.
    ///
    /// Returns `true` when every worker exited on its own. Otherwise the
    /// remaining workers are aborted, leaving their in-flight tasks as the
    /// store last recorded them.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let mut handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        if handles.is_empty() {
            return true;
        }

        tracing::info!(
            "Draining queue with {} workers, grace period {:?}",
            handles.len(),
            grace
        );
        self.signals.draining.store(true, Ordering::Relaxed);

        let drained = timeout(grace, futures::future::join_all(handles.iter_mut()))
            .await
            .is_ok();

        if !drained {
            tracing::warn!(
                "Shutdown grace period of {:?} elapsed, stopping {} workers",
                grace,
                self.active_worker_count()
            );
            self.signals.stop.store(true, Ordering::Relaxed);
            for handle in &handles {
                handle.abort();
            }
            for handle in handles {
                let _ = handle.await;
            }
        }

        drained
    }

    /// Get the number of active workers
    pub fn active_worker_count(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }
}
