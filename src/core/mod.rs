//! The queue manager and the engine behind it.
//!
//! [`QueueManager`] is the entry point of SessionQ. It admits tasks, restores
//! unfinished work from the store when it is created and owns the
//! [`QueueEngine`] while workers are running.

use crate::config::SessionqConfig;
use crate::error::{SessionqError, SessionqResult};
use crate::executor::Executor;
use crate::queue::{DeadLetterSink, PendingQueue};
use crate::rate_limit::RateLimiter;
use crate::stats::{QueueStats, StatsCollector};
use crate::store::{StatusUpdate, TaskStore};
use crate::task::{NewTask, Task, TaskId, TaskStatus, generate_task_id};
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

pub mod engine;
pub mod retry;
pub mod worker;

pub use engine::{QueueEngine, ShutdownReport};
pub use retry::{RetryController, RetryDecision};
pub use worker::{ExecutionResult, Worker, WorkerExit, WorkerPool};

/// State shared by the manager, the workers and the monitor.
pub(crate) struct QueueContext {
    pub config: SessionqConfig,
    pub store: Arc<dyn TaskStore>,
    pub executor: Arc<dyn Executor>,
    pub queue: PendingQueue,
    pub stats: StatsCollector,
    pub dead_letters: DeadLetterSink,
    pub retry: RetryController,
}

/// Read-only view of the queue, as returned by [`QueueManager::status`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Pending tasks, including retries waiting out a delay
    pub queue_size: usize,
    /// Tasks dead-lettered by this process
    pub dead_letter_size: usize,
    /// Workers currently running their loop
    pub active_workers: usize,
    /// Aggregate counters
    pub stats: QueueStats,
    /// Admissions inside the current window, per category
    pub rate_limiter: HashMap<String, usize>,
}

/// Serializes admissions and keeps `created_at` strictly increasing.
///
/// Stores keep microseconds, so every tick is at least one microsecond past
/// the previous one and admission order survives a restart.
#[derive(Debug)]
struct AdmissionClock {
    last_created_at: DateTime<Utc>,
    sequence: u64,
}

impl AdmissionClock {
    fn tick(&mut self) -> (DateTime<Utc>, u64) {
        let now = Utc::now().trunc_subsecs(6);
        let now = if now <= self.last_created_at {
            self.last_created_at + TimeDelta::microseconds(1)
        } else {
            now
        };
        self.last_created_at = now;
        self.sequence += 1;
        (now, self.sequence)
    }
}

/// The main SessionQ queue manager.
///
/// # Examples
///
/// ```rust,no_run
/// use sessionq::prelude::*;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> SessionqResult<()> {
///     let manager = QueueManager::new(
///         SessionqConfig::default(),
///         Arc::new(MemoryStore::new()),
///         Arc::new(TmuxExecutor::new("claude")),
///     )
///     .await?;
///
///     manager.start().await?;
///     let task_id = manager
///         .add_task(NewTask::new("cargo test").with_priority(2))
///         .await?;
///     println!("queued {task_id}");
///
///     manager.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct QueueManager {
    ctx: Arc<QueueContext>,
    limiter: RateLimiter,
    admission: Mutex<AdmissionClock>,
    accepting: AtomicBool,
    /// Set by [`QueueManager::detached`]; capacity is then counted in the store.
    detached: bool,
    engine: RwLock<Option<QueueEngine>>,
}

impl QueueManager {
    /// Create a manager and restore unfinished tasks from `store`.
    ///
    /// Tasks found `processing` or `failed_retrying` were interrupted by the
    /// previous run; they are put back to `queued` and will run again.
    pub async fn new(
        config: SessionqConfig,
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn Executor>,
    ) -> SessionqResult<Self> {
        let mut manager = Self::detached(config, store, executor)?;
        manager.detached = false;
        manager.restore().await;
        Ok(manager)
    }

    /// Create a manager without touching the store.
    ///
    /// Suitable for a process that only admits tasks while another one runs
    /// the workers: restoring would re-queue the other process's in-flight
    /// tasks. The capacity check counts unfinished tasks in the store, since
    /// the in-memory queue of a detached manager only holds its own admissions.
    pub fn detached(
        config: SessionqConfig,
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn Executor>,
    ) -> SessionqResult<Self> {
        config
            .validate()
            .map_err(|errors| SessionqError::config(errors.join("; ")))?;

        let limiter = RateLimiter::new(&config.rate_limit);
        let retry = RetryController::new(config.retry.clone());

        Ok(Self {
            ctx: Arc::new(QueueContext {
                config,
                store,
                executor,
                queue: PendingQueue::new(),
                stats: StatsCollector::new(),
                dead_letters: DeadLetterSink::new(),
                retry,
            }),
            limiter,
            admission: Mutex::new(AdmissionClock {
                last_created_at: DateTime::<Utc>::MIN_UTC,
                sequence: 0,
            }),
            accepting: AtomicBool::new(true),
            detached: true,
            engine: RwLock::new(None),
        })
    }

    async fn restore(&self) {
        let tasks = match self.ctx.store.restore_unfinished().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!("Failed to restore unfinished tasks: {}", e);
                return;
            }
        };

        let restored = tasks.len();
        let mut clock = self.admission.lock().await;
        for mut task in tasks {
            if task.status != TaskStatus::Queued {
                tracing::warn!(
                    "Task {} was interrupted while {}, re-queueing",
                    task.task_id,
                    task.status
                );
                task.status = TaskStatus::Queued;
                if let Err(e) = self
                    .ctx
                    .store
                    .update_status(&task.task_id, StatusUpdate::new(TaskStatus::Queued))
                    .await
                {
                    tracing::error!("Failed to re-queue task {}: {}", task.task_id, e);
                }
            }

            clock.last_created_at = clock.last_created_at.max(task.created_at);
            let size = self.ctx.queue.push(task).await;
            self.ctx.stats.observe_queue_size(size).await;
        }

        if restored > 0 {
            tracing::info!("Restored {} unfinished tasks from the store", restored);
        }
    }

    /// Admit a task.
    ///
    /// Rejections leave no trace except the `rate_limited` counter, and only
    /// capacity and rate-limit rejections touch that.
    pub async fn add_task(&self, new_task: NewTask) -> SessionqResult<TaskId> {
        new_task.validate()?;

        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SessionqError::ShuttingDown);
        }

        let mut clock = self.admission.lock().await;
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SessionqError::ShuttingDown);
        }

        let max_size = self.ctx.config.queue.max_queue_size;
        if self.pending_count().await >= max_size {
            self.ctx.stats.record_rejection().await;
            tracing::warn!("Queue is full ({}), rejecting task", max_size);
            return Err(SessionqError::AtCapacity { max_size });
        }

        if !self.limiter.check(&new_task.category).await {
            self.ctx.stats.record_rejection().await;
            tracing::warn!("Rate limit exceeded for category {}", new_task.category);
            return Err(SessionqError::RateLimited {
                category: new_task.category,
                limit: self.limiter.limit(),
            });
        }

        let (created_at, sequence) = clock.tick();
        let task_id = generate_task_id(&new_task.command, new_task.priority, created_at, sequence);
        let task = new_task.into_task(task_id.clone(), created_at);

        if let Err(e) = self.ctx.store.persist_task(&task).await {
            tracing::error!("Failed to persist task {}: {}", task_id, e);
        }

        tracing::info!(
            "Added task {} with priority {}: {}",
            task_id,
            task.priority,
            task.command_preview()
        );

        let size = self.ctx.queue.push(task).await;
        self.ctx.stats.observe_queue_size(size).await;
        Ok(task_id)
    }

    async fn pending_count(&self) -> usize {
        if !self.detached {
            return self.ctx.queue.len().await;
        }

        match self.ctx.store.count_unfinished().await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!("Failed to count unfinished tasks: {}", e);
                self.ctx.queue.len().await
            }
        }
    }

    /// Start the workers and the stats monitor.
    pub async fn start(&self) -> SessionqResult<()> {
        let mut engine_guard = self.engine.write().await;
        if engine_guard.is_some() {
            return Err(SessionqError::AlreadyRunning);
        }

        let mut engine = QueueEngine::new(Arc::clone(&self.ctx));
        engine.start().await?;
        *engine_guard = Some(engine);
        self.accepting.store(true, Ordering::SeqCst);

        tracing::info!(
            "Queue started with {} workers",
            self.ctx.config.workers.num_workers
        );
        Ok(())
    }

    /// Stop admissions and drain the queue within the configured grace period.
    pub async fn shutdown(&self) -> SessionqResult<ShutdownReport> {
        self.shutdown_within(self.ctx.config.workers.shutdown_timeout())
            .await
    }

    /// Stop admissions and drain the queue, force-stopping workers after `grace`.
    pub async fn shutdown_within(&self, grace: Duration) -> SessionqResult<ShutdownReport> {
        let mut engine_guard = self.engine.write().await;
        let mut engine = engine_guard.take().ok_or(SessionqError::NotRunning)?;

        self.accepting.store(false, Ordering::SeqCst);
        // Let an admission already past its check finish pushing.
        drop(self.admission.lock().await);
        let report = engine.shutdown(grace).await;

        tracing::info!("Queue stopped");
        Ok(report)
    }

    /// Current queue size, counters and rate-limiter windows.
    pub async fn status(&self) -> QueueStatus {
        let queue_size = self.ctx.queue.len().await;
        let mut stats = self.ctx.stats.snapshot().await;
        stats.current_queue_size = queue_size;

        let active_workers = match self.engine.read().await.as_ref() {
            Some(engine) => engine.active_workers(),
            None => 0,
        };

        QueueStatus {
            queue_size,
            dead_letter_size: self.ctx.dead_letters.len().await,
            active_workers,
            stats,
            rate_limiter: self.limiter.snapshot().await,
        }
    }

    /// Look up a task record in the store.
    pub async fn get_task(&self, task_id: &TaskId) -> SessionqResult<Option<Task>> {
        self.ctx.store.get_task(task_id).await
    }

    /// Tasks dead-lettered by this process, oldest first.
    pub async fn dead_letters(&self) -> Vec<Task> {
        self.ctx.dead_letters.list().await
    }

    /// Pending tasks in the order workers will take them.
    pub async fn pending_tasks(&self) -> Vec<Task> {
        self.ctx.queue.snapshot().await
    }

    /// Whether workers are running.
    pub async fn is_running(&self) -> bool {
        self.engine.read().await.is_some()
    }

    /// Check the store and, when running, that some worker is alive.
    pub async fn health_check(&self) -> SessionqResult<()> {
        self.ctx.store.health_check().await?;

        if let Some(engine) = self.engine.read().await.as_ref() {
            let active = engine.active_workers();
            let expected = self.ctx.config.workers.num_workers;
            if active == 0 {
                return Err(SessionqError::config("No active workers"));
            }
            if active < expected {
                tracing::warn!("Only {}/{} workers active", active, expected);
            }
        }

        Ok(())
    }

    /// Get the configuration used by this manager.
    pub fn config(&self) -> &SessionqConfig {
        &self.ctx.config
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        if let Ok(engine) = self.engine.try_read() {
            if engine.is_some() {
                tracing::warn!(
                    "QueueManager dropped while running. Call shutdown() for a graceful stop."
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, RateLimitConfig, RetryPolicy, WorkerConfig};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    /// Records every command and answers with a fixed result.
    #[derive(Default)]
    struct RecordingExecutor {
        commands: std::sync::Mutex<Vec<String>>,
        fail: bool,
        delay: Duration,
    }

    impl RecordingExecutor {
        fn succeeding() -> Self {
            Self::default()
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        async fn execute(&self, command: &str) -> SessionqResult<bool> {
            self.commands.lock().unwrap().push(command.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(!self.fail)
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyExecutor {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl Executor for FlakyExecutor {
        async fn execute(&self, _command: &str) -> SessionqResult<bool> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(SessionqError::execution_msg("session busy"))
            } else {
                Ok(true)
            }
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl Executor for PanickingExecutor {
        async fn execute(&self, command: &str) -> SessionqResult<bool> {
            panic!("cannot run {command}");
        }
    }

    async fn manager_with(
        config: SessionqConfig,
        store: &MemoryStore,
        executor: Arc<dyn Executor>,
    ) -> QueueManager {
        QueueManager::new(config, Arc::new(store.clone()), executor)
            .await
            .unwrap()
    }

    async fn wait_for_processed(manager: &QueueManager, expected: u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while manager.status().await.stats.total_processed < expected {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {expected} processed tasks"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_add_task_persists_queued_record() {
        let store = MemoryStore::new();
        let manager =
            manager_with(SessionqConfig::testing(), &store, Arc::new(RecordingExecutor::succeeding()))
                .await;

        let task_id = assert_ok!(
            manager
                .add_task(NewTask::new("echo hi").with_priority(3).with_category("build"))
                .await
        );

        let stored = manager.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(stored.priority, 3);
        assert_eq!(stored.category, "build");
        assert_eq!(stored.retry_count, 0);

        let status = manager.status().await;
        assert_eq!(status.queue_size, 1);
        assert_eq!(status.stats.peak_queue_size, 1);
        assert_eq!(status.rate_limiter.get("build"), Some(&1));
    }

    #[tokio::test]
    async fn test_invalid_priority_is_rejected_without_side_effects() {
        let store = MemoryStore::new();
        let manager =
            manager_with(SessionqConfig::testing(), &store, Arc::new(RecordingExecutor::succeeding()))
                .await;

        for priority in [0, 11] {
            let result = manager
                .add_task(NewTask::new("echo hi").with_priority(priority))
                .await;
            assert!(matches!(result, Err(SessionqError::InvalidPriority { .. })));
        }

        assert_eq!(store.task_count().await, 0);
        assert_eq!(manager.status().await.stats.rate_limited, 0);
    }

    #[tokio::test]
    async fn test_capacity_rejection_leaves_no_record() {
        let store = MemoryStore::new();
        let config = SessionqConfig {
            queue: QueueConfig::default().with_max_size(2),
            ..SessionqConfig::testing()
        };
        let manager = manager_with(config, &store, Arc::new(RecordingExecutor::succeeding())).await;

        assert_ok!(manager.add_task(NewTask::new("a")).await);
        assert_ok!(manager.add_task(NewTask::new("b")).await);
        let rejected = manager.add_task(NewTask::new("c")).await;

        assert!(matches!(rejected, Err(SessionqError::AtCapacity { max_size: 2 })));
        assert_eq!(store.task_count().await, 2);

        let status = manager.status().await;
        assert_eq!(status.queue_size, 2);
        assert_eq!(status.stats.rate_limited, 1);
    }

    #[tokio::test]
    async fn test_detached_managers_share_store_capacity() {
        let store = MemoryStore::new();
        let config = SessionqConfig {
            queue: QueueConfig::default().with_max_size(2),
            ..SessionqConfig::testing()
        };

        let mut admitted = 0;
        let mut rejected = 0;
        for i in 0..5 {
            // One short-lived manager per admission, like repeated `sessionq add` calls.
            let manager = QueueManager::detached(
                config.clone(),
                Arc::new(store.clone()),
                Arc::new(RecordingExecutor::succeeding()),
            )
            .unwrap();
            match manager.add_task(NewTask::new(format!("echo {i}"))).await {
                Ok(_) => admitted += 1,
                Err(SessionqError::AtCapacity { max_size: 2 }) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(admitted, 2);
        assert_eq!(rejected, 3);
        assert_eq!(store.count_unfinished().await.unwrap(), 2);
    }

    #[test]
    fn test_admission_clock_is_strictly_increasing() {
        let ahead = Utc::now() + TimeDelta::hours(1);
        let mut clock = AdmissionClock {
            last_created_at: ahead,
            sequence: 0,
        };

        let (first, first_seq) = clock.tick();
        let (second, second_seq) = clock.tick();
        assert_eq!(first, ahead + TimeDelta::microseconds(1));
        assert_eq!(second, first + TimeDelta::microseconds(1));
        assert!(second_seq > first_seq);

        let mut clock = AdmissionClock {
            last_created_at: DateTime::<Utc>::MIN_UTC,
            sequence: 0,
        };
        let ticks: Vec<DateTime<Utc>> = (0..100).map(|_| clock.tick().0).collect();
        assert!(ticks.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(ticks.iter().all(|t| t.timestamp_subsec_nanos() % 1_000 == 0));
    }

    #[tokio::test]
    async fn test_admission_waiting_on_lock_sees_shutdown() {
        let store = MemoryStore::new();
        let manager = Arc::new(
            manager_with(SessionqConfig::testing(), &store, Arc::new(RecordingExecutor::succeeding()))
                .await,
        );
        manager.start().await.unwrap();

        let clock = manager.admission.lock().await;
        let adding = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.add_task(NewTask::new("late")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopping = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(clock);

        let added = adding.await.unwrap();
        assert!(matches!(added, Err(SessionqError::ShuttingDown)));
        let report = stopping.await.unwrap().unwrap();
        assert_eq!(report.abandoned, 0);
        assert_eq!(store.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_only_the_excess() {
        let store = MemoryStore::new();
        let config = SessionqConfig {
            rate_limit: RateLimitConfig {
                per_second: 3,
                ..Default::default()
            },
            ..SessionqConfig::testing()
        };
        let manager = manager_with(config, &store, Arc::new(RecordingExecutor::succeeding())).await;

        let mut accepted = 0;
        let mut limited = 0;
        for i in 0..5 {
            match manager
                .add_task(NewTask::new(format!("echo {i}")).with_category("hooks"))
                .await
            {
                Ok(_) => accepted += 1,
                Err(SessionqError::RateLimited { category, limit }) => {
                    assert_eq!(category, "hooks");
                    assert_eq!(limit, 3);
                    limited += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!((accepted, limited), (3, 2));
        assert_ok!(manager.add_task(NewTask::new("other").with_category("ci")).await);
        assert_eq!(manager.status().await.stats.rate_limited, 2);
        assert_eq!(store.task_count().await, 4);
    }

    #[tokio::test]
    async fn test_tasks_run_in_priority_order() {
        let store = MemoryStore::new();
        let executor = Arc::new(RecordingExecutor::succeeding());
        let manager = manager_with(SessionqConfig::testing(), &store, executor.clone()).await;

        for priority in [3, 1, 2] {
            manager
                .add_task(NewTask::new(format!("p{priority}")).with_priority(priority))
                .await
                .unwrap();
        }

        let pending: Vec<u8> = manager
            .pending_tasks()
            .await
            .iter()
            .map(|task| task.priority)
            .collect();
        assert_eq!(pending, vec![1, 2, 3]);

        manager.start().await.unwrap();
        wait_for_processed(&manager, 3).await;
        manager.shutdown().await.unwrap();

        assert_eq!(executor.commands(), vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn test_worker_pool_processes_every_task() {
        let store = MemoryStore::new();
        let config = SessionqConfig {
            workers: WorkerConfig::with_workers(3)
                .with_task_timeout(5)
                .with_poll_interval(20),
            ..SessionqConfig::testing()
        };
        let executor = Arc::new(RecordingExecutor::slow(Duration::from_millis(20)));
        let manager = manager_with(config, &store, executor.clone()).await;

        manager.start().await.unwrap();
        for i in 0..10 {
            manager.add_task(NewTask::new(format!("job {i}"))).await.unwrap();
        }
        wait_for_processed(&manager, 10).await;

        let report = manager.shutdown().await.unwrap();
        assert!(report.drained);

        let stats = manager.status().await.stats;
        assert_eq!(stats.successful, 10);
        assert_eq!(stats.failed, 0);
        assert_eq!(executor.commands().len(), 10);
        assert_eq!(store.metrics().await.len(), 10);
        assert_eq!(
            store
                .tasks_by_status(TaskStatus::Completed, None)
                .await
                .unwrap()
                .len(),
            10
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_the_task() {
        let store = MemoryStore::new();
        let executor = Arc::new(RecordingExecutor::failing());
        let manager = manager_with(SessionqConfig::testing(), &store, executor.clone()).await;

        let task_id = manager
            .add_task(NewTask::new("false").with_priority(5).with_max_retries(2))
            .await
            .unwrap();
        manager.start().await.unwrap();
        wait_for_processed(&manager, 1).await;
        manager.shutdown().await.unwrap();

        assert_eq!(executor.commands().len(), 3);

        let dead = manager.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].task_id, task_id);
        assert_eq!(dead[0].retry_count, 2);
        assert_eq!(dead[0].priority, 7);

        let stored = manager.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::DeadLetter);
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.error_message.as_deref(), Some("Command execution failed"));

        let stats = manager.status().await.stats;
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.successful, 0);
        assert_eq!(stats.total_processed, 1);
        assert_eq!(manager.status().await.dead_letter_size, 1);
    }

    #[tokio::test]
    async fn test_retry_demotes_priority_then_succeeds() {
        let store = MemoryStore::new();
        let executor = Arc::new(FlakyExecutor {
            calls: AtomicUsize::new(0),
            failures: 1,
        });
        let manager = manager_with(SessionqConfig::testing(), &store, executor).await;

        let task_id = manager
            .add_task(NewTask::new("flaky").with_priority(5))
            .await
            .unwrap();
        manager.start().await.unwrap();
        wait_for_processed(&manager, 1).await;
        manager.shutdown().await.unwrap();

        let stored = manager.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.priority, 6);

        let stats = manager.status().await.stats;
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.successful, 1);
        assert!(manager.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_delayed_retry_waits_before_running_again() {
        let store = MemoryStore::new();
        let config = SessionqConfig {
            retry: RetryPolicy::delayed(200),
            ..SessionqConfig::testing()
        };
        let executor = Arc::new(FlakyExecutor {
            calls: AtomicUsize::new(0),
            failures: 1,
        });
        let manager = manager_with(config, &store, executor).await;

        let started = Instant::now();
        manager.add_task(NewTask::new("flaky")).await.unwrap();
        manager.start().await.unwrap();
        wait_for_processed(&manager, 1).await;
        manager.shutdown().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(manager.status().await.stats.successful, 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let store = MemoryStore::new();
        let config = SessionqConfig {
            workers: WorkerConfig::with_workers(1)
                .with_task_timeout(1)
                .with_poll_interval(20),
            ..SessionqConfig::testing()
        };
        let executor = Arc::new(RecordingExecutor::slow(Duration::from_secs(30)));
        let manager = manager_with(config, &store, executor).await;

        let task_id = manager
            .add_task(NewTask::new("sleep 30").with_max_retries(0))
            .await
            .unwrap();
        manager.start().await.unwrap();
        wait_for_processed(&manager, 1).await;
        manager.shutdown().await.unwrap();

        let stored = manager.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::DeadLetter);
        assert!(stored.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_panicking_executor_counts_as_failure() {
        let store = MemoryStore::new();
        let manager =
            manager_with(SessionqConfig::testing(), &store, Arc::new(PanickingExecutor)).await;

        let task_id = manager
            .add_task(NewTask::new("boom").with_max_retries(0))
            .await
            .unwrap();
        manager.start().await.unwrap();
        wait_for_processed(&manager, 1).await;

        // The worker survives the panic.
        assert_eq!(manager.status().await.active_workers, 1);
        manager.shutdown().await.unwrap();

        let stored = manager.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::DeadLetter);
        assert!(stored.error_message.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_restart_recovers_unfinished_tasks() {
        let store = MemoryStore::new();

        let (interrupted, waiting) = {
            let first =
                manager_with(SessionqConfig::testing(), &store, Arc::new(RecordingExecutor::succeeding()))
                    .await;
            let interrupted = first.add_task(NewTask::new("interrupted").with_priority(2)).await.unwrap();
            let waiting = first.add_task(NewTask::new("waiting").with_priority(4)).await.unwrap();
            store
                .update_status(
                    &interrupted,
                    StatusUpdate::new(TaskStatus::Processing).started_at(Utc::now()),
                )
                .await
                .unwrap();
            (interrupted, waiting)
        };

        let executor = Arc::new(RecordingExecutor::succeeding());
        let second = manager_with(SessionqConfig::testing(), &store, executor.clone()).await;

        assert_eq!(second.status().await.queue_size, 2);
        let stored = second.get_task(&interrupted).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);

        let pending: Vec<TaskId> = second
            .pending_tasks()
            .await
            .into_iter()
            .map(|task| task.task_id)
            .collect();
        assert_eq!(pending, vec![interrupted.clone(), waiting.clone()]);

        second.start().await.unwrap();
        wait_for_processed(&second, 2).await;
        second.shutdown().await.unwrap();

        assert_eq!(executor.commands(), vec!["interrupted", "waiting"]);
        assert!(store.restore_unfinished().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detached_manager_does_not_restore() {
        let store = MemoryStore::new();
        let first =
            manager_with(SessionqConfig::testing(), &store, Arc::new(RecordingExecutor::succeeding()))
                .await;
        let task_id = first.add_task(NewTask::new("running elsewhere")).await.unwrap();
        store
            .update_status(&task_id, StatusUpdate::new(TaskStatus::Processing))
            .await
            .unwrap();

        let detached = QueueManager::detached(
            SessionqConfig::testing(),
            Arc::new(store.clone()),
            Arc::new(RecordingExecutor::succeeding()),
        )
        .unwrap();

        assert_eq!(detached.status().await.queue_size, 0);
        let stored = store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_tasks() {
        let store = MemoryStore::new();
        let executor = Arc::new(RecordingExecutor::slow(Duration::from_millis(30)));
        let manager = manager_with(SessionqConfig::testing(), &store, executor.clone()).await;

        for i in 0..5 {
            manager.add_task(NewTask::new(format!("job {i}"))).await.unwrap();
        }
        manager.start().await.unwrap();

        let report = manager.shutdown().await.unwrap();
        assert_eq!(
            report,
            ShutdownReport {
                drained: true,
                abandoned: 0
            }
        );
        assert_eq!(executor.commands().len(), 5);
        assert_eq!(manager.status().await.stats.successful, 5);
        assert!(store.snapshot_count().await >= 1);
        assert_eq!(
            store.latest_stats().await.unwrap().unwrap().stats.successful,
            5
        );
    }

    #[tokio::test]
    async fn test_grace_period_leaves_in_flight_work_recoverable() {
        let store = MemoryStore::new();
        let config = SessionqConfig {
            workers: WorkerConfig::with_workers(1)
                .with_task_timeout(30)
                .with_poll_interval(20),
            ..SessionqConfig::testing()
        };
        let executor = Arc::new(RecordingExecutor::slow(Duration::from_secs(30)));
        let manager = manager_with(config, &store, executor.clone()).await;

        let in_flight = manager.add_task(NewTask::new("long").with_priority(1)).await.unwrap();
        let queued = manager.add_task(NewTask::new("next").with_priority(2)).await.unwrap();
        manager.start().await.unwrap();

        while executor.commands().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let report = manager
            .shutdown_within(Duration::from_millis(200))
            .await
            .unwrap();
        assert!(!report.drained);
        assert_eq!(report.abandoned, 1);

        let stored = store.get_task(&in_flight).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
        let stored = store.get_task(&queued).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(store.restore_unfinished().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let store = MemoryStore::new();
        let manager =
            manager_with(SessionqConfig::testing(), &store, Arc::new(RecordingExecutor::succeeding()))
                .await;

        assert!(!manager.is_running().await);
        assert!(matches!(
            manager.shutdown().await,
            Err(SessionqError::NotRunning)
        ));

        assert_ok!(manager.start().await);
        assert!(manager.is_running().await);
        assert!(matches!(
            manager.start().await,
            Err(SessionqError::AlreadyRunning)
        ));
        assert_ok!(manager.health_check().await);

        assert_ok!(manager.shutdown().await);
        assert!(!manager.is_running().await);

        let refused = manager.add_task(NewTask::new("late")).await;
        assert!(matches!(refused, Err(SessionqError::ShuttingDown)));
        assert_eq!(store.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = SessionqConfig {
            workers: WorkerConfig::with_workers(0),
            ..SessionqConfig::testing()
        };
        let result = QueueManager::detached(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingExecutor::succeeding()),
        );
        assert_err!(result.as_ref().map(|_| ()));
        assert!(matches!(result, Err(SessionqError::ConfigError { .. })));
    }

    #[tokio::test]
    async fn test_status_serializes_to_json() {
        let store = MemoryStore::new();
        let manager =
            manager_with(SessionqConfig::testing(), &store, Arc::new(RecordingExecutor::succeeding()))
                .await;
        manager.add_task(NewTask::new("echo")).await.unwrap();

        let value = serde_json::to_value(manager.status().await).unwrap();
        assert_eq!(value["queue_size"], 1);
        assert_eq!(value["active_workers"], 0);
        assert_eq!(value["stats"]["peak_queue_size"], 1);
        assert_eq!(value["rate_limiter"]["default"], 1);
    }

    #[cfg(feature = "sqlite-store")]
    #[tokio::test]
    async fn test_restart_recovers_from_sqlite_file() {
        use crate::store::SqliteStore;

        let path = std::env::temp_dir().join(format!(
            "sessionq-{}-{}.db",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let url = format!("sqlite://{}", path.display());

        let task_id = {
            let store = SqliteStore::connect(&url, 1).await.unwrap();
            let first = QueueManager::new(
                SessionqConfig::testing(),
                Arc::new(store),
                Arc::new(RecordingExecutor::succeeding()),
            )
            .await
            .unwrap();
            first.add_task(NewTask::new("persisted").with_priority(3)).await.unwrap()
        };

        let store = SqliteStore::connect(&url, 1).await.unwrap();
        let executor = Arc::new(RecordingExecutor::succeeding());
        let second = QueueManager::new(SessionqConfig::testing(), Arc::new(store), executor.clone())
            .await
            .unwrap();
        assert_eq!(second.status().await.queue_size, 1);

        second.start().await.unwrap();
        wait_for_processed(&second, 1).await;
        second.shutdown().await.unwrap();

        let stored = second.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(executor.commands(), vec!["persisted"]);

        let _ = std::fs::remove_file(&path);
    }
}
