//! Configuration types for SessionQ.
//!
//! This module contains all configuration structures used throughout SessionQ,
//! including worker settings, admission limits, retry policy and persistence.

use crate::error::{SessionqError, SessionqResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for SessionQ.
///
/// # Examples
///
/// ```rust
/// use sessionq::config::{SessionqConfig, WorkerConfig};
///
/// // Use default configuration
/// let config = SessionqConfig::default();
///
/// // A single worker, for executors that accept one command at a time
/// let config = SessionqConfig {
///     workers: WorkerConfig::with_workers(1).with_task_timeout(60),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionqConfig {
    /// Worker pool configuration
    pub workers: WorkerConfig,

    /// Pending queue configuration
    pub queue: QueueConfig,

    /// Per-category admission throttle
    pub rate_limit: RateLimitConfig,

    /// Failure handling
    pub retry: RetryPolicy,

    /// Periodic stats snapshots and status logging
    pub monitor: MonitorConfig,

    /// Persistence configuration
    pub store: StoreConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent workers. Use 1 when the executor drives a single
    /// interactive session.
    pub num_workers: usize,

    /// Hard limit on a single execution (in seconds)
    pub task_timeout_secs: u64,

    /// How long a worker waits on an empty queue before re-checking for
    /// shutdown (in milliseconds)
    pub poll_interval_ms: u64,

    /// Grace period for draining the queue on shutdown (in seconds)
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 3,
            task_timeout_secs: 30,
            poll_interval_ms: 1000,
            shutdown_timeout_secs: 30,
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration with a specific number of workers.
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Set the task timeout.
    pub fn with_task_timeout(mut self, timeout_secs: u64) -> Self {
        self.task_timeout_secs = timeout_secs;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_timeout(mut self, timeout_secs: u64) -> Self {
        self.shutdown_timeout_secs = timeout_secs;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    pub(crate) fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub(crate) fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Pending queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Admissions are rejected once this many tasks are pending
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
        }
    }
}

impl QueueConfig {
    /// Set the maximum queue size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_queue_size = max_size;
        self
    }
}

/// Sliding-window admission limit, applied per category.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Admissions allowed per category inside one window
    pub per_second: usize,

    /// Window length (in milliseconds)
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 10,
            window_ms: 1000,
        }
    }
}

impl RateLimitConfig {
    pub(crate) fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Retry policy configuration.
///
/// Failed tasks are re-queued with demoted urgency rather than delayed;
/// `requeue_delay_ms` adds an optional fixed wait before a retry becomes
/// eligible again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// How much the priority number grows after each failure (capped at 10)
    pub priority_demotion: u8,

    /// Fixed delay before a retried task is eligible (0 = immediately)
    pub requeue_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            priority_demotion: 1,
            requeue_delay_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// Re-queue immediately, demoting by `priority_demotion`.
    pub fn immediate(priority_demotion: u8) -> Self {
        Self {
            priority_demotion,
            requeue_delay_ms: 0,
        }
    }

    /// Re-queue after a fixed delay.
    pub fn delayed(delay_ms: u64) -> Self {
        Self {
            requeue_delay_ms: delay_ms,
            ..Default::default()
        }
    }

    pub(crate) fn requeue_delay(&self) -> Option<Duration> {
        (self.requeue_delay_ms > 0).then(|| Duration::from_millis(self.requeue_delay_ms))
    }
}

/// Stats persistence and status logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval between persisted stats snapshots (in seconds)
    pub snapshot_interval_secs: u64,

    /// Interval between status log lines (in seconds)
    pub status_log_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 5,
            status_log_interval_secs: 30,
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite connection string
    pub database_url: String,

    /// Connection pool size
    pub pool_size: u32,

    /// Where `run` records its process id so `stop` can signal it
    pub pid_file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:///tmp/sessionq.db".to_string(),
            pool_size: 5,
            pid_file: "/tmp/sessionq.pid".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable colored output
    pub colored: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            colored: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl SessionqConfig {
    /// Load a JSON configuration file. Missing sections and fields fall back
    /// to their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> SessionqResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config
            .validate()
            .map_err(|errors| SessionqError::config(errors.join("; ")))?;
        Ok(config)
    }

    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: 1,
                task_timeout_secs: 60,
                ..Default::default()
            },
            monitor: MonitorConfig {
                snapshot_interval_secs: 10,
                status_log_interval_secs: 10,
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: 1,
                task_timeout_secs: 30,
                shutdown_timeout_secs: 60,
                ..Default::default()
            },
            queue: QueueConfig {
                max_queue_size: 1000,
            },
            store: StoreConfig {
                database_url: "sqlite:///var/lib/sessionq/sessionq.db".to_string(),
                pid_file: "/var/run/sessionq.pid".to_string(),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                colored: false,
                include_targets: false,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: 1,
                task_timeout_secs: 2,
                poll_interval_ms: 20,
                shutdown_timeout_secs: 5,
            },
            queue: QueueConfig {
                max_queue_size: 100,
            },
            rate_limit: RateLimitConfig {
                per_second: 1000,
                ..Default::default()
            },
            monitor: MonitorConfig {
                snapshot_interval_secs: 1,
                status_log_interval_secs: 1,
            },
            store: StoreConfig {
                database_url: "sqlite::memory:".to_string(),
                pool_size: 1,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_targets: true,
            },
            ..Default::default()
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.workers.num_workers == 0 {
            errors.push("Number of workers must be greater than 0".to_string());
        }

        if self.workers.task_timeout_secs == 0 {
            errors.push("Task timeout must be greater than 0".to_string());
        }

        if self.workers.poll_interval_ms == 0 {
            errors.push("Worker poll interval must be greater than 0".to_string());
        }

        if self.queue.max_queue_size == 0 {
            errors.push("Maximum queue size must be greater than 0".to_string());
        }

        if self.rate_limit.per_second == 0 {
            errors.push("Rate limit must allow at least one task per window".to_string());
        }

        if self.rate_limit.window_ms == 0 {
            errors.push("Rate limit window must be greater than 0".to_string());
        }

        if self.retry.priority_demotion > 9 {
            errors.push("Priority demotion must not exceed 9".to_string());
        }

        if self.monitor.snapshot_interval_secs == 0 {
            errors.push("Snapshot interval must be greater than 0".to_string());
        }

        if self.monitor.status_log_interval_secs == 0 {
            errors.push("Status log interval must be greater than 0".to_string());
        }

        if self.store.pool_size == 0 {
            errors.push("Store pool size must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
