//! Running counters for the queue, and the snapshots persisted from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;

/// Aggregate counters exposed through the status API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks that reached a terminal status (completed or dead-lettered)
    pub total_processed: u64,
    /// Tasks that completed
    pub successful: u64,
    /// Tasks that were dead-lettered
    pub failed: u64,
    /// Retry attempts scheduled
    pub retries: u64,
    /// Pending tasks at the last refresh
    pub current_queue_size: usize,
    /// Largest pending size ever observed
    pub peak_queue_size: usize,
    /// Admissions rejected for capacity or rate
    pub rate_limited: u64,
    /// Running mean of processing time, in seconds
    pub avg_processing_time: f64,
}

impl QueueStats {
    /// Percentage of finished tasks that succeeded; 100 when none finished.
    pub fn success_rate(&self) -> f64 {
        let finished = self.successful + self.failed;
        if finished == 0 {
            100.0
        } else {
            self.successful as f64 / finished as f64 * 100.0
        }
    }
}

/// A persisted copy of [`QueueStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// Counters at that moment
    #[serde(flatten)]
    pub stats: QueueStats,
}

/// How an execution attempt ended, as far as the counters care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Task completed
    Completed,
    /// Task was dead-lettered
    DeadLettered,
}

/// Shared, synchronized owner of [`QueueStats`].
#[derive(Debug, Default)]
pub struct StatsCollector {
    stats: Mutex<QueueStats>,
}

impl StatsCollector {
    /// Create a collector with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a rejected admission.
    pub async fn record_rejection(&self) {
        self.stats.lock().await.rate_limited += 1;
    }

    /// Track the pending size after an insert, raising the peak if needed.
    pub async fn observe_queue_size(&self, size: usize) {
        let mut stats = self.stats.lock().await;
        stats.current_queue_size = size;
        if size > stats.peak_queue_size {
            stats.peak_queue_size = size;
        }
    }

    /// Count a scheduled retry.
    pub async fn record_retry(&self) {
        self.stats.lock().await.retries += 1;
    }

    /// Count a terminal outcome and fold its processing time into the mean.
    pub async fn record_outcome(&self, outcome: Outcome, processing_time: Duration) {
        let mut stats = self.stats.lock().await;
        match outcome {
            Outcome::Completed => stats.successful += 1,
            Outcome::DeadLettered => stats.failed += 1,
        }
        stats.total_processed += 1;

        let n = stats.total_processed as f64;
        stats.avg_processing_time += (processing_time.as_secs_f64() - stats.avg_processing_time) / n;
    }

    /// Copy of the current counters.
    pub async fn snapshot(&self) -> QueueStats {
        self.stats.lock().await.clone()
    }

    /// Timestamped copy, ready to persist.
    pub async fn stamped(&self) -> StatsSnapshot {
        StatsSnapshot {
            timestamp: Utc::now(),
            stats: self.snapshot().await,
        }
    }
}
