//! Per-category sliding-window admission throttle.
//!
//! Windows live in memory only and start empty on every process start.

use crate::config::RateLimitConfig;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Counts admissions per category over a trailing window.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Create a limiter from configuration.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            limit: config.per_second,
            window: config.window(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Configured admissions per window.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Record an admission for `category` if it is under its limit.
    ///
    /// Returns `false` without recording anything when the category is full.
    pub async fn check(&self, category: &str) -> bool {
        self.check_at(category, Instant::now()).await
    }

    pub(crate) async fn check_at(&self, category: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock().await;
        self.prune(&mut windows, now);
        let timestamps = windows.entry(category.to_string()).or_default();

        if timestamps.len() >= self.limit {
            return false;
        }

        timestamps.push_back(now);
        true
    }

    /// Admissions currently counted per category. Idle categories are absent.
    pub async fn snapshot(&self) -> HashMap<String, usize> {
        self.snapshot_at(Instant::now()).await
    }

    pub(crate) async fn snapshot_at(&self, now: Instant) -> HashMap<String, usize> {
        let mut windows = self.windows.lock().await;
        self.prune(&mut windows, now);
        windows
            .iter()
            .map(|(category, timestamps)| (category.clone(), timestamps.len()))
            .collect()
    }

    /// Drop aged-out instants, and whole categories once they are empty.
    fn prune(&self, windows: &mut HashMap<String, VecDeque<Instant>>, now: Instant) {
        windows.retain(|_, timestamps| {
            while let Some(oldest) = timestamps.front() {
                if now.saturating_duration_since(*oldest) >= self.window {
                    timestamps.pop_front();
                } else {
                    break;
                }
            }
            !timestamps.is_empty()
        });
    }
}
