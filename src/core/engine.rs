//! The SessionQ engine: the worker pool plus the stats monitor.
//!
//! The engine exists only while the queue is running. Starting it spawns the
//! workers and a monitor that snapshots stats into the store and periodically
//! logs a status line. Shutdown drains the queue, bounded by a grace period.

use super::QueueContext;
use super::worker::WorkerPool;
use crate::error::SessionqResult;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// How a shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ShutdownReport {
    /// Every worker exited on its own before the grace period elapsed
    pub drained: bool,
    /// Tasks still pending when the workers were stopped
    pub abandoned: usize,
}

/// Orchestrates the worker pool and monitor for one run of the queue.
pub struct QueueEngine {
    ctx: Arc<QueueContext>,
    workers: WorkerPool,
    monitor_handle: Option<JoinHandle<()>>,
}

impl QueueEngine {
    pub(crate) fn new(ctx: Arc<QueueContext>) -> Self {
        let workers = WorkerPool::new(Arc::clone(&ctx));
        Self {
            ctx,
            workers,
            monitor_handle: None,
        }
    }

    /// Spawn the workers and the monitor.
    pub async fn start(&mut self) -> SessionqResult<()> {
        let num_workers = self.ctx.config.workers.num_workers;
        tracing::info!("Starting SessionQ engine with {} workers", num_workers);

        self.monitor_handle = Some(self.start_monitor());

        for worker_number in 1..=num_workers {
            self.workers.spawn_worker(worker_number).await;
        }

        tracing::info!("SessionQ engine started");
        Ok(())
    }

    /// Drain the queue, waiting at most `grace` for the workers, then stop
    /// the monitor and persist a final stats snapshot.
    pub async fn shutdown(&mut self, grace: Duration) -> ShutdownReport {
        tracing::info!("Shutting down SessionQ engine...");

        let drained = self.workers.shutdown(grace).await;
        if let Some(handle) = self.monitor_handle.take() {
            handle.abort();
        }

        let abandoned = self.ctx.queue.len().await;
        self.ctx.stats.observe_queue_size(abandoned).await;
        let snapshot = self.ctx.stats.stamped().await;
        if let Err(e) = self.ctx.store.snapshot_stats(&snapshot).await {
            tracing::error!("Failed to persist final stats: {}", e);
        }

        if drained {
            tracing::info!("SessionQ engine shutdown complete");
        } else {
            tracing::warn!(
                "SessionQ engine stopped before draining, {} tasks left pending",
                abandoned
            );
        }

        ShutdownReport { drained, abandoned }
    }

    fn start_monitor(&self) -> JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        let workers = self.workers.clone();
        let expected_workers = ctx.config.workers.num_workers;
        let start_time = Instant::now();

        tokio::spawn(async move {
            tracing::info!("Stats monitor started");

            let mut snapshot_tick =
                interval(Duration::from_secs(ctx.config.monitor.snapshot_interval_secs));
            let mut status_tick =
                interval(Duration::from_secs(ctx.config.monitor.status_log_interval_secs));
            snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Both fire immediately on the first tick; skip that.
            snapshot_tick.tick().await;
            status_tick.tick().await;

            loop {
                tokio::select! {
                    _ = snapshot_tick.tick() => {
                        let size = ctx.queue.len().await;
                        ctx.stats.observe_queue_size(size).await;

                        let snapshot = ctx.stats.stamped().await;
                        if let Err(e) = ctx.store.snapshot_stats(&snapshot).await {
                            tracing::error!("Failed to persist stats snapshot: {}", e);
                        }
                    }
                    _ = status_tick.tick() => {
                        let stats = ctx.stats.snapshot().await;
                        let active = workers.active_worker_count();
                        tracing::info!(
                            "STATUS - Workers: {}/{} | Queue: {} (peak {}) | Processed: {} | Success rate: {:.1}% | Retries: {} | Rate limited: {} | Dead letters: {} | Uptime: {:?}",
                            active,
                            expected_workers,
                            stats.current_queue_size,
                            stats.peak_queue_size,
                            stats.total_processed,
                            stats.success_rate(),
                            stats.retries,
                            stats.rate_limited,
                            ctx.dead_letters.len().await,
                            start_time.elapsed()
                        );
                        if active == 0 {
                            tracing::error!("CRITICAL: no active workers");
                        }
                    }
                }
            }
        })
    }

    /// Number of workers currently running their loop.
    pub fn active_workers(&self) -> usize {
        self.workers.active_worker_count()
    }
}
