//! # SessionQ
//!
//! A persistent priority task queue that feeds shell commands into a single
//! serialized execution session, such as a tmux pane.
//!
//! ## Features
//!
//! - **Priority ordering**: lowest priority number first, FIFO among equals
//! - **Admission control**: bounded queue size and per-category rate limits
//! - **Retries**: failed tasks are demoted and re-queued, then dead-lettered
//! - **Durability**: every task is persisted and unfinished work is restored
//!   on restart
//! - **Graceful shutdown**: the queue drains within a grace period
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sessionq::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> SessionqResult<()> {
//!     let config = SessionqConfig {
//!         workers: WorkerConfig::with_workers(1),
//!         ..Default::default()
//!     };
//!     let manager = QueueManager::new(
//!         config,
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(TmuxExecutor::new("claude")),
//!     )
//!     .await?;
//!
//!     manager.start().await?;
//!     manager
//!         .add_task(NewTask::new("cargo fmt").with_priority(1))
//!         .await?;
//!
//!     let report = manager.shutdown().await?;
//!     assert!(report.drained);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod queue;
pub mod rate_limit;
pub mod stats;
pub mod store;
pub mod task;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::core::{QueueManager, QueueStatus, ShutdownReport};
    pub use crate::error::{SessionqError, SessionqResult};
    pub use crate::executor::{Executor, TmuxExecutor};
    pub use crate::stats::{QueueStats, StatsSnapshot};
    pub use crate::store::{MemoryStore, TaskStore};
    pub use crate::task::{NewTask, Task, TaskId, TaskStatus};
    pub use async_trait::async_trait;

    #[cfg(feature = "sqlite-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "sqlite-store")))]
    pub use crate::store::SqliteStore;
}

pub use crate::config::SessionqConfig;
pub use crate::core::{QueueManager, QueueStatus, ShutdownReport};
pub use crate::error::{SessionqError, SessionqResult};
pub use crate::executor::{Executor, TmuxExecutor};
pub use crate::task::{NewTask, Task, TaskId, TaskStatus};
pub use async_trait::async_trait;
