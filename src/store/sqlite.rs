//! SQLite store implementation for SessionQ.
//!
//! Three relations back the queue:
//!
//! - `tasks`: one row per task, updated in place by `task_id`
//! - `stats_snapshots`: append-only counter snapshots
//! - `performance_metrics`: append-only per-execution timings
//!
//! Timestamps are stored as INTEGER microseconds since the Unix epoch so that
//! `ORDER BY created_at` is exact.

use super::{PerformanceMetric, StatusUpdate, TaskStore};
use crate::error::{SessionqError, SessionqResult};
use crate::stats::{QueueStats, StatsSnapshot};
use crate::task::{Task, TaskId, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        task_id TEXT PRIMARY KEY,
        command TEXT NOT NULL,
        priority INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        max_retries INTEGER NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        estimated_duration REAL NOT NULL,
        category TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        started_at INTEGER,
        completed_at INTEGER,
        error_message TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
    r#"
    CREATE TABLE IF NOT EXISTS stats_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        total_processed INTEGER NOT NULL,
        successful INTEGER NOT NULL,
        failed INTEGER NOT NULL,
        retries INTEGER NOT NULL,
        current_queue_size INTEGER NOT NULL,
        avg_processing_time REAL NOT NULL,
        peak_queue_size INTEGER NOT NULL,
        rate_limited INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS performance_metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        category TEXT NOT NULL,
        processing_time REAL NOT NULL,
        queue_wait_time REAL NOT NULL,
        worker_id TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    )
    "#,
];

const TASK_COLUMNS: &str = "task_id, command, priority, created_at, max_retries, retry_count, \
     estimated_duration, category, status, started_at, completed_at, error_message";

/// SQLite store backend implementation
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `database_url` and make
    /// sure the schema exists.
    pub async fn connect(database_url: &str, pool_size: u32) -> SessionqResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // `sqlite::memory:` lives exactly as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Wrap an existing pool and make sure the schema exists.
    pub async fn with_pool(pool: SqlitePool) -> SessionqResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        tracing::info!("SQLite task store ready");
        Ok(store)
    }

    async fn init_schema(&self) -> SessionqResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn current_status(&self, task_id: &TaskId) -> SessionqResult<Option<TaskStatus>> {
        let row = sqlx::query("SELECT status FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>("status")?.parse()?)),
            None => Ok(None),
        }
    }

    fn row_to_task(row: &SqliteRow) -> SessionqResult<Task> {
        Ok(Task {
            task_id: row.try_get("task_id")?,
            command: row.try_get("command")?,
            priority: narrow(row.try_get::<i64, _>("priority")?, "priority")?,
            category: row.try_get("category")?,
            created_at: from_micros(row.try_get("created_at")?)?,
            max_retries: narrow(row.try_get::<i64, _>("max_retries")?, "max_retries")?,
            retry_count: narrow(row.try_get::<i64, _>("retry_count")?, "retry_count")?,
            estimated_duration: row.try_get("estimated_duration")?,
            status: row.try_get::<String, _>("status")?.parse()?,
            started_at: row
                .try_get::<Option<i64>, _>("started_at")?
                .map(from_micros)
                .transpose()?,
            completed_at: row
                .try_get::<Option<i64>, _>("completed_at")?
                .map(from_micros)
                .transpose()?,
            error_message: row.try_get("error_message")?,
        })
    }
}

fn from_micros(micros: i64) -> SessionqResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| SessionqError::store(format!("timestamp {micros} out of range")))
}

fn narrow<T: TryFrom<i64>>(value: i64, column: &str) -> SessionqResult<T> {
    T::try_from(value)
        .map_err(|_| SessionqError::store(format!("column {column} holds out-of-range {value}")))
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn persist_task(&self, task: &Task) -> SessionqResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, command, priority, created_at, max_retries, retry_count,
                estimated_duration, category, status, started_at, completed_at, error_message
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                command = excluded.command,
                priority = excluded.priority,
                created_at = excluded.created_at,
                max_retries = excluded.max_retries,
                retry_count = excluded.retry_count,
                estimated_duration = excluded.estimated_duration,
                category = excluded.category,
                status = excluded.status,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                error_message = excluded.error_message
            WHERE tasks.status NOT IN ('completed', 'dead_letter')
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.command)
        .bind(i64::from(task.priority))
        .bind(task.created_at.timestamp_micros())
        .bind(i64::from(task.max_retries))
        .bind(i64::from(task.retry_count))
        .bind(task.estimated_duration)
        .bind(&task.category)
        .bind(task.status.as_str())
        .bind(task.started_at.map(|at| at.timestamp_micros()))
        .bind(task.completed_at.map(|at| at.timestamp_micros()))
        .bind(&task.error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let from = self
                .current_status(&task.task_id)
                .await?
                .unwrap_or(task.status);
            return Err(SessionqError::InvalidTransition {
                task_id: task.task_id.clone(),
                from,
                to: task.status,
            });
        }

        Ok(())
    }

    async fn update_status(&self, task_id: &TaskId, update: StatusUpdate) -> SessionqResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?,
                started_at = COALESCE(?, started_at),
                completed_at = COALESCE(?, completed_at),
                error_message = COALESCE(?, error_message)
            WHERE task_id = ? AND status NOT IN ('completed', 'dead_letter')
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.started_at.map(|at| at.timestamp_micros()))
        .bind(update.completed_at.map(|at| at.timestamp_micros()))
        .bind(&update.error_message)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.current_status(task_id).await? {
                Some(from) => Err(SessionqError::InvalidTransition {
                    task_id: task_id.clone(),
                    from,
                    to: update.status,
                }),
                None => Err(SessionqError::store(format!("task {task_id} not found"))),
            };
        }

        Ok(())
    }

    async fn restore_unfinished(&self) -> SessionqResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE status IN ('queued', 'processing', 'failed_retrying')
            ORDER BY priority ASC, created_at ASC, rowid ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn count_unfinished(&self) -> SessionqResult<usize> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS unfinished FROM tasks \
             WHERE status IN ('queued', 'processing', 'failed_retrying')",
        )
        .fetch_one(&self.pool)
        .await?;

        narrow(row.try_get::<i64, _>("unfinished")?, "unfinished")
    }

    async fn snapshot_stats(&self, snapshot: &StatsSnapshot) -> SessionqResult<()> {
        let stats = &snapshot.stats;
        sqlx::query(
            r#"
            INSERT INTO stats_snapshots (
                timestamp, total_processed, successful, failed, retries,
                current_queue_size, avg_processing_time, peak_queue_size, rate_limited
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.timestamp.timestamp_micros())
        .bind(stats.total_processed as i64)
        .bind(stats.successful as i64)
        .bind(stats.failed as i64)
        .bind(stats.retries as i64)
        .bind(stats.current_queue_size as i64)
        .bind(stats.avg_processing_time)
        .bind(stats.peak_queue_size as i64)
        .bind(stats.rate_limited as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_metric(&self, metric: &PerformanceMetric) -> SessionqResult<()> {
        sqlx::query(
            r#"
            INSERT INTO performance_metrics (
                task_id, category, processing_time, queue_wait_time, worker_id, timestamp
            )
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&metric.task_id)
        .bind(&metric.category)
        .bind(metric.processing_time)
        .bind(metric.queue_wait_time)
        .bind(&metric.worker_id)
        .bind(metric.timestamp.timestamp_micros())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> SessionqResult<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn tasks_by_status(
        &self,
        status: TaskStatus,
        limit: Option<usize>,
    ) -> SessionqResult<Vec<Task>> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(|limit| limit as i64).unwrap_or(-1);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE status = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn latest_stats(&self) -> SessionqResult<Option<StatsSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT timestamp, total_processed, successful, failed, retries,
                   current_queue_size, avg_processing_time, peak_queue_size, rate_limited
            FROM stats_snapshots
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(StatsSnapshot {
            timestamp: from_micros(row.try_get("timestamp")?)?,
            stats: QueueStats {
                total_processed: narrow(row.try_get::<i64, _>("total_processed")?, "total_processed")?,
                successful: narrow(row.try_get::<i64, _>("successful")?, "successful")?,
                failed: narrow(row.try_get::<i64, _>("failed")?, "failed")?,
                retries: narrow(row.try_get::<i64, _>("retries")?, "retries")?,
                current_queue_size: narrow(
                    row.try_get::<i64, _>("current_queue_size")?,
                    "current_queue_size",
                )?,
                avg_processing_time: row.try_get("avg_processing_time")?,
                peak_queue_size: narrow(
                    row.try_get::<i64, _>("peak_queue_size")?,
                    "peak_queue_size",
                )?,
                rate_limited: narrow(row.try_get::<i64, _>("rate_limited")?, "rate_limited")?,
            },
        }))
    }

    async fn health_check(&self) -> SessionqResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
