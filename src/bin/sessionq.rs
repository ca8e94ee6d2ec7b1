// sessionq CLI
//
// `run` owns the workers; every other subcommand talks to the SQLite store
// directly and never restores or re-queues anything.

use clap::{Parser, Subcommand};
use serde_json::json;
use sessionq::config::LoggingConfig;
use sessionq::prelude::*;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sessionq")]
#[command(about = "Priority task queue feeding commands into a tmux session")]
#[command(version)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite connection string, overrides the configuration
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a command
    Add {
        /// Command to send to the session
        command: String,

        /// Priority, 1 (most urgent) to 10
        #[arg(long, short, default_value_t = 5)]
        priority: u8,

        /// Category used for rate limiting
        #[arg(long, short, default_value = "default")]
        category: String,

        /// Retries before the task is dead-lettered
        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        /// Expected run time in seconds
        #[arg(long, default_value_t = 2.0)]
        estimated_duration: f64,
    },

    /// Show task counts and the latest stats snapshot
    Status,

    /// List dead-lettered tasks, newest first
    DeadLetters {
        /// Maximum number of tasks to list
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Run the workers until Ctrl-C or SIGTERM
    Run {
        /// Number of workers, overrides the configuration
        #[arg(long, short)]
        workers: Option<usize>,

        /// tmux session that receives the commands
        #[arg(long, default_value = "claude")]
        session: String,
    },

    /// Signal a running `sessionq run` to shut down
    Stop,
}

/// Exit status of `add` when the queue refuses the task.
const EXIT_REJECTED: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging);

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_rejection() => {
            eprintln!("Rejected: {e}");
            ExitCode::from(EXIT_REJECTED)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> SessionqResult<SessionqConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionqConfig::from_json_file(path)?,
        None => SessionqConfig::default(),
    };
    if let Some(database) = &cli.database {
        config.store.database_url = database.clone();
    }
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(tracing::Level::from(logging.level).into())
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(logging.colored)
        .with_target(logging.include_targets)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_store(config: &SessionqConfig) -> SessionqResult<Arc<SqliteStore>> {
    let store = SqliteStore::connect(&config.store.database_url, config.store.pool_size).await?;
    Ok(Arc::new(store))
}

async fn run(command: Commands, mut config: SessionqConfig) -> SessionqResult<()> {
    match command {
        Commands::Add {
            command,
            priority,
            category,
            max_retries,
            estimated_duration,
        } => {
            let store = open_store(&config).await?;
            let manager =
                QueueManager::detached(config, store, Arc::new(TmuxExecutor::default()))?;

            let task_id = manager
                .add_task(
                    NewTask::new(command)
                        .with_priority(priority)
                        .with_category(category)
                        .with_max_retries(max_retries)
                        .with_estimated_duration(estimated_duration),
                )
                .await?;
            println!("Task added: {task_id}");
            Ok(())
        }
        Commands::Status => {
            let store = open_store(&config).await?;
            let mut counts = serde_json::Map::new();
            for status in [
                TaskStatus::Queued,
                TaskStatus::Processing,
                TaskStatus::FailedRetrying,
                TaskStatus::Completed,
                TaskStatus::DeadLetter,
            ] {
                let count = store.tasks_by_status(status, None).await?.len();
                counts.insert(status.as_str().to_string(), json!(count));
            }

            let status = json!({
                "tasks": counts,
                "latest_stats": store.latest_stats().await?,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::DeadLetters { limit } => {
            let store = open_store(&config).await?;
            let tasks = store
                .tasks_by_status(TaskStatus::DeadLetter, Some(limit))
                .await?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
            Ok(())
        }
        Commands::Run { workers, session } => {
            if let Some(workers) = workers {
                config.workers.num_workers = workers;
            }
            if config.workers.num_workers > 1 {
                tracing::warn!(
                    "Running {} workers against one tmux session; commands may interleave",
                    config.workers.num_workers
                );
            }

            let pid_file = PathBuf::from(&config.store.pid_file);
            let store = open_store(&config).await?;
            let manager =
                QueueManager::new(config, store, Arc::new(TmuxExecutor::new(session))).await?;

            std::fs::write(&pid_file, std::process::id().to_string())?;
            manager.start().await?;
            tracing::info!("Queue running, press Ctrl+C to stop");

            wait_for_shutdown_signal().await?;

            let report = manager.shutdown().await;
            remove_pid_file(&pid_file);
            let report = report?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Stop => {
            let pid_file = PathBuf::from(&config.store.pid_file);
            let pid = std::fs::read_to_string(&pid_file)
                .map_err(|e| SessionqError::config(format!("no running queue ({e})")))?;
            let pid = pid.trim();

            let status = tokio::process::Command::new("kill")
                .args(["-TERM", pid])
                .status()
                .await?;
            if !status.success() {
                remove_pid_file(&pid_file);
                return Err(SessionqError::config(format!(
                    "could not signal process {pid}, removed stale pid file"
                )));
            }

            println!("Sent shutdown signal to process {pid}");
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> SessionqResult<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> SessionqResult<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    Ok(())
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!("Failed to remove pid file {}: {}", path.display(), e);
    }
}
