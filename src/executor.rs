//! The boundary between the queue and whatever actually runs a command.
//!
//! The queue only relies on the success/error contract of [`Executor`] and on
//! the worker-side timeout. [`TmuxExecutor`] types each command into a tmux
//! pane; a pane accepts one command at a time, so run it with a single worker.

use crate::error::{SessionqError, SessionqResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

/// Runs one command.
///
/// `Ok(true)` is a success. `Ok(false)` and `Err(_)` are both failures and
/// hand the task to the retry controller; an `Err` carries the reason that
/// ends up in `error_message`.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute `command`, returning whether it succeeded.
    async fn execute(&self, command: &str) -> SessionqResult<bool>;
}

/// Sends commands as keystrokes into a running tmux session.
#[derive(Debug, Clone)]
pub struct TmuxExecutor {
    session: String,
    target: String,
    settle: Duration,
}

impl TmuxExecutor {
    /// Executor for `session`, typing into its first window.
    pub fn new(session: impl Into<String>) -> Self {
        let session = session.into();
        let target = format!("{session}:0");
        Self {
            session,
            target,
            settle: Duration::from_millis(100),
        }
    }

    /// Type into a specific `session:window[.pane]` target instead.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    async fn tmux(&self, args: &[&str]) -> SessionqResult<()> {
        let output = Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|e| SessionqError::execution("failed to spawn tmux", e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(SessionqError::execution_msg(format!(
                "tmux {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl Default for TmuxExecutor {
    fn default() -> Self {
        Self::new("claude")
    }
}

#[async_trait]
impl Executor for TmuxExecutor {
    async fn execute(&self, command: &str) -> SessionqResult<bool> {
        if self.tmux(&["has-session", "-t", &self.session]).await.is_err() {
            return Err(SessionqError::execution_msg(format!(
                "tmux session '{}' not found",
                self.session
            )));
        }

        self.tmux(&["send-keys", "-t", &self.target, command]).await?;
        self.tmux(&["send-keys", "-t", &self.target, "Enter"]).await?;

        // Give the pane a moment to take the keystrokes before the next command.
        tokio::time::sleep(self.settle).await;
        tracing::debug!("Sent command to tmux target {}", self.target);
        Ok(true)
    }
}
