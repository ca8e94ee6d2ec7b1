//! Failure policy applied after each unsuccessful execution attempt.
//!
//! A failed task either goes back into the queue with demoted urgency or, once
//! its retry budget is spent, lands in the dead-letter sink. There is no
//! exponential backoff: a retry is eligible immediately unless the policy sets
//! a fixed requeue delay.

use crate::config::RetryPolicy;
use crate::task::{MAX_PRIORITY, Task, TaskStatus};
use std::time::Duration;

/// What to do with a task whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put it back into the queue, optionally after a delay
    Retry {
        /// Wait before the task is eligible again
        delay: Option<Duration>,
    },
    /// Retries are exhausted
    DeadLetter,
}

/// Applies [`RetryPolicy`] to failed tasks.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    /// Create a controller for `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Decide the fate of `task` after a failure. Does not modify it.
    pub fn decide(&self, task: &Task) -> RetryDecision {
        if task.has_retries_left() {
            RetryDecision::Retry {
                delay: self.policy.requeue_delay(),
            }
        } else {
            RetryDecision::DeadLetter
        }
    }

    /// Consume one retry: bump `retry_count`, demote the priority and set the
    /// status the task waits in.
    pub fn prepare_retry(&self, task: &mut Task, error: &str) {
        debug_assert!(task.has_retries_left());
        task.retry_count += 1;
        task.priority = demote(task.priority, self.policy.priority_demotion);
        task.error_message = Some(error.to_string());
        task.status = if self.policy.requeue_delay().is_some() {
            TaskStatus::FailedRetrying
        } else {
            TaskStatus::Queued
        };
    }
}

fn demote(priority: u8, step: u8) -> u8 {
    priority.saturating_add(step).min(MAX_PRIORITY)
}
