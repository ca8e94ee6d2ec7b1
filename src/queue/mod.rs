//! The in-memory ordered structure workers drain.
//!
//! Tasks come out ordered by `(priority, created_at)`, lowest first, with the
//! insertion sequence as the final tie-break so equal keys stay FIFO. Waiting
//! consumers park on a [`Notify`] with a bounded deadline, so they can notice
//! shutdown without sleeping in a loop.
//!
//! # Examples
//!
//! ```rust,no_run
//! use sessionq::queue::PendingQueue;
//! # use sessionq::task::Task;
//! # async fn example(task: Task) {
//! let queue = PendingQueue::new();
//! queue.push(task).await;
//!
//! let next = queue.pop_timeout(std::time::Duration::from_secs(1)).await;
//! # }
//! ```

use crate::task::Task;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, timeout_at};

pub mod dead_letter;
pub use dead_letter::DeadLetterSink;

/// Heap entry. `BinaryHeap` is a max-heap, so the comparison is reversed.
#[derive(Debug)]
struct QueueEntry {
    task: Task,
    sequence: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .task
            .priority
            .cmp(&self.task.priority)
            .then_with(|| other.task.created_at.cmp(&self.task.created_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// A retried task waiting out its requeue delay.
#[derive(Debug)]
struct DelayedEntry {
    ready_at: Instant,
    task: Task,
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    delayed: Vec<DelayedEntry>,
    next_sequence: u64,
}

impl QueueState {
    fn insert(&mut self, task: Task) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueueEntry { task, sequence });
    }

    /// Move delayed entries whose time has come into the heap.
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|entry| entry.ready_at <= now);
        self.delayed = waiting;

        let mut due = due;
        due.sort_by_key(|entry| entry.ready_at);
        for entry in due {
            self.insert(entry.task);
        }
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.delayed.iter().map(|entry| entry.ready_at).min()
    }

    fn len(&self) -> usize {
        self.heap.len() + self.delayed.len()
    }
}

/// Priority queue shared by admission and every worker.
#[derive(Debug, Default)]
pub struct PendingQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl PendingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task, eligible immediately. Returns the new queue length.
    pub async fn push(&self, task: Task) -> usize {
        let len = {
            let mut state = self.state.lock().await;
            state.insert(task);
            state.len()
        };
        self.available.notify_one();
        len
    }

    /// Insert a task that becomes eligible after `delay`.
    pub async fn push_delayed(&self, task: Task, delay: Duration) -> usize {
        let len = {
            let mut state = self.state.lock().await;
            state.delayed.push(DelayedEntry {
                ready_at: Instant::now() + delay,
                task,
            });
            state.len()
        };
        // Wakes a waiter so it can re-arm its deadline on the new entry.
        self.available.notify_one();
        len
    }

    /// Remove the most urgent eligible task without waiting.
    pub async fn try_pop(&self) -> Option<Task> {
        let mut state = self.state.lock().await;
        state.promote_due(Instant::now());
        state.heap.pop().map(|entry| entry.task)
    }

    /// Remove the most urgent eligible task, waiting at most `wait` for one
    /// to arrive.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<Task> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock().await;
                state.promote_due(Instant::now());
                if let Some(entry) = state.heap.pop() {
                    return Some(entry.task);
                }
                match state.next_ready_at() {
                    Some(ready_at) if ready_at < deadline => ready_at,
                    _ => deadline,
                }
            };

            if Instant::now() >= deadline {
                return None;
            }

            // Either a push woke us or a delayed entry became due; both loop.
            let _ = timeout_at(wake_at, notified).await;
        }
    }

    /// Number of pending tasks, including retries still waiting out a delay.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Whether nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Pending tasks in dequeue order, for inspection.
    ///
    /// Eligible tasks come first; retries still waiting out a delay follow,
    /// soonest first. The result always has [`len`](Self::len) entries.
    pub async fn snapshot(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        let mut entries: Vec<&QueueEntry> = state.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));

        let mut delayed: Vec<&DelayedEntry> = state.delayed.iter().collect();
        delayed.sort_by_key(|entry| entry.ready_at);

        entries
            .into_iter()
            .map(|entry| entry.task.clone())
            .chain(delayed.into_iter().map(|entry| entry.task.clone()))
            .collect()
    }
}
