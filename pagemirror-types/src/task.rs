//! Queued tasks and their state machine.
//!
//! A `Task` is a large operation split into fixed-size batches, processed
//! incrementally across scheduler invocations. Legal status transitions:
//!
//! ```text
//! Pending ──→ Processing ──→ { Completed | Pending | Retrying | Failed }
//! Retrying ──→ Processing
//! { Pending | Retrying } ──→ Cancelled
//! ```
//!
//! Everything else is rejected with [`TransitionError`].

use crate::ids::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A unit of queued work. Opaque to the queue; the worker interprets it.
pub type WorkItem = Value;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its next batch to be picked up.
    Pending,
    /// A batch is currently executing.
    Processing,
    /// All batches finished successfully. Terminal.
    Completed,
    /// Retries exhausted. Terminal.
    Failed,
    /// Last batch failed; scheduled to run again after a delay.
    Retrying,
    /// Cancelled before completion. Terminal.
    Cancelled,
}

impl TaskStatus {
    /// Returns true for terminal states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Rejected task status transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal task transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    /// Status the task was in.
    pub from: TaskStatus,
    /// Status the caller asked for.
    pub to: TaskStatus,
}

/// Per-task execution options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Items per batch.
    pub batch_size: usize,
    /// Batch failures tolerated before the task fails.
    pub max_retries: u32,
    /// Base retry delay in seconds; actual delay is linear in retry_count.
    pub retry_delay_secs: u64,
    /// Per-batch execution timeout in seconds.
    pub timeout_secs: u64,
    /// Higher priority tasks are picked up first.
    pub priority: i32,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 3,
            retry_delay_secs: 60,
            timeout_secs: 120,
            priority: 0,
        }
    }
}

/// A queued batch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: TaskId,
    /// Operation name, interpreted by the batch worker.
    pub operation: String,
    /// Work items split into fixed-size batches.
    pub batches: Vec<Vec<WorkItem>>,
    /// Index of the next batch to execute.
    pub current_batch: usize,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Consecutive failures of the current batch.
    pub retry_count: u32,
    /// Completion percentage, 0..=100.
    pub progress: u8,
    /// Per-batch worker results.
    pub results: Vec<Value>,
    /// Recorded error messages (size-bounded by the queue).
    pub errors: Vec<String>,
    /// Execution options.
    pub options: TaskOptions,
    /// When the task was enqueued.
    pub created_at: DateTime<Utc>,
    /// Earliest time the next batch may run. `None` means immediately.
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates a task by splitting `items` into batches of
    /// `options.batch_size`.
    pub fn new(operation: impl Into<String>, items: Vec<WorkItem>, options: TaskOptions) -> Self {
        let batch_size = options.batch_size.max(1);
        let batches: Vec<Vec<WorkItem>> = items
            .chunks(batch_size)
            .map(<[WorkItem]>::to_vec)
            .collect();
        Self {
            id: TaskId::new(),
            operation: operation.into(),
            batches,
            current_batch: 0,
            status: TaskStatus::Pending,
            retry_count: 0,
            progress: 0,
            results: Vec::new(),
            errors: Vec::new(),
            options,
            created_at: Utc::now(),
            next_run_at: None,
        }
    }

    /// Total number of batches.
    #[must_use]
    pub fn total_batches(&self) -> usize {
        self.batches.len()
    }

    /// The batch due for execution, if any remain.
    #[must_use]
    pub fn pending_batch(&self) -> Option<&[WorkItem]> {
        self.batches.get(self.current_batch).map(Vec::as_slice)
    }

    /// Recomputes `progress` from `current_batch`.
    pub fn update_progress(&mut self) {
        let total = self.total_batches();
        self.progress = if total == 0 {
            100
        } else {
            ((self.current_batch * 100) / total).min(100) as u8
        };
    }

    /// Moves the task to `to`, enforcing the state machine.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), TransitionError> {
        use TaskStatus::{Cancelled, Completed, Failed, Pending, Processing, Retrying};
        let legal = matches!(
            (self.status, to),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Retrying)
                | (Processing, Failed)
                | (Retrying, Processing)
                | (Pending, Cancelled)
                | (Retrying, Cancelled)
        );
        if !legal {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Returns true once the task is due to run at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_run_at {
            Some(at) => now >= at,
            None => true,
        }
    }
}
