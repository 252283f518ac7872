//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Durable status of a task record.
///
/// State transitions:
/// - Pending -> Processing (atomic claim, at most one winner)
/// - Processing -> Completed | Failed | Canceled
/// - Processing -> Pending (requeue after shutdown, crash recovery or lease expiry)
/// - Failed | Canceled -> Pending (explicit retry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Persisted and waiting for an executor.
    Pending,

    /// Claimed by exactly one executor (local loop or remote worker).
    Processing,

    /// Finished successfully. `processed_at` is set.
    Completed,

    /// Execution returned an error. `retry_count` was incremented.
    Failed,

    /// Canceled by a caller.
    Canceled,
}

impl TaskStatus {
    /// Is this a terminal state (no executor will touch it again)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// Is this task eligible for a claim?
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of records per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl QueueCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Processing => self.processing += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Canceled => self.canceled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.canceled
    }
}
