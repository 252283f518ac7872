//! Task record: identity + payload + status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::payload::TaskPayload;
use super::progress::TaskProgress;
use super::status::TaskStatus;

/// The durable unit of work.
///
/// Design:
/// - The store row is the single source of truth for status.
/// - Lanes hold `TaskId` only.
/// - `version` is the optimistic-concurrency token; the store bumps it on
///   every successful write and rejects writes carrying a stale value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set on reaching `Completed`.
    pub processed_at: Option<DateTime<Utc>>,

    /// Incremented on every `Failed` transition.
    pub retry_count: u32,

    pub last_error: Option<String>,

    /// Last known progress (observability only).
    #[serde(default)]
    pub progress: TaskProgress,

    #[serde(default)]
    pub version: u64,
}

impl TaskRecord {
    pub fn new(id: TaskId, payload: TaskPayload, now: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            processed_at: None,
            retry_count: 0,
            last_error: None,
            progress: TaskProgress::default(),
            version: 0,
        }
    }

    /// Pending -> Processing.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.processed_at = Some(now);
        self.last_error = None;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.retry_count += 1;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    pub fn mark_canceled(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Canceled;
        self.updated_at = now;
    }

    /// Back to Pending so the task can be claimed again.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.processed_at = None;
        self.updated_at = now;
    }
}
