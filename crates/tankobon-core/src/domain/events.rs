//! Events - 購読者へ流すイベント
//!
//! 配送は best-effort（バックプレッシャー保証なし）。

use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::progress::TaskProgress;
use super::status::TaskStatus;

/// Status or progress change of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    StatusChanged {
        task_id: TaskId,
        status: TaskStatus,
    },
    ProgressChanged {
        task_id: TaskId,
        progress: TaskProgress,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::StatusChanged { task_id, .. } | TaskEvent::ProgressChanged { task_id, .. } => {
                *task_id
            }
        }
    }
}
