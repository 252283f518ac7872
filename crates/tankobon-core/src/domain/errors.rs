//! Errors - エラー型と分類
//!
//! - claim の競合は `bool` で返す（エラーではない）
//! - `Canceled` は協調キャンセルのシグナルで、失敗とは区別する

use thiserror::Error;

use super::ids::TaskId;
use super::payload::TaskKind;

/// Errors raised by a `TaskStore`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} already exists")]
    AlreadyExists(TaskId),

    #[error("concurrent write on task {task_id} (expected version {expected}, found {actual})")]
    Conflict {
        task_id: TaskId,
        expected: u64,
        actual: u64,
    },

    #[error("store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TankobonError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("handler not found for kind={0}")]
    HandlerNotFound(TaskKind),

    #[error("duplicate handler for kind={0}")]
    DuplicateHandler(TaskKind),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("task was canceled")]
    Canceled,

    #[error("no lease held for task {0}")]
    LeaseNotFound(TaskId),

    #[error("repair state for task {0} not found")]
    RepairStateMissing(TaskId),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl TankobonError {
    pub fn execution(message: impl Into<String>) -> Self {
        TankobonError::Execution(message.into())
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TankobonError::Canceled)
    }
}

pub type Result<T, E = TankobonError> = std::result::Result<T, E>;
