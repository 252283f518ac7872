//! Task progress - 観測用の進捗
//!
//! 進捗は正しさには関与しません（observability 専用）。
//! `ProgressHandle` は watch channel を包み、変更ストリームを提供します。

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Snapshot of a task's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total: u64,
    pub current: u64,
    pub status_message: Option<String>,
    pub unit: Option<String>,
    pub phase: Option<String>,
}

impl TaskProgress {
    /// Merge the present fields of `update`; absent fields are left untouched.
    pub fn merge(&mut self, update: &ProgressUpdate) {
        if let Some(total) = update.total {
            self.total = total;
        }
        if let Some(current) = update.current {
            self.current = current;
        }
        if let Some(message) = &update.message {
            self.status_message = Some(message.clone());
        }
        if let Some(phase) = &update.phase {
            self.phase = Some(phase.clone());
        }
    }
}

/// Partial progress report sent by a remote worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl ProgressUpdate {
    pub fn counts(total: u64, current: u64) -> Self {
        Self {
            total: Some(total),
            current: Some(current),
            ..Self::default()
        }
    }
}

/// Mutable progress object with a change-notification stream.
///
/// Cloning shares the same underlying channel.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    tx: Arc<watch::Sender<TaskProgress>>,
}

impl ProgressHandle {
    pub fn new(initial: TaskProgress) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> TaskProgress {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskProgress> {
        self.tx.subscribe()
    }

    pub fn apply(&self, update: &ProgressUpdate) {
        self.tx.send_modify(|p| p.merge(update));
    }

    pub fn set_total(&self, total: u64) {
        self.tx.send_modify(|p| p.total = total);
    }

    pub fn set_current(&self, current: u64) {
        self.tx.send_modify(|p| p.current = current);
    }

    pub fn advance(&self, by: u64) {
        self.tx.send_modify(|p| p.current = p.current.saturating_add(by));
    }

    pub fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|p| p.status_message = Some(message));
    }

    pub fn set_unit(&self, unit: impl Into<String>) {
        let unit = unit.into();
        self.tx.send_modify(|p| p.unit = Some(unit));
    }
}

impl Default for ProgressHandle {
    fn default() -> Self {
        Self::new(TaskProgress::default())
    }
}
