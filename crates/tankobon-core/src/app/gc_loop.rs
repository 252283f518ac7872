//! QueueCleanup / GcLoop - 完了レコードの保持数を超えた分を削除
//!
//! 削除対象は Completed だけなので、他のすべての処理と並行に走らせて安全です。
//! 「N 番目に新しい完了レコード以前を消す」判定と削除は store 内で一括で行い、
//! 掃除中に完了したタスクがあっても残る件数は常に N です。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::{Result, TaskId};
use crate::ports::TaskStore;

pub struct QueueCleanup {
    store: Arc<dyn TaskStore>,
    retain: usize,
}

impl QueueCleanup {
    pub fn new(store: Arc<dyn TaskStore>, retain: usize) -> Self {
        Self { store, retain }
    }

    /// Delete Completed records beyond the newest `retain`; returns the
    /// deleted ids, oldest first.
    pub async fn cleanup(&self) -> Result<Vec<TaskId>> {
        let deleted = self.store.prune_completed(self.retain).await?;
        if !deleted.is_empty() {
            info!(deleted = deleted.len(), retain = self.retain, "pruned completed tasks");
        }
        Ok(deleted)
    }
}

pub struct GcLoop {
    cleanup: QueueCleanup,
    interval: Duration,
}

impl GcLoop {
    pub fn new(cleanup: QueueCleanup, interval: Duration) -> Self {
        Self { cleanup, interval }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.cleanup.cleanup().await {
                warn!(error = %e, "queue cleanup failed");
            }
        }
    }
}
