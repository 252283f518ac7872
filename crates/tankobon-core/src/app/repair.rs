//! Repair delegation - repair タスクの 2 フェーズ処理
//!
//! - Phase 1 (prepare): fetch 時に差分を解析し、欠けたページだけのバンドルを作る
//! - Phase 2 (finish): remote 完了時にまだ必要か再確認し、結果をマージする
//!
//! 一時ファイルは `work_dir/<task_id>/` 以下に置き、成功・失敗・キャンセル・reap の
//! どの経路でも `cleanup` で削除します。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::{RepairPayload, Result, TaskId};
use crate::ports::{RepairAnalyzer, RepairBundle, RepairPlan};

/// Ephemeral per-task state between prepare and finish.
#[derive(Debug, Clone)]
pub struct RepairState {
    pub payload: RepairPayload,
    pub bundle: RepairBundle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    Merged,
    /// Files changed since prepare; nothing was merged.
    NoLongerNeeded,
}

pub struct RepairDelegator {
    analyzer: Arc<dyn RepairAnalyzer>,
    work_dir: PathBuf,
}

impl RepairDelegator {
    pub fn new(analyzer: Arc<dyn RepairAnalyzer>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            analyzer,
            work_dir: work_dir.into(),
        }
    }

    pub fn task_dir(&self, id: TaskId) -> PathBuf {
        self.work_dir.join(id.to_string())
    }

    /// Phase 1. Non-repairable plans leave nothing behind on disk.
    pub async fn prepare(&self, id: TaskId, payload: &RepairPayload) -> Result<RepairPlan> {
        let dir = self.task_dir(id);
        tokio::fs::create_dir_all(&dir).await?;

        let plan = match self.analyzer.prepare(payload, &dir).await {
            Ok(plan) => plan,
            Err(e) => {
                remove_path(&dir).await;
                return Err(e);
            }
        };
        match &plan {
            RepairPlan::Repairable(bundle) => {
                debug!(task_id = %id, missing_pages = bundle.missing_pages, "repair bundle prepared");
            }
            RepairPlan::NoChange | RepairPlan::Unrepairable { .. } => remove_path(&dir).await,
        }
        Ok(plan)
    }

    /// Phase 2. Does not clean up; callers run `cleanup` on every path.
    pub async fn finish(&self, state: &RepairState) -> Result<RepairOutcome> {
        if !self.analyzer.still_needed(&state.payload).await? {
            return Ok(RepairOutcome::NoLongerNeeded);
        }
        self.analyzer.merge(&state.payload, &state.bundle).await?;
        Ok(RepairOutcome::Merged)
    }

    /// Delete every temporary file of `id`. Failures are logged, not returned.
    pub async fn cleanup(&self, id: TaskId, bundle: &RepairBundle) {
        for path in [
            bundle.bundle_path.as_path(),
            bundle.result_path.as_path(),
            bundle.context_dir.as_path(),
            self.task_dir(id).as_path(),
        ] {
            remove_path(path).await;
        }
    }
}

async fn remove_path(path: &Path) {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => Err(e),
    };
    if let Err(e) = result
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove repair file");
    }
}
