//! RepairAnalyzer port - repair タスクのローカル解析
//!
//! repair は二相で進みます。
//! - Phase 1 (prepare): 現在のアーカイブと以前の upscale 結果を比較し、
//!   欠けているページだけのバンドルを作る
//! - Phase 2 (merge): リモートが計算したページを対象アーカイブへマージする

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::domain::{RepairPayload, Result};

/// Files produced by a successful prepare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairBundle {
    /// Archive containing only the missing pages.
    pub bundle_path: PathBuf,
    /// Where the remote worker's upscaled pages must land.
    pub result_path: PathBuf,
    /// Disposable scratch directory for the analysis.
    pub context_dir: PathBuf,
    pub missing_pages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairPlan {
    /// Current and upscaled archives already match.
    NoChange,
    /// A patch is impossible; the chapter needs a full upscale.
    Unrepairable { reason: String },
    Repairable(RepairBundle),
}

#[async_trait]
pub trait RepairAnalyzer: Send + Sync {
    /// Phase 1. All files must be created under `work_dir`.
    async fn prepare(&self, payload: &RepairPayload, work_dir: &Path) -> Result<RepairPlan>;

    /// Re-check at merge time; files may have changed since prepare.
    async fn still_needed(&self, payload: &RepairPayload) -> Result<bool>;

    /// Phase 2. Merge `bundle.result_path` into the target archive.
    async fn merge(&self, payload: &RepairPayload, bundle: &RepairBundle) -> Result<()>;
}
