//! デモ用のハンドラ・協調者・remote worker シミュレータ

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tankobon_core::app::{DistributedCoordinator, FetchedTask, TaskContext, TaskHandler};
use tankobon_core::domain::{ChapterId, ProgressUpdate, RepairPayload, UpscalePayload};
use tankobon_core::ports::{
    ChapterChangedNotifier, ChapterInspector, RepairAnalyzer, RepairBundle, RepairPlan,
    UpscaleCheck,
};
use tankobon_core::{TaskKind, TankobonError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SIMULATED_STEPS: u64 = 5;

/// Pretends to work through a few steps, honoring cancellation between them.
pub struct SimulatedHandler {
    kind: TaskKind,
}

impl SimulatedHandler {
    pub fn new(kind: TaskKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl TaskHandler for SimulatedHandler {
    async fn handle(&self, ctx: &TaskContext) -> tankobon_core::Result<()> {
        ctx.progress.set_total(SIMULATED_STEPS);
        ctx.progress.set_unit("steps");
        for step in 1..=SIMULATED_STEPS {
            ctx.checkpoint()?;
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(TankobonError::Canceled),
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
            ctx.progress.set_current(step);
        }
        info!(task_id = %ctx.task_id, kind = %self.kind, "simulated task done");
        Ok(())
    }
}

pub struct AlwaysNeeded;

#[async_trait]
impl ChapterInspector for AlwaysNeeded {
    async fn check_upscale(&self, _payload: &UpscalePayload) -> tankobon_core::Result<UpscaleCheck> {
        Ok(UpscaleCheck::Needed)
    }
}

/// Writes a small placeholder bundle into the task's scratch directory.
pub struct ScratchRepairAnalyzer;

#[async_trait]
impl RepairAnalyzer for ScratchRepairAnalyzer {
    async fn prepare(
        &self,
        payload: &RepairPayload,
        work_dir: &Path,
    ) -> tankobon_core::Result<RepairPlan> {
        let bundle_path = work_dir.join(format!("{}-missing.cbz", payload.chapter_id));
        tokio::fs::write(&bundle_path, b"placeholder").await?;
        Ok(RepairPlan::Repairable(RepairBundle {
            bundle_path,
            result_path: work_dir.join("result.cbz"),
            context_dir: work_dir.join("context"),
            missing_pages: 3,
        }))
    }

    async fn still_needed(&self, _payload: &RepairPayload) -> tankobon_core::Result<bool> {
        Ok(true)
    }

    async fn merge(
        &self,
        payload: &RepairPayload,
        bundle: &RepairBundle,
    ) -> tankobon_core::Result<()> {
        info!(
            chapter = %payload.chapter_id,
            pages = bundle.missing_pages,
            "merged repaired pages"
        );
        Ok(())
    }
}

pub struct LoggingChapterNotifier;

impl ChapterChangedNotifier for LoggingChapterNotifier {
    fn chapter_changed(&self, chapter_id: ChapterId) {
        info!(chapter = %chapter_id, "chapter changed");
    }
}

/// Act as a remote worker for one fetched task: report progress with
/// heartbeats every `tick`, then complete.
pub async fn simulate_remote_upscale(
    coordinator: &DistributedCoordinator,
    task: &FetchedTask,
    tick: Duration,
) -> Result<()> {
    let total = task.repair.as_ref().map_or(20, |r| r.missing_pages.max(1));
    for current in (0..=total).step_by(usize::try_from(total / 2).unwrap_or(1).max(1)) {
        tokio::time::sleep(tick).await;
        if !coordinator.heartbeat(task.task_id).await {
            anyhow::bail!("lease for {} was lost", task.task_id);
        }
        coordinator
            .apply_progress(task.task_id, &ProgressUpdate::counts(total, current))
            .await;
    }
    coordinator
        .complete(task.task_id)
        .await
        .with_context(|| format!("completing {}", task.task_id))
}

/// Keep fetching from the coordinator until `shutdown` fires.
///
/// Each fetch waits at most `wait` before polling again.
pub async fn remote_worker(
    coordinator: Arc<DistributedCoordinator>,
    wait: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let fetched = tokio::select! {
            _ = shutdown.cancelled() => break,
            fetched = coordinator.fetch(wait) => fetched,
        };
        match fetched {
            Ok(Some(task)) => {
                if let Err(e) =
                    simulate_remote_upscale(&coordinator, &task, Duration::from_millis(500)).await
                {
                    warn!(task_id = %task.task_id, error = %e, "remote work failed");
                    let _ = coordinator.fail(task.task_id, &e.to_string()).await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "fetch failed"),
        }
    }
}
