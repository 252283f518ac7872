//! Chapter ports - ライブラリ側の外部協調者
//!
//! アーカイブの中身やファイル配置はこのクレートの責務外です。

use async_trait::async_trait;

use crate::domain::{ChapterId, Result, UpscalePayload};

/// Outcome of the upscale fast-path check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpscaleCheck {
    /// Work is still needed; delegate it.
    Needed,
    /// Target already exists and is content-equal to the expected result.
    AlreadySatisfied,
    /// The source archive vanished.
    SourceMissing,
}

#[async_trait]
pub trait ChapterInspector: Send + Sync {
    async fn check_upscale(&self, payload: &UpscalePayload) -> Result<UpscaleCheck>;
}

/// Fire-and-forget notification after a chapter's upscaled archive changed.
pub trait ChapterChangedNotifier: Send + Sync {
    fn chapter_changed(&self, chapter_id: ChapterId);
}

/// Notifier that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopChapterNotifier;

impl ChapterChangedNotifier for NoopChapterNotifier {
    fn chapter_changed(&self, _chapter_id: ChapterId) {}
}
