//! Runtime - ハンドラ実行の土台
//!
//! - `TaskHandler` は種別ごとの実行ロジック（`TaskKind` をキーに登録）
//! - `TaskContext` でペイロード・進捗・キャンセルトークンを渡す
//! - 未登録の種別は `HandlerNotFound` で失敗させる

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{ProgressHandle, Result, TankobonError, TaskId, TaskKind, TaskPayload};

/// Everything a handler gets for one execution.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub payload: TaskPayload,
    pub progress: ProgressHandle,
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// Return `TankobonError::Canceled` once cancellation was requested.
    ///
    /// Call at or before every long-running step.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(TankobonError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Kind-specific execution logic.
///
/// Return `TankobonError::Canceled` when stopping because of `ctx.cancel`;
/// any other error marks the task Failed.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext) -> Result<()>;
}

/// Registry of handlers (kind -> handler).
///
/// Built during initialization, read-only afterwards.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Result<()> {
        if self.handlers.contains_key(&kind) {
            return Err(TankobonError::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: TaskKind) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(&kind)
    }

    pub fn contains(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch `ctx` to the handler for its payload kind.
    pub async fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let kind = ctx.payload.kind();
        let handler = self
            .handlers
            .get(&kind)
            .ok_or(TankobonError::HandlerNotFound(kind))?;
        handler.handle(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    struct OkHandler;

    #[async_trait]
    impl TaskHandler for OkHandler {
        async fn handle(&self, ctx: &TaskContext) -> Result<()> {
            ctx.progress.set_total(1);
            ctx.progress.advance(1);
            Ok(())
        }
    }

    fn ctx(payload: TaskPayload) -> TaskContext {
        TaskContext {
            task_id: TaskId::from_ulid(Ulid::new()),
            payload,
            progress: ProgressHandle::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn executes_registered_handler() {
        let mut reg = HandlerRegistry::new();
        reg.register(TaskKind::Upscale, Arc::new(OkHandler)).unwrap();

        let ctx = ctx(TaskPayload::upscale(1, 1));
        reg.execute(&ctx).await.unwrap();
        assert_eq!(ctx.progress.snapshot().current, 1);
    }

    #[tokio::test]
    async fn errors_when_handler_missing() {
        let reg = HandlerRegistry::new();
        let err = reg.execute(&ctx(TaskPayload::repair(1, 1))).await.unwrap_err();
        assert!(matches!(err, TankobonError::HandlerNotFound(TaskKind::RepairUpscale)));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut reg = HandlerRegistry::new();
        reg.register(TaskKind::LibraryScan, Arc::new(OkHandler)).unwrap();
        let err = reg
            .register(TaskKind::LibraryScan, Arc::new(OkHandler))
            .unwrap_err();
        assert!(matches!(err, TankobonError::DuplicateHandler(_)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn checkpoint_reports_cancellation() {
        let ctx = ctx(TaskPayload::upscale(1, 1));
        assert!(ctx.checkpoint().is_ok());
        ctx.cancel.cancel();
        assert!(ctx.checkpoint().unwrap_err().is_canceled());
    }
}
