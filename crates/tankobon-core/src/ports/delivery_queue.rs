//! DeliveryQueue port - レーンごとの配送キュー
//!
//! DeliveryQueue は task_id のみを流します（状態や payload は TaskStore に保存）。

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::{Lane, TaskId};

/// In-memory lanes of task handles.
///
/// # 設計原則
/// - task_id のみを保持
/// - 同一レーン内は FIFO
/// - blocking pop（timeout 付き）。複数レーン指定時は先頭レーンを優先
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn push(&self, lane: Lane, task_id: TaskId);

    /// Wait up to `timeout` for a handle on any of `lanes`.
    ///
    /// Lanes are checked in the given order on every wake-up, so earlier lanes
    /// are drained preferentially. A zero timeout still checks once.
    async fn pop(&self, lanes: &[Lane], timeout: Duration) -> Option<(Lane, TaskId)>;

    /// Drop every queued handle for `task_id`. Returns whether one was found.
    async fn remove(&self, task_id: TaskId) -> bool;

    async fn len(&self, lane: Lane) -> usize;
}
