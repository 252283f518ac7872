//! Status - 状態変化の通知
//!
//! 各コンポーネントが `StatusNotifier` を持ち、`TaskEvent` を broadcast します。
//! 配送は best-effort: 購読者がいなくても、遅れて lag しても送信側は止まりません。

use tokio::sync::broadcast;
use tracing::trace;

use crate::domain::{TaskEvent, TaskId, TaskProgress, TaskStatus};

const DEFAULT_CAPACITY: usize = 256;

/// Broadcast of status/progress changes. Clones share one channel.
#[derive(Debug, Clone)]
pub struct StatusNotifier {
    tx: broadcast::Sender<TaskEvent>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TaskEvent) {
        // no subscribers is fine
        if self.tx.send(event).is_err() {
            trace!("status event dropped: no subscribers");
        }
    }

    pub fn status_changed(&self, task_id: TaskId, status: TaskStatus) {
        self.publish(TaskEvent::StatusChanged { task_id, status });
    }

    pub fn progress_changed(&self, task_id: TaskId, progress: TaskProgress) {
        self.publish(TaskEvent::ProgressChanged { task_id, progress });
    }
}

impl Default for StatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let notifier = StatusNotifier::new();
        let mut rx = notifier.subscribe();
        let id = TaskId::from_ulid(Ulid::new());

        notifier.status_changed(id, TaskStatus::Processing);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            TaskEvent::StatusChanged {
                task_id: id,
                status: TaskStatus::Processing
            }
        );
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let notifier = StatusNotifier::new();
        notifier.status_changed(TaskId::from_ulid(Ulid::new()), TaskStatus::Failed);
    }
}
