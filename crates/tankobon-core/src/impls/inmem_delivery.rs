//! InMemoryDeliveryQueue - レーンごとの配送キュー
//!
//! - HashMap<Lane, VecDeque<TaskId>> でレーンごとにキューを管理
//! - push 時は Notify で待機中の全コンシューマを起こす（レーンが違う待機者もいるため）

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{Lane, TaskId};
use crate::ports::DeliveryQueue;

pub struct InMemoryDeliveryQueue {
    lanes: Mutex<HashMap<Lane, VecDeque<TaskId>>>,
    notify: Notify,
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    async fn try_pop(&self, lanes: &[Lane]) -> Option<(Lane, TaskId)> {
        let mut guard = self.lanes.lock().await;
        for lane in lanes {
            if let Some(queue) = guard.get_mut(lane)
                && let Some(task_id) = queue.pop_front()
            {
                return Some((*lane, task_id));
            }
        }
        None
    }
}

impl Default for InMemoryDeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn push(&self, lane: Lane, task_id: TaskId) {
        {
            let mut guard = self.lanes.lock().await;
            guard.entry(lane).or_default().push_back(task_id);
        }
        self.notify.notify_waiters();
    }

    async fn pop(&self, lanes: &[Lane], timeout: Duration) -> Option<(Lane, TaskId)> {
        let deadline = Instant::now() + timeout;
        loop {
            // notified() を先に登録してから確認する（push との取りこぼし防止）
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.try_pop(lanes).await {
                return Some(hit);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    async fn remove(&self, task_id: TaskId) -> bool {
        let mut guard = self.lanes.lock().await;
        let mut found = false;
        for queue in guard.values_mut() {
            let before = queue.len();
            queue.retain(|id| *id != task_id);
            found |= queue.len() != before;
        }
        found
    }

    async fn len(&self, lane: Lane) -> usize {
        let guard = self.lanes.lock().await;
        guard.get(&lane).map(VecDeque::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ulid::Ulid;

    fn id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn test_push_pop_roundtrip() {
        let queue = InMemoryDeliveryQueue::new();
        let task_id = id();
        queue.push(Lane::Standard, task_id).await;
        let popped = queue.pop(&[Lane::Standard], Duration::from_secs(1)).await;
        assert_eq!(popped, Some((Lane::Standard, task_id)));
    }

    #[tokio::test]
    async fn test_pop_timeout() {
        let queue = InMemoryDeliveryQueue::new();
        let start = Instant::now();
        let popped = queue.pop(&[Lane::Upscale], Duration::from_millis(200)).await;
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn lanes_are_fifo_and_isolated() {
        let queue = InMemoryDeliveryQueue::new();
        let (a, b, c) = (id(), id(), id());
        queue.push(Lane::Upscale, a).await;
        queue.push(Lane::Standard, b).await;
        queue.push(Lane::Upscale, c).await;

        let timeout = Duration::from_millis(10);
        assert_eq!(queue.pop(&[Lane::Upscale], timeout).await, Some((Lane::Upscale, a)));
        assert_eq!(queue.pop(&[Lane::Upscale], timeout).await, Some((Lane::Upscale, c)));
        assert_eq!(queue.pop(&[Lane::Upscale], timeout).await, None);
        assert_eq!(queue.len(Lane::Standard).await, 1);
    }

    #[tokio::test]
    async fn earlier_lane_is_preferred() {
        let queue = InMemoryDeliveryQueue::new();
        let (upscale, rerouted) = (id(), id());
        queue.push(Lane::Upscale, upscale).await;
        queue.push(Lane::Rerouted, rerouted).await;

        let lanes = [Lane::Rerouted, Lane::Upscale];
        let timeout = Duration::from_millis(10);
        assert_eq!(queue.pop(&lanes, timeout).await, Some((Lane::Rerouted, rerouted)));
        assert_eq!(queue.pop(&lanes, timeout).await, Some((Lane::Upscale, upscale)));
    }

    #[tokio::test]
    async fn test_push_wakes_pop_on_other_lane_waiters() {
        let queue = Arc::new(InMemoryDeliveryQueue::new());
        let task_id = id();

        // A consumer of a different lane must not swallow the wake-up.
        let standard = tokio::spawn({
            let queue = queue.clone();
            async move { queue.pop(&[Lane::Standard], Duration::from_millis(500)).await }
        });
        let upscale = tokio::spawn({
            let queue = queue.clone();
            async move { queue.pop(&[Lane::Upscale], Duration::from_secs(5)).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.push(Lane::Upscale, task_id).await;

        assert_eq!(upscale.await.unwrap(), Some((Lane::Upscale, task_id)));
        assert_eq!(standard.await.unwrap(), None);
    }

    #[tokio::test]
    async fn remove_drops_queued_handle() {
        let queue = InMemoryDeliveryQueue::new();
        let (keep, gone) = (id(), id());
        queue.push(Lane::Standard, keep).await;
        queue.push(Lane::Standard, gone).await;

        assert!(queue.remove(gone).await);
        assert!(!queue.remove(gone).await);
        assert_eq!(queue.len(Lane::Standard).await, 1);
    }
}
