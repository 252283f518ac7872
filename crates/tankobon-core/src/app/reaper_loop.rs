//! ReaperLoop - 期限切れ lease の定期回収
//!
//! # フロー
//! 1. `reap_interval` ごとに DistributedCoordinator::reap_dead_leases() を呼ぶ
//! 2. store 上でまだ Processing のタスクだけが Pending に戻り upscale レーンへ再配送される
//! 3. store エラーになった lease は残り、次の tick で再試行される

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::coordinator::DistributedCoordinator;

pub struct ReaperLoop {
    coordinator: Arc<DistributedCoordinator>,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(coordinator: Arc<DistributedCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let requeued = self.coordinator.reap_dead_leases().await;
            if !requeued.is_empty() {
                info!(count = requeued.len(), "requeued tasks from dead leases");
            }
        }
    }
}
