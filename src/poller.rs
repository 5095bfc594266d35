use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::collector::CostCollector;

/// Drives [`CostCollector::refresh`]: once immediately, then every `interval`
/// until cancelled. A refresh in flight is never interrupted by a tick, and
/// ticks missed while it runs are dropped rather than queued. Cancellation
/// abandons the in-flight refresh without publishing it.
pub struct Poller {
    collector: Arc<CostCollector>,
    interval: Duration,
}

impl Poller {
    pub fn new(collector: Arc<CostCollector>, interval: Duration) -> Self {
        Self {
            collector,
            interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("performing initial cost data fetch");
        if self.refresh_once(&cancel, true).await {
            let Some(first_tick) = Instant::now().checked_add(self.interval) else {
                tracing::error!(
                    interval_seconds = self.interval.as_secs(),
                    "polling interval is too long to schedule"
                );
                return;
            };
            let mut ticker = interval_at(first_tick, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tracing::info!("refreshing cost data");
                        if !self.refresh_once(&cancel, false).await {
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!("poller shutting down");
    }

    /// Returns false when cancellation won over the refresh.
    async fn refresh_once(&self, cancel: &CancellationToken, initial: bool) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            result = self.collector.refresh() => {
                match result {
                    Err(e) if initial => tracing::warn!(error = %e, "initial fetch had errors"),
                    Err(e) => tracing::error!(error = %e, "refresh failed"),
                    Ok(_) => {}
                }
                true
            }
        }
    }
}
