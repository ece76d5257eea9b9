//! Periodic expiry of idle callers and unclaimed results.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::store::PendingStore;

/// Shortest period the reclaimer ticks at.
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(1);

/// Runs [`PendingStore::reap`] on a fixed interval.
pub struct AnswerReclaimer {
    store: Arc<PendingStore>,
    interval: Duration,
}

impl AnswerReclaimer {
    pub fn new(store: Arc<PendingStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval.max(MIN_REAP_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Reclaimer stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.store.reap(Instant::now());
                    if !report.is_empty() {
                        info!(
                            "Reclaimed {} idle sessions, {} new orphans, {} expired orphans",
                            report.sessions, report.orphans_created, report.orphans_expired
                        );
                    }
                }
            }
        }
    }
}
