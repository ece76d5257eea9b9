//! Response fan-in: the single consumer of the response channel.

use askq_core::BackoffPolicy;
use askq_queue::{Delivery, DurableQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn, Instrument};

use crate::protocol::{self, ResponseMessage};
use crate::shutdown;
use crate::store::{PendingStore, StoreOutcome};

/// Backoff between failed receives.
const RECEIVE_BACKOFF: BackoffPolicy = BackoffPolicy {
    initial_ms: 100,
    max_ms: 5_000,
    max_attempts: u32::MAX,
};

/// Moves results from the response channel into the [`PendingStore`].
///
/// A message is acknowledged only after its result is stored, so a crash in
/// between causes a redelivery that the store collapses as a duplicate.
pub struct ResponseFanIn {
    queue: Arc<dyn DurableQueue>,
    store: Arc<PendingStore>,
    channel: String,
    receive_wait: Duration,
}

impl ResponseFanIn {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        store: Arc<PendingStore>,
        channel: impl Into<String>,
        receive_wait: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            channel: channel.into(),
            receive_wait,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let span = tracing::info_span!("fan_in", channel = %self.channel);
        async move {
            info!("Consuming responses");
            let mut backoff = RECEIVE_BACKOFF.start();

            while !shutdown::requested(&mut shutdown_rx) {
                match self.queue.receive(&self.channel, self.receive_wait).await {
                    Ok(Some(delivery)) => {
                        backoff.reset();
                        self.handle(delivery).await;
                    }
                    Ok(None) => backoff.reset(),
                    Err(e) => {
                        let delay = backoff.next_delay();
                        error!("Failed to receive response: {}; retrying in {:?}", e, delay);
                        tokio::time::sleep(delay).await;
                    }
                }
            }

            info!("Fan-in stopped");
        }
        .instrument(span)
        .await
    }

    /// Store one delivered response and acknowledge it.
    pub async fn handle(&self, delivery: Delivery) -> Option<StoreOutcome> {
        let message: ResponseMessage = match protocol::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Quarantining malformed response {}: {}", delivery.message_id, e);
                if let Err(e) = self.queue.dead_letter(&delivery, &e.to_string()).await {
                    error!("Failed to dead-letter response {}: {}", delivery.message_id, e);
                }
                return None;
            }
        };

        let query_id = message.query_id;
        let outcome = self.store.store_result(message.into_result());
        match outcome {
            StoreOutcome::Routed => debug!(query_id = %query_id, "Result routed"),
            StoreOutcome::Orphaned => {
                info!(query_id = %query_id, "Result has no waiting caller; kept as orphan")
            }
            StoreOutcome::Duplicate => debug!(query_id = %query_id, "Duplicate result dropped"),
        }

        if let Err(e) = self.queue.ack(&delivery).await {
            warn!("Failed to ack response {}: {}", delivery.message_id, e);
        }
        Some(outcome)
    }
}
