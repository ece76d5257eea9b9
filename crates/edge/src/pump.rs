//! Background task that keeps the edge's result stream open.

use askq_core::{BackoffPolicy, SessionId};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn, Instrument};

use crate::cache::ResponseCache;
use crate::gateway_client::GatewayApi;

/// Reads the gateway result stream of the edge session into the cache,
/// reconnecting with exponential backoff whenever it drops.
pub struct ResultPump {
    gateway: Arc<dyn GatewayApi>,
    session: SessionId,
    cache: Arc<ResponseCache>,
    reconnect: BackoffPolicy,
}

impl ResultPump {
    pub fn new(
        gateway: Arc<dyn GatewayApi>,
        session: SessionId,
        cache: Arc<ResponseCache>,
        reconnect: BackoffPolicy,
    ) -> Self {
        Self {
            gateway,
            session,
            cache,
            reconnect,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let span = tracing::info_span!("result_pump", session = %self.session);
        async move {
            let mut backoff = self.reconnect.start();

            loop {
                match self.gateway.open_stream(&self.session).await {
                    Ok(mut stream) => {
                        info!("Connected to gateway result stream");
                        backoff.reset();

                        loop {
                            tokio::select! {
                                _ = shutdown_rx.recv() => {
                                    info!("Result pump stopped");
                                    return;
                                }
                                item = stream.next() => match item {
                                    Some(Ok(envelope)) => {
                                        let query_id = envelope.query_id;
                                        if self.cache.insert_result(envelope) {
                                            debug!(query_id = %query_id, "Answer cached");
                                        } else {
                                            debug!(
                                                query_id = %query_id,
                                                "Answer arrived before its submission was recorded"
                                            );
                                        }
                                    }
                                    Some(Err(e)) => {
                                        warn!("Result stream failed: {}", e);
                                        break;
                                    }
                                    None => {
                                        warn!("Result stream closed by gateway");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => warn!("Failed to connect to gateway: {}", e),
                }

                let delay = backoff.next_delay();
                info!("Reconnecting in {:?}", delay);
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Result pump stopped");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        .instrument(span)
        .await
    }
}
