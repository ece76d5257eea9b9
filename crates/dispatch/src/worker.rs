//! Worker pool: consumes questions, answers them, publishes results.
//!
//! A question is acknowledged only after its answer is on the response
//! channel. Failures release the lease with a delay so another attempt is
//! made later; the queue quarantines the message once its delivery budget
//! is spent.

use askq_core::config::AppConfig;
use askq_core::{AppError, AppResult, BackoffPolicy};
use askq_llm::Answerer;
use askq_queue::{with_backoff, Delivery, DurableQueue};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::protocol::{self, RequestMessage, ResponseMessage};
use crate::shutdown;

const RECEIVE_BACKOFF: BackoffPolicy = BackoffPolicy {
    initial_ms: 100,
    max_ms: 5_000,
    max_attempts: u32::MAX,
};

/// Worker tuning, resolved from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub request_channel: String,
    pub response_channel: String,
    pub answer_timeout: Duration,
    pub retry_delay: Duration,
    pub receive_wait: Duration,
    pub publish_retry: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            request_channel: "query_requests".to_string(),
            response_channel: "query_responses".to_string(),
            answer_timeout: Duration::from_secs(120),
            retry_delay: Duration::from_secs(5),
            receive_wait: Duration::from_secs(1),
            publish_retry: BackoffPolicy::default(),
        }
    }
}

impl From<&AppConfig> for WorkerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            request_channel: config.queue.request_channel.clone(),
            response_channel: config.queue.response_channel.clone(),
            answer_timeout: config.worker.answer_timeout(),
            retry_delay: config.worker.retry_delay(),
            receive_wait: Duration::from_secs(1),
            publish_retry: config.worker.publish_retry,
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Answer published and request acknowledged
    Answered,
    /// Lease released for a later attempt
    Released,
    /// Moved to the dead-letter table
    Quarantined,
}

/// One consumer of the request channel.
pub struct Worker {
    id: usize,
    queue: Arc<dyn DurableQueue>,
    answerer: Arc<dyn Answerer>,
    config: Arc<WorkerConfig>,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<dyn DurableQueue>,
        answerer: Arc<dyn Answerer>,
        config: Arc<WorkerConfig>,
    ) -> Self {
        Self {
            id,
            queue,
            answerer,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let span = tracing::info_span!("worker", id = self.id);
        async move {
            info!("Worker started");
            let mut backoff = RECEIVE_BACKOFF.start();

            while !shutdown::requested(&mut shutdown_rx) {
                match self
                    .queue
                    .receive(&self.config.request_channel, self.config.receive_wait)
                    .await
                {
                    Ok(Some(delivery)) => {
                        backoff.reset();
                        self.process(delivery).await;
                    }
                    Ok(None) => backoff.reset(),
                    Err(e) => {
                        let delay = backoff.next_delay();
                        error!("Failed to receive query: {}; retrying in {:?}", e, delay);
                        tokio::time::sleep(delay).await;
                    }
                }
            }

            info!("Worker stopped");
        }
        .instrument(span)
        .await
    }

    /// Answer one delivered question and settle its lease.
    pub async fn process(&self, delivery: Delivery) -> ProcessOutcome {
        let request: RequestMessage = match protocol::decode(&delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Quarantining malformed query {}: {}", delivery.message_id, e);
                return self.quarantine(&delivery, &e.to_string()).await;
            }
        };

        if delivery.is_redelivery() {
            info!(
                query_id = %request.query_id,
                "Retrying query (delivery {})", delivery.delivery_count
            );
        }

        let answer = tokio::time::timeout(
            self.config.answer_timeout,
            self.answerer.answer(&request.query),
        )
        .await;

        let text = match answer {
            Ok(Ok(text)) => text,
            Ok(Err(AppError::InvalidInput(reason))) => {
                warn!(query_id = %request.query_id, "Query cannot be answered: {}", reason);
                return self.quarantine(&delivery, &reason).await;
            }
            Ok(Err(e)) => {
                warn!(query_id = %request.query_id, "Answering failed: {}", e);
                return self.release(&delivery, &e.to_string()).await;
            }
            Err(_) => {
                let reason = format!("answer timed out after {:?}", self.config.answer_timeout);
                warn!(query_id = %request.query_id, "{}", reason);
                return self.release(&delivery, &reason).await;
            }
        };

        let response = ResponseMessage {
            query_id: request.query_id,
            result: text,
            produced_at: Some(Utc::now()),
        };
        if let Err(e) = self.publish(&response).await {
            error!(query_id = %request.query_id, "Failed to publish answer: {}", e);
            return self.release(&delivery, &e.to_string()).await;
        }

        if let Err(e) = self.queue.ack(&delivery).await {
            // The answer is already out; a redelivery produces a duplicate
            // that the gateway drops.
            warn!(query_id = %request.query_id, "Failed to ack query: {}", e);
        }
        debug!(query_id = %request.query_id, "Query answered");
        ProcessOutcome::Answered
    }

    async fn publish(&self, response: &ResponseMessage) -> AppResult<i64> {
        let payload = protocol::encode(response)?;
        with_backoff(&self.config.publish_retry, "publish answer", || {
            self.queue.publish(&self.config.response_channel, &payload)
        })
        .await
    }

    async fn release(&self, delivery: &Delivery, reason: &str) -> ProcessOutcome {
        if let Err(e) = self
            .queue
            .release(delivery, self.config.retry_delay, reason)
            .await
        {
            warn!("Failed to release query {}: {}", delivery.message_id, e);
        }
        ProcessOutcome::Released
    }

    async fn quarantine(&self, delivery: &Delivery, reason: &str) -> ProcessOutcome {
        if let Err(e) = self.queue.dead_letter(delivery, reason).await {
            error!("Failed to dead-letter query {}: {}", delivery.message_id, e);
        }
        ProcessOutcome::Quarantined
    }
}

/// A set of identical workers sharing one queue and one answerer.
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `size` workers that stop when `shutdown` fires.
    pub fn spawn(
        size: usize,
        queue: Arc<dyn DurableQueue>,
        answerer: Arc<dyn Answerer>,
        config: WorkerConfig,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let config = Arc::new(config);
        info!(
            "Starting {} workers on '{}'",
            size, config.request_channel
        );

        (0..size)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    Arc::clone(&queue),
                    Arc::clone(&answerer),
                    Arc::clone(&config),
                );
                tokio::spawn(worker.run(shutdown.subscribe()))
            })
            .collect()
    }
}
