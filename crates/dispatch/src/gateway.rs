//! The dispatch gateway.
//!
//! Accepts questions, publishes them on the request channel and hands each
//! caller the results of its own queries. Routing state lives in a
//! [`PendingStore`]; results reach the store through the single
//! [`ResponseFanIn`](crate::fanin::ResponseFanIn) consumer.

use askq_core::config::AppConfig;
use askq_core::{AppError, AppResult, BackoffPolicy, Query, QueryId, QueryResult, SessionId};
use askq_queue::{with_backoff, DurableQueue};
use futures::Stream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fanin::ResponseFanIn;
use crate::protocol::{self, GatewayStats, RequestMessage, MAX_QUERY_LENGTH};
use crate::reaper::AnswerReclaimer;
use crate::store::{PendingStore, StoreConfig};

/// Fresh ids drawn before giving up on a collision.
const ID_ATTEMPTS: usize = 3;

/// Gateway tuning, resolved from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub request_channel: String,
    pub response_channel: String,

    /// Upper bound on how long a result stream sleeps between checks
    pub stream_poll_interval: Duration,

    /// How long the fan-in blocks on one receive
    pub receive_wait: Duration,

    pub reap_interval: Duration,
    pub publish_retry: BackoffPolicy,
    pub store: StoreConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_channel: "query_requests".to_string(),
            response_channel: "query_responses".to_string(),
            stream_poll_interval: Duration::from_millis(500),
            receive_wait: Duration::from_secs(1),
            reap_interval: Duration::from_secs(30),
            publish_retry: BackoffPolicy::default(),
            store: StoreConfig::default(),
        }
    }
}

impl From<&AppConfig> for GatewayConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            request_channel: config.queue.request_channel.clone(),
            response_channel: config.queue.response_channel.clone(),
            stream_poll_interval: config.gateway.stream_poll_interval(),
            receive_wait: Duration::from_secs(1),
            reap_interval: config.gateway.reap_interval(),
            publish_retry: config.gateway.publish_retry,
            store: StoreConfig {
                session_ttl: config.gateway.session_ttl(),
                result_ttl: config.gateway.result_ttl(),
            },
        }
    }
}

/// Handle to the gateway. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct DispatchGateway {
    queue: Arc<dyn DurableQueue>,
    store: Arc<PendingStore>,
    config: Arc<GatewayConfig>,
    fan_in_started: Arc<AtomicBool>,
}

impl DispatchGateway {
    pub fn new(queue: Arc<dyn DurableQueue>, config: GatewayConfig) -> Self {
        let store = Arc::new(PendingStore::new(config.store));
        Self {
            queue,
            store,
            config: Arc::new(config),
            fan_in_started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PendingStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn DurableQueue> {
        &self.queue
    }

    /// Spawn the response fan-in and the answer reclaimer.
    ///
    /// The fan-in is the only consumer of the response channel for this
    /// gateway, so a second call fails.
    pub fn start_background(
        &self,
        shutdown: &broadcast::Sender<()>,
    ) -> AppResult<Vec<JoinHandle<()>>> {
        if self.fan_in_started.swap(true, Ordering::SeqCst) {
            return Err(AppError::Dispatch(
                "Response fan-in is already running".to_string(),
            ));
        }

        let fan_in = ResponseFanIn::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.store),
            self.config.response_channel.clone(),
            self.config.receive_wait,
        );
        let reclaimer = AnswerReclaimer::new(Arc::clone(&self.store), self.config.reap_interval);

        Ok(vec![
            tokio::spawn(fan_in.run(shutdown.subscribe())),
            tokio::spawn(reclaimer.run(shutdown.subscribe())),
        ])
    }

    /// Accept a question from `session` and publish it for the workers.
    ///
    /// The query is registered before it is published, so a result can
    /// never arrive for an id the gateway does not know. A failed publish
    /// rolls the registration back.
    pub async fn submit(&self, text: &str, session: &SessionId) -> AppResult<QueryId> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::InvalidInput("Query must not be empty".to_string()));
        }
        if text.len() > MAX_QUERY_LENGTH {
            return Err(AppError::InvalidInput(format!(
                "Query length {} exceeds maximum allowed length of {} bytes",
                text.len(),
                MAX_QUERY_LENGTH
            )));
        }

        let query = self.register_new(text, session)?;
        let payload = protocol::encode(&RequestMessage::from(&query))?;

        let published = with_backoff(&self.config.publish_retry, "publish query", || {
            self.queue.publish(&self.config.request_channel, &payload)
        })
        .await;

        if let Err(e) = published {
            self.store.unregister(query.id);
            warn!("Failed to publish query {}: {}", query.id, e);
            return Err(e);
        }

        info!(query_id = %query.id, session = %session, "Query submitted");
        Ok(query.id)
    }

    fn register_new(&self, text: &str, session: &SessionId) -> AppResult<Query> {
        let mut last_err = None;
        for _ in 0..ID_ATTEMPTS {
            let query = Query::new(text, session.clone());
            match self.store.register(query.id, session) {
                Ok(()) => return Ok(query),
                Err(e) => {
                    warn!("Query id collision, drawing a new id: {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| AppError::Dispatch("Could not allocate a query id".to_string())))
    }

    /// Endless stream of results for `session`, in arrival order.
    ///
    /// A result counts as delivered once the stream yields it. Dropping the
    /// stream loses nothing that was not yet yielded, so a caller may
    /// reconnect and pick up where it left off.
    pub fn stream_results(
        &self,
        session: SessionId,
    ) -> impl Stream<Item = QueryResult> + Send + 'static {
        let store = Arc::clone(&self.store);
        let interval = self.config.stream_poll_interval.max(Duration::from_millis(10));
        debug!(session = %session, "Result stream opened");

        futures::stream::unfold((store, session), move |(store, session)| async move {
            loop {
                let notify = store.subscribe(&session);
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(result) = store.take_next(&session) {
                    debug!(session = %session, query_id = %result.query_id, "Streaming result");
                    return Some((result, (store, session)));
                }

                let _ = tokio::time::timeout(interval, notified).await;
            }
        })
    }

    /// Wait up to `wait` for results and return whatever is ready.
    pub async fn poll_results(&self, session: &SessionId, wait: Duration) -> Vec<QueryResult> {
        let ready = self.store.take_all(session);
        if !ready.is_empty() || wait.is_zero() {
            return ready;
        }

        self.store.wait_ready(session, wait).await;
        self.store.take_all(session)
    }

    /// Claim the result of one query by id.
    pub fn result_for(&self, query_id: QueryId) -> Option<QueryResult> {
        self.store.claim(query_id)
    }

    pub async fn stats(&self) -> AppResult<GatewayStats> {
        Ok(GatewayStats {
            store: self.store.stats(),
            requests: self.queue.stats(&self.config.request_channel).await?,
            responses: self.queue.stats(&self.config.response_channel).await?,
        })
    }
}
