//! HTTP surface of the edge.
//!
//! - `POST /submit-query` `{"query": ...}` -> `{"query_id": ...}`
//! - `GET /get-response[?wait_ms=N]` -> `{question: answer, ...}` or 404
//! - `GET /health`
//!
//! Callers are told apart by the `x-session-id` header, or by their peer
//! address when the header is absent.

use askq_core::config::EdgeSettings;
use askq_core::{AppError, AppResult, SessionId};
use askq_dispatch::protocol::PollParams;
use askq_dispatch::{shutdown, ErrorResponse, SubmitRequest, SubmitResponse, SESSION_HEADER};
use axum::{
    extract::{ConnectInfo, FromRequestParts, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cache::ResponseCache;
use crate::gateway_client::GatewayApi;
use crate::pump::ResultPump;

/// Shared state of the edge handlers.
#[derive(Clone)]
pub struct EdgeState {
    pub gateway: Arc<dyn GatewayApi>,
    pub cache: Arc<ResponseCache>,

    /// Session the edge uses for all of its gateway traffic
    pub session: SessionId,

    pub settings: EdgeSettings,
}

/// The caller of an edge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub SessionId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let reject = |e: AppError| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(e.to_string())),
            )
        };

        if let Some(value) = parts.headers.get(SESSION_HEADER) {
            let raw = value.to_str().map_err(|_| {
                reject(AppError::InvalidInput(format!("Invalid {} header", SESSION_HEADER)))
            })?;
            return SessionId::parse(raw).map(CallerIdentity).map_err(reject);
        }

        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return SessionId::parse(format!("peer-{}", addr.ip()))
                .map(CallerIdentity)
                .map_err(reject);
        }

        Err(reject(AppError::InvalidInput(format!(
            "Missing {} header",
            SESSION_HEADER
        ))))
    }
}

fn detail(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}

/// Build the edge router.
pub fn create_router(state: EdgeState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/submit-query", post(submit_query))
        .route("/get-response", get(get_response))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn submit_query(
    State(state): State<EdgeState>,
    CallerIdentity(caller): CallerIdentity,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let question = request.query.trim();
    if question.is_empty() {
        return detail(StatusCode::BAD_REQUEST, "Query must not be empty");
    }

    match state.gateway.submit(question, &state.session).await {
        Ok(query_id) => {
            state.cache.record_submission(query_id, &caller, question);
            debug!(caller = %caller, query_id = %query_id, "Question forwarded");
            Json(SubmitResponse { query_id }).into_response()
        }
        Err(AppError::InvalidInput(message)) => detail(StatusCode::BAD_REQUEST, message),
        Err(e) => {
            error!("Gateway submit failed: {}", e);
            detail(StatusCode::INTERNAL_SERVER_ERROR, format!("Gateway error: {}", e))
        }
    }
}

async fn get_response(
    State(state): State<EdgeState>,
    CallerIdentity(caller): CallerIdentity,
    Query(params): Query<PollParams>,
) -> Response {
    let wait = state.settings.poll_wait(params.wait_ms);
    let answers = state.cache.wait_for_answers(&caller, wait).await;

    if answers.is_empty() {
        return detail(StatusCode::NOT_FOUND, "no response");
    }
    Json(answers).into_response()
}

/// Edge server with its background result pump.
pub struct EdgeServer {
    state: EdgeState,
    shutdown: broadcast::Sender<()>,
}

impl EdgeServer {
    /// Create the server state. The edge session is taken from the settings
    /// or generated.
    pub fn new(
        settings: EdgeSettings,
        gateway: Arc<dyn GatewayApi>,
        shutdown: broadcast::Sender<()>,
    ) -> AppResult<Self> {
        let session = match settings.session_id.as_deref() {
            Some(id) => SessionId::parse(id)?,
            None => SessionId::parse(format!("edge-{}", Uuid::new_v4()))?,
        };
        let cache = Arc::new(ResponseCache::new(settings.cache_ttl()));

        Ok(Self {
            state: EdgeState {
                gateway,
                cache,
                session,
                settings,
            },
            shutdown,
        })
    }

    pub fn state(&self) -> &EdgeState {
        &self.state
    }

    /// Spawn the task that feeds gateway results into the cache.
    pub fn start_pump(&self) -> JoinHandle<()> {
        let pump = ResultPump::new(
            Arc::clone(&self.state.gateway),
            self.state.session.clone(),
            Arc::clone(&self.state.cache),
            self.state.settings.reconnect,
        );
        tokio::spawn(pump.run(self.shutdown.subscribe()))
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> AppResult<()> {
        let addr: SocketAddr = self.state.settings.listen_addr.parse().map_err(|e| {
            AppError::Config(format!(
                "Invalid edge listen address '{}': {}",
                self.state.settings.listen_addr, e
            ))
        })?;

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to bind edge on {}: {}", addr, e)))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> AppResult<()> {
        let app = create_router(self.state.clone()).layer(TraceLayer::new_for_http());
        let shutdown_rx = self.shutdown.subscribe();

        info!(
            "Edge listening on http://{} (gateway session {})",
            listener.local_addr()?,
            self.state.session
        );

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                shutdown::wait(shutdown_rx).await;
                info!("Edge shutting down");
            })
            .await
            .map_err(|e| AppError::Transport(format!("Edge server error: {}", e)))?;

        Ok(())
    }
}
