//! HTTP surface of the gateway.
//!
//! Routes:
//! - `POST /v1/queries` submit a question (caller in the `x-session-id` header)
//! - `GET /v1/sessions/:session_id/results` NDJSON stream of results
//! - `GET /v1/sessions/:session_id/poll` results ready within `wait_ms`
//! - `GET /v1/queries/:query_id/result` claim one result by id
//! - `GET /v1/stats`, `GET /health`

use askq_core::{AppError, AppResult, QueryId, SessionId};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tokio_stream::StreamExt as _;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::gateway::DispatchGateway;
use crate::protocol::{
    ErrorResponse, PollParams, ResultEnvelope, SubmitRequest, SubmitResponse, SESSION_HEADER,
};
use crate::shutdown;

/// Longest wait a poll request may ask for.
pub const MAX_POLL_WAIT: Duration = Duration::from_secs(30);

/// Shared state of the gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub gateway: DispatchGateway,

    /// Interval of blank keep-alive lines on result streams
    pub keepalive: Duration,

    /// Result streams end when this fires so graceful shutdown can finish
    pub shutdown: broadcast::Sender<()>,
}

/// Map an error onto a status code and `{"detail": ...}` body.
pub fn error_response(err: &AppError) -> Response {
    let status = match err {
        AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {}", err);
    }
    (status, Json(ErrorResponse::new(err.to_string()))).into_response()
}

fn session_from_headers(headers: &HeaderMap) -> AppResult<SessionId> {
    let value = headers
        .get(SESSION_HEADER)
        .ok_or_else(|| AppError::InvalidInput(format!("Missing {} header", SESSION_HEADER)))?;
    let raw = value
        .to_str()
        .map_err(|_| AppError::InvalidInput(format!("Invalid {} header", SESSION_HEADER)))?;
    SessionId::parse(raw)
}

/// Build the gateway router.
pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/queries", post(submit_query))
        .route("/v1/queries/:query_id/result", get(query_result))
        .route("/v1/sessions/:session_id/results", get(stream_results))
        .route("/v1/sessions/:session_id/poll", get(poll_results))
        .route("/v1/stats", get(stats))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn submit_query(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let session = match session_from_headers(&headers) {
        Ok(session) => session,
        Err(e) => return error_response(&e),
    };

    match state.gateway.submit(&request.query, &session).await {
        Ok(query_id) => Json(SubmitResponse { query_id }).into_response(),
        Err(e) => error_response(&e),
    }
}

enum StreamEvent {
    Result(ResultEnvelope),
    KeepAlive,
    Shutdown,
}

/// One NDJSON line per event. A result that cannot be encoded has already
/// left the store, so it is logged and skipped.
fn encode_event(event: StreamEvent) -> Option<Vec<u8>> {
    match event {
        StreamEvent::Result(envelope) => match serde_json::to_vec(&envelope) {
            Ok(mut line) => {
                line.push(b'\n');
                Some(line)
            }
            Err(e) => {
                error!(query_id = %envelope.query_id, "Failed to encode result: {}", e);
                None
            }
        },
        StreamEvent::KeepAlive | StreamEvent::Shutdown => Some(b"\n".to_vec()),
    }
}

async fn stream_results(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
) -> Response {
    let session = match SessionId::parse(session_id) {
        Ok(session) => session,
        Err(e) => return error_response(&e),
    };
    info!(session = %session, "Result stream connected");

    let results = state
        .gateway
        .stream_results(session)
        .map(|result| StreamEvent::Result(ResultEnvelope::from(result)));

    let period = state.keepalive.max(Duration::from_millis(100));
    let start = tokio::time::Instant::now() + period;
    let keepalive = IntervalStream::new(tokio::time::interval_at(start, period))
        .map(|_| StreamEvent::KeepAlive);

    let stop = BroadcastStream::new(state.shutdown.subscribe()).map(|_| StreamEvent::Shutdown);

    let body = results
        .merge(keepalive)
        .merge(stop)
        .take_while(|event| !matches!(event, StreamEvent::Shutdown))
        .filter_map(encode_event)
        .map(Ok::<_, Infallible>);

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response()
}

async fn poll_results(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
    Query(params): Query<PollParams>,
) -> Response {
    let session = match SessionId::parse(session_id) {
        Ok(session) => session,
        Err(e) => return error_response(&e),
    };
    let wait = Duration::from_millis(params.wait_ms.unwrap_or(0)).min(MAX_POLL_WAIT);

    let results: Vec<ResultEnvelope> = state
        .gateway
        .poll_results(&session, wait)
        .await
        .into_iter()
        .map(ResultEnvelope::from)
        .collect();
    debug!(session = %session, "Poll returned {} results", results.len());
    Json(results).into_response()
}

async fn query_result(
    State(state): State<GatewayState>,
    Path(query_id): Path<String>,
) -> Response {
    let query_id: QueryId = match query_id.parse() {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };

    match state.gateway.result_for(query_id) {
        Some(result) => Json(ResultEnvelope::from(result)).into_response(),
        None => error_response(&AppError::NotFound(format!("No result for query {}", query_id))),
    }
}

async fn stats(State(state): State<GatewayState>) -> Response {
    match state.gateway.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(&e),
    }
}

/// HTTP server wrapping a [`DispatchGateway`].
pub struct GatewayServer {
    state: GatewayState,
}

impl GatewayServer {
    pub fn new(
        gateway: DispatchGateway,
        keepalive: Duration,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            state: GatewayState {
                gateway,
                keepalive,
                shutdown,
            },
        }
    }

    /// Bind `listen_addr` and serve until shutdown.
    pub async fn run(&self, listen_addr: &str) -> AppResult<()> {
        let addr: SocketAddr = listen_addr.parse().map_err(|e| {
            AppError::Config(format!(
                "Invalid gateway listen address '{}': {}",
                listen_addr, e
            ))
        })?;

        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            AppError::Transport(format!("Failed to bind gateway on {}: {}", addr, e))
        })?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> AppResult<()> {
        let app = create_router(self.state.clone()).layer(TraceLayer::new_for_http());
        let shutdown_rx = self.state.shutdown.subscribe();

        info!("Gateway listening on http://{}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown::wait(shutdown_rx).await;
                info!("Gateway shutting down");
            })
            .await
            .map_err(|e| AppError::Transport(format!("Gateway server error: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use askq_core::QueryResult;
    use askq_queue::{SqliteQueue, SqliteQueueConfig};
    use std::sync::Arc;

    async fn serve_gateway() -> (String, DispatchGateway, broadcast::Sender<()>) {
        let queue = Arc::new(SqliteQueue::open_in_memory(SqliteQueueConfig::default()).unwrap());
        let gateway = DispatchGateway::new(queue, GatewayConfig::default());
        let tx = shutdown::channel();
        let server = GatewayServer::new(gateway.clone(), Duration::from_secs(1), tx.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            server.serve(listener).await.unwrap();
        });
        (url, gateway, tx)
    }

    async fn submit(url: &str, session: &str, query: &str) -> QueryId {
        let response = reqwest::Client::new()
            .post(format!("{}/v1/queries", url))
            .header(SESSION_HEADER, session)
            .json(&SubmitRequest {
                query: query.to_string(),
            })
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response.json::<SubmitResponse>().await.unwrap().query_id
    }

    #[test]
    fn test_session_header_is_required() {
        let headers = HeaderMap::new();
        assert!(matches!(
            session_from_headers(&headers),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_session_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, "edge-7".parse().unwrap());
        assert_eq!(session_from_headers(&headers).unwrap().as_str(), "edge-7");
    }

    #[test]
    fn test_error_status_mapping() {
        let bad = error_response(&AppError::InvalidInput("x".to_string()));
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let missing = error_response(&AppError::NotFound("x".to_string()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let broken = error_response(&AppError::Queue("x".to_string()));
        assert_eq!(broken.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_result_event_is_one_line() {
        let envelope = ResultEnvelope {
            query_id: QueryId::new_random(),
            result: "two\nlines".to_string(),
        };
        let line = encode_event(StreamEvent::Result(envelope.clone())).unwrap();

        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(line.last(), Some(&b'\n'));
        let decoded: ResultEnvelope = serde_json::from_slice(&line).unwrap();
        assert_eq!(decoded, envelope);

        assert_eq!(encode_event(StreamEvent::KeepAlive), Some(b"\n".to_vec()));
    }

    #[tokio::test]
    async fn test_poll_without_results_returns_empty_list() {
        let (url, _gateway, tx) = serve_gateway().await;

        let started = std::time::Instant::now();
        let response = reqwest::get(format!("{}/v1/sessions/idle/poll?wait_ms=100", url))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let results: Vec<ResultEnvelope> = response.json().await.unwrap();
        assert!(results.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));

        let _ = tx.send(());
    }

    #[tokio::test]
    async fn test_poll_returns_ready_results_for_encoded_session() {
        let (url, gateway, tx) = serve_gateway().await;
        let query_id = submit(&url, "team?a", "What is heredity?").await;
        gateway
            .store()
            .store_result(QueryResult::new(query_id, "Passing traits on."));

        let response = reqwest::get(format!("{}/v1/sessions/team%3Fa/poll", url))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let results: Vec<ResultEnvelope> = response.json().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].query_id, query_id);
        assert_eq!(results[0].result, "Passing traits on.");

        let _ = tx.send(());
    }

    #[tokio::test]
    async fn test_unknown_query_id_is_not_found() {
        let (url, _gateway, tx) = serve_gateway().await;

        let response = reqwest::get(format!("{}/v1/queries/{}/result", url, QueryId::new_random()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: ErrorResponse = response.json().await.unwrap();
        assert!(body.detail.contains("No result"));

        let _ = tx.send(());
    }

    #[tokio::test]
    async fn test_malformed_query_id_is_bad_request() {
        let (url, _gateway, tx) = serve_gateway().await;

        let response = reqwest::get(format!("{}/v1/queries/not-a-uuid/result", url))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let _ = tx.send(());
    }

    #[tokio::test]
    async fn test_result_is_claimed_once_by_id() {
        let (url, gateway, tx) = serve_gateway().await;
        let query_id = submit(&url, "student", "What is heredity?").await;
        gateway
            .store()
            .store_result(QueryResult::new(query_id, "Passing traits on."));

        let result_url = format!("{}/v1/queries/{}/result", url, query_id);
        let response = reqwest::get(&result_url).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let envelope: ResultEnvelope = response.json().await.unwrap();
        assert_eq!(envelope.query_id, query_id);
        assert_eq!(envelope.result, "Passing traits on.");

        let again = reqwest::get(&result_url).await.unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);

        let _ = tx.send(());
    }
}
