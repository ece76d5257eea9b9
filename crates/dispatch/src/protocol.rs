//! Wire formats.
//!
//! Queue messages are compact JSON objects. The request channel carries
//! [`RequestMessage`]s and the response channel carries [`ResponseMessage`]s.
//! The remaining types are the JSON bodies of the gateway's HTTP surface.

use askq_core::{AppError, AppResult, Query, QueryId, QueryResult, SessionId};
use askq_queue::QueueStats;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::store::StoreStats;

/// Header carrying the caller's session id.
pub const SESSION_HEADER: &str = "x-session-id";

/// Maximum accepted question length in bytes.
pub const MAX_QUERY_LENGTH: usize = 8 * 1024;

/// Message on the request channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub query_id: QueryId,

    pub query: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<SessionId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl From<&Query> for RequestMessage {
    fn from(query: &Query) -> Self {
        Self {
            query_id: query.id,
            query: query.text.clone(),
            submitted_by: Some(query.submitted_by.clone()),
            submitted_at: Some(query.submitted_at),
        }
    }
}

/// Message on the response channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub query_id: QueryId,

    pub result: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produced_at: Option<DateTime<Utc>>,
}

impl From<&QueryResult> for ResponseMessage {
    fn from(result: &QueryResult) -> Self {
        Self {
            query_id: result.query_id,
            result: result.payload.clone(),
            produced_at: Some(result.produced_at),
        }
    }
}

impl ResponseMessage {
    pub fn into_result(self) -> QueryResult {
        QueryResult {
            query_id: self.query_id,
            payload: self.result,
            produced_at: self.produced_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Serialize a queue message.
pub fn encode<T: Serialize>(message: &T) -> AppResult<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Deserialize a queue message.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> AppResult<T> {
    serde_json::from_slice(payload)
        .map_err(|e| AppError::Serialization(format!("Malformed queue message: {}", e)))
}

/// `POST /v1/queries` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub query: String,
}

/// `POST /v1/queries` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub query_id: QueryId,
}

/// One result as seen by gateway clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub query_id: QueryId,
    pub result: String,
}

impl From<QueryResult> for ResultEnvelope {
    fn from(result: QueryResult) -> Self {
        Self {
            query_id: result.query_id,
            result: result.payload,
        }
    }
}

/// Error body, shaped like `{"detail": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

impl ErrorResponse {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// `?wait_ms=` query parameter of poll endpoints.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PollParams {
    pub wait_ms: Option<u64>,
}

/// `GET /v1/stats` response.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub store: StoreStats,
    pub requests: QueueStats,
    pub responses: QueueStats,
}
