//! Domain types shared by every askq component.
//!
//! A [`Query`] is created once at submission and never mutated. A
//! [`QueryResult`] is produced by a worker and routed back to the caller
//! that owns the matching query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Maximum accepted length of a caller-supplied session id.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Globally unique query identifier (random 128-bit UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(Uuid);

impl QueryId {
    /// Generate a fresh random id.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for QueryId {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| AppError::InvalidInput(format!("Invalid query id: {}", s)))
    }
}

/// Caller identity used to route results back to the submitter.
///
/// Session ids are opaque, caller-chosen tokens. They must be stable across
/// reconnects, which is why routing never relies on transport addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Validate and wrap a session id.
    pub fn parse(raw: impl Into<String>) -> AppResult<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(AppError::InvalidInput("Session id is empty".to_string()));
        }

        if trimmed.len() > MAX_SESSION_ID_LEN {
            return Err(AppError::InvalidInput(format!(
                "Session id exceeds {} bytes",
                MAX_SESSION_ID_LEN
            )));
        }

        if trimmed.chars().any(|c| c.is_control() || c == '/') {
            return Err(AppError::InvalidInput(
                "Session id contains forbidden characters".to_string(),
            ));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = AppError;

    fn try_from(value: String) -> AppResult<Self> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

/// A submitted natural-language question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: QueryId,
    pub text: String,
    pub submitted_by: SessionId,
    pub submitted_at: DateTime<Utc>,
}

impl Query {
    /// Create a query with a fresh id, stamped now.
    pub fn new(text: impl Into<String>, submitted_by: SessionId) -> Self {
        Self {
            id: QueryId::new_random(),
            text: text.into(),
            submitted_by,
            submitted_at: Utc::now(),
        }
    }
}

/// The answer produced for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: QueryId,
    pub payload: String,
    pub produced_at: DateTime<Utc>,
}

impl QueryResult {
    pub fn new(query_id: QueryId, payload: impl Into<String>) -> Self {
        Self {
            query_id,
            payload: payload.into(),
            produced_at: Utc::now(),
        }
    }
}
