//! Error types for askq.
//!
//! This module defines a unified error enum that covers all error categories
//! in the workspace: configuration, I/O, the durable queue, the answerer,
//! dispatch routing, HTTP transport and caller input.

use thiserror::Error;

/// Unified error type for askq.
///
/// All fallible functions in the workspace return `Result<T, AppError>`.
/// We never panic; errors must be represented and propagated.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O and filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Durable queue errors (storage, connection, schema)
    #[error("Queue error: {0}")]
    Queue(String),

    /// The delivery lease was no longer held when acknowledging or releasing
    #[error("Lease expired for message {0}")]
    LeaseExpired(i64),

    /// Answerer / LLM provider errors
    #[error("LLM error: {0}")]
    Llm(String),

    /// Query routing and dispatch errors
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// HTTP transport errors between components
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Requested entity does not exist (or no longer exists)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Queue and transport failures are transient; everything else is a
    /// property of the input or configuration and will fail again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Queue(_) | AppError::Transport(_) | AppError::Io(_)
        )
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
