//! askq Core Library
//!
//! This crate provides the foundational pieces shared by every askq component:
//! - Error handling (`AppError`, `AppResult`)
//! - Logging infrastructure
//! - Configuration management
//! - Domain types (`Query`, `QueryResult`, `QueryId`, `SessionId`)
//! - Retry/backoff policy

pub mod backoff;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;

// Re-export commonly used types
pub use backoff::{Backoff, BackoffPolicy};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use model::{Query, QueryId, QueryResult, SessionId};
