//! Durable queue for askq.
//!
//! This crate provides the request/response broker the dispatch fabric is
//! built on: named channels, at-least-once delivery with leases, manual
//! acknowledgment, bounded redelivery and a dead-letter table.
//!
//! # Example
//! ```no_run
//! use askq_queue::{DurableQueue, SqliteQueue, SqliteQueueConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> askq_core::AppResult<()> {
//! let queue = SqliteQueue::open_in_memory(SqliteQueueConfig::default())?;
//! queue.publish("query_requests", br#"{"query":"hi"}"#).await?;
//! if let Some(delivery) = queue.receive("query_requests", Duration::from_secs(1)).await? {
//!     queue.ack(&delivery).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod queue;
pub mod retry;
pub mod sqlite;

pub use queue::{DeadLetter, Delivery, DurableQueue, QueueStats};
pub use retry::with_backoff;
pub use sqlite::{SqliteQueue, SqliteQueueConfig};
