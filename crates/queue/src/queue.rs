//! Durable queue abstraction.
//!
//! The queue offers named channels with at-least-once delivery. A receiver
//! gets a [`Delivery`] holding a lease; the message stays invisible to other
//! receivers until the lease is acknowledged, released, or times out.

use askq_core::AppResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// A message handed to one receiver.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned message id (stable across redeliveries)
    pub message_id: i64,

    pub channel: String,

    pub payload: Vec<u8>,

    /// How many times this message has been delivered, including this one
    pub delivery_count: u32,

    /// Token proving this receiver still holds the message
    pub lease: String,
}

impl Delivery {
    /// Whether this is a redelivery after a crash, timeout or release.
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// A message quarantined after repeated failures or because it was malformed.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub message_id: i64,
    pub channel: String,
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub delivery_count: u32,
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Payload rendered for operators (lossy UTF-8).
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Per-channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Visible and waiting for a receiver
    pub ready: u64,

    /// Leased by a receiver, or released with a delay
    pub in_flight: u64,

    pub dead_lettered: u64,
}

/// Persistent at-least-once FIFO broker with manual acknowledgment.
#[async_trait::async_trait]
pub trait DurableQueue: Send + Sync {
    /// Durably append a message to `channel`. Returns the message id once stored.
    async fn publish(&self, channel: &str, payload: &[u8]) -> AppResult<i64>;

    /// Lease the oldest visible message, waiting up to `wait` for one to arrive.
    ///
    /// Returns `Ok(None)` when nothing became available in time.
    async fn receive(&self, channel: &str, wait: Duration) -> AppResult<Option<Delivery>>;

    /// Remove a delivered message for good.
    ///
    /// Fails with `AppError::LeaseExpired` if the message was redelivered to
    /// another receiver in the meantime.
    async fn ack(&self, delivery: &Delivery) -> AppResult<()>;

    /// Give a message back without acknowledging it; it becomes visible
    /// again after `delay`. `reason` is kept for the dead-letter record.
    async fn release(&self, delivery: &Delivery, delay: Duration, reason: &str) -> AppResult<()>;

    /// Quarantine a message immediately (e.g. it can never be processed).
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> AppResult<()>;

    /// List quarantined messages of a channel, newest first.
    async fn dead_letters(&self, channel: &str, limit: usize) -> AppResult<Vec<DeadLetter>>;

    async fn stats(&self, channel: &str) -> AppResult<QueueStats>;
}
