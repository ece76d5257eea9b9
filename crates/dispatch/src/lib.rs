//! Query dispatch: the gateway, its response fan-in and the worker pool.
//!
//! Questions travel from the [`DispatchGateway`] to the workers over the
//! request channel of a [`DurableQueue`](askq_queue::DurableQueue); answers
//! come back over the response channel and are routed to the caller that
//! asked.

pub mod fanin;
pub mod gateway;
pub mod protocol;
pub mod reaper;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod worker;

#[cfg(test)]
mod tests;

pub use fanin::ResponseFanIn;
pub use gateway::{DispatchGateway, GatewayConfig};
pub use protocol::{ErrorResponse, ResultEnvelope, SubmitRequest, SubmitResponse, SESSION_HEADER};
pub use reaper::AnswerReclaimer;
pub use service::{create_router, GatewayServer, GatewayState};
pub use store::{PendingStore, StoreConfig, StoreOutcome, StoreStats};
pub use worker::{ProcessOutcome, Worker, WorkerConfig, WorkerPool};
