//! Edge API: the HTTP front door for end users.
//!
//! The edge forwards questions to the dispatch gateway under a single
//! session of its own, keeps the gateway's result stream open in the
//! background and serves answers to its callers from a TTL cache.

pub mod cache;
pub mod client;
pub mod gateway_client;
pub mod pump;
pub mod server;

pub use cache::ResponseCache;
pub use client::EdgeClient;
pub use gateway_client::{GatewayApi, HttpGatewayClient, ResultStream};
pub use pump::ResultPump;
pub use server::{create_router, CallerIdentity, EdgeServer, EdgeState};
