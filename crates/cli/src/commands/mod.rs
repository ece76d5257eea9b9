//! Command handlers for the askq CLI.
//!
//! This module organizes all CLI commands into separate submodules.

pub mod ask;
pub mod edge;
pub mod gateway;
pub mod queue;
pub mod worker;

// Re-export command types for convenience
pub use ask::AskCommand;
pub use edge::EdgeCommand;
pub use gateway::GatewayCommand;
pub use queue::QueueCommand;
pub use worker::WorkerCommand;

use askq_core::{config::AppConfig, AppResult};
use askq_queue::SqliteQueue;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Open the durable queue configured for this workspace.
pub fn open_queue(config: &AppConfig) -> AppResult<Arc<SqliteQueue>> {
    let path = config.queue_path();
    tracing::debug!("Opening queue at {:?}", path);
    let queue = SqliteQueue::open(&path, (&config.queue).into())?;
    Ok(Arc::new(queue))
}

/// Fire `shutdown` on Ctrl-C.
pub fn shutdown_on_ctrl_c(shutdown: broadcast::Sender<()>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Ctrl-C received, shutting down"),
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = shutdown.send(());
    });
}

/// Wait for spawned background tasks, logging any that panicked.
pub async fn join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Background task failed: {}", e);
        }
    }
}
