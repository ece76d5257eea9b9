//! Shutdown signalling for the long-running loops.
//!
//! One broadcast sender is created per process; every loop subscribes a
//! receiver when it is spawned. Dropping the sender counts as a shutdown.

use tokio::sync::broadcast::{self, error::TryRecvError};

/// Create the process-wide shutdown sender.
pub fn channel() -> broadcast::Sender<()> {
    broadcast::channel(1).0
}

/// Non-blocking check used between loop iterations.
pub fn requested(rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(TryRecvError::Empty))
}

/// Resolve once shutdown is signalled.
pub async fn wait(mut rx: broadcast::Receiver<()>) {
    let _ = rx.recv().await;
}
