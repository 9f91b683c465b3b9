//! Change-notification source interface.

use async_trait::async_trait;
use bqtable_events::ReconcileEvent;
use tokio::sync::{mpsc, watch};

/// Produces wake-up signals for declarations.
///
/// Delivery is at-least-once: duplicates, replays after a relist, and
/// reordering relative to the true history are all expected.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Push events into `tx` until shutdown is signaled or the receiver goes
    /// away. Transient stream failures are handled internally.
    async fn run(
        &self,
        tx: mpsc::Sender<ReconcileEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()>;
}

/// Resolves once shutdown is signaled or the sender is dropped.
pub async fn shutdown_signaled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
