//! List-then-watch event source.
//!
//! Each cycle lists every declaration (emitting `Added` for each), then
//! watches from the list's resource version, resuming from the latest
//! version or bookmark seen whenever the server closes the stream. A cycle
//! ends when the resume point expires or the resync interval elapses, and
//! the next cycle lists again.

use std::time::Duration;

use async_trait::async_trait;
use bqtable_events::{LineDecoder, Notification, ReconcileEvent};
use bqtable_reconcile::BackoffPolicy;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::{KubeClient, KubeError};
use crate::source::{shutdown_signaled, EventSource};

/// Default server-side timeout for one watch request.
pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(290);

/// Why a list/watch cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleEnd {
    /// Resync interval elapsed.
    Resync,
    /// Resume point too old.
    Expired,
    /// Nobody is listening any more.
    Closed,
}

/// Event source over the control plane's list/watch API.
pub struct KubeWatchSource {
    client: KubeClient,
    resync_interval: Duration,
    watch_timeout: Duration,
    backoff: BackoffPolicy,
}

impl KubeWatchSource {
    pub fn new(client: KubeClient, resync_interval: Duration) -> Self {
        Self {
            client,
            resync_interval,
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    async fn list_and_watch(&self, tx: &mpsc::Sender<ReconcileEvent>) -> Result<CycleEnd, KubeError> {
        let list = self.client.list().await?;
        let mut resource_version = list.metadata.resource_version.clone().unwrap_or_default();

        let mut listed = 0usize;
        for event in list.events() {
            match event {
                Ok(event) => {
                    listed += 1;
                    if tx.send(event).await.is_err() {
                        return Ok(CycleEnd::Closed);
                    }
                }
                Err(e) => warn!(error = %e, "Skipping malformed list item"),
            }
        }
        info!(count = listed, resource_version = %resource_version, "Listed declarations");

        let deadline = Instant::now() + self.resync_interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(CycleEnd::Resync);
            }
            let timeout_secs = self
                .watch_timeout
                .min(deadline - now)
                .as_secs()
                .max(1);

            // The server-side timeout is advisory; the deadline also bounds
            // the request and every read so a stalled stream cannot hold
            // off the relist.
            let request = self.client.watch(&resource_version, timeout_secs);
            let response = match timeout_at(deadline, request).await {
                Err(_) => {
                    warn!("Watch request stalled past resync deadline");
                    return Ok(CycleEnd::Resync);
                }
                Ok(Err(KubeError::Status { status: 410, .. })) => return Ok(CycleEnd::Expired),
                Ok(other) => other?,
            };

            let mut body = response.bytes_stream();
            let mut decoder = LineDecoder::new();
            loop {
                let chunk = match timeout_at(deadline, body.next()).await {
                    Err(_) => {
                        debug!("Watch stream idle at resync deadline");
                        return Ok(CycleEnd::Resync);
                    }
                    Ok(None) => break,
                    Ok(Some(chunk)) => chunk?,
                };
                for line in decoder.push(&chunk)? {
                    match Notification::from_line(&line) {
                        Ok(Notification::Change(event)) => {
                            if let Some(rv) = &event.resource_version {
                                resource_version = rv.clone();
                            }
                            debug!(kind = %event.kind, key = %event.key, "Received notification");
                            if tx.send(event).await.is_err() {
                                return Ok(CycleEnd::Closed);
                            }
                        }
                        Ok(Notification::Bookmark { resource_version: rv }) => {
                            resource_version = rv;
                        }
                        Ok(Notification::Expired { message }) => {
                            info!(message = %message, "Watch resume point expired");
                            return Ok(CycleEnd::Expired);
                        }
                        Ok(Notification::Failed { code, message }) => {
                            return Err(KubeError::Status {
                                status: code.unwrap_or(500),
                                body: message,
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Skipping malformed notification");
                        }
                    }
                }
            }

            debug!(resource_version = %resource_version, "Watch closed by server, resuming");
        }
    }
}

#[async_trait]
impl EventSource for KubeWatchSource {
    async fn run(
        &self,
        tx: mpsc::Sender<ReconcileEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(
            resync_interval_secs = self.resync_interval.as_secs(),
            url = %self.client.collection_url(),
            "Starting watch source"
        );

        let mut failures = 0u32;
        loop {
            tokio::select! {
                result = self.list_and_watch(&tx) => match result {
                    Ok(CycleEnd::Closed) => {
                        info!("Notification receiver closed, stopping watch source");
                        return Ok(());
                    }
                    Ok(end) => {
                        failures = 0;
                        debug!(reason = ?end, "Re-listing declarations");
                    }
                    Err(e) => {
                        let delay = self.backoff.delay(failures);
                        failures = failures.saturating_add(1);
                        warn!(
                            error = %e,
                            failures,
                            retry_in_ms = delay.as_millis() as u64,
                            "List/watch failed, will retry"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown_signaled(&mut shutdown) => {
                                info!("Watch source shutting down");
                                return Ok(());
                            }
                        }
                    }
                },
                _ = shutdown_signaled(&mut shutdown) => {
                    info!("Watch source shutting down");
                    return Ok(());
                }
            }
        }
    }
}
