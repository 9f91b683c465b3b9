//! BigQueryTable controller
//!
//! Keeps one BigQuery table per BigQueryTable declaration:
//!
//! - **Watch source**: lists and watches declarations, emitting wake-ups
//! - **Dispatcher**: serializes work per declaration across a worker pool
//! - **Reconciler**: guards each declaration with a finalizer, creates the
//!   table, and deletes it before releasing the guard

use std::time::Duration;

use anyhow::{Context, Result};
use bqtable_controller::auth::AccessToken;
use bqtable_controller::{
    BigQueryBackend, Config, Dispatcher, EventSource, KubeClient, KubeWatchSource,
};
use bqtable_reconcile::{Reconciler, ReconcilerConfig};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Buffered notifications between the source and the dispatcher.
const EVENT_BUFFER: usize = 1024;

/// How long in-flight passes get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to BQT_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting BigQueryTable controller");
    info!(
        kube_api_url = %config.kube.api_url,
        namespace = config.kube.namespace.as_deref().unwrap_or("*"),
        finalizer = %config.kube.finalizer(),
        bigquery_api_url = %config.bigquery.api_url,
        workers = config.dispatcher.workers,
        "Configuration loaded"
    );

    let kube = KubeClient::new(config.kube.clone()).context("Failed to create control-plane client")?;

    // The kind must be registered and readable before anything else runs.
    let listed = kube
        .list()
        .await
        .with_context(|| format!("Cannot list {}", kube.collection_url()))?;
    info!(count = listed.items.len(), "Control plane reachable");

    // Likewise BigQuery credentials: without them every pass would fail.
    let credentials = AccessToken::discover(config.bigquery.token.clone())
        .await
        .context("Cannot obtain BigQuery credentials")?;
    let backend = BigQueryBackend::new(config.bigquery.clone(), credentials)
        .context("Failed to create BigQuery client")?;

    let mut reconciler_config = ReconcilerConfig::for_group(&config.kube.group);
    match &config.default_project {
        Some(project) => reconciler_config = reconciler_config.with_default_project(project),
        None => warn!("GCP_PROJECT_ID not set; declarations must name their project"),
    }
    let reconciler = Reconciler::new(kube.clone(), backend, reconciler_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

    let source = KubeWatchSource::new(kube, config.resync_interval);
    let mut source_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { source.run(event_tx, shutdown_rx).await }
    });

    let dispatcher = Dispatcher::new(reconciler, config.dispatcher.clone());
    let mut dispatcher_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { dispatcher.run(event_rx, shutdown_rx).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut source_handle => {
            match result {
                Ok(Ok(())) => info!("Watch source exited"),
                Ok(Err(e)) => error!(error = %e, "Watch source error"),
                Err(e) => error!(error = %e, "Watch source task panicked"),
            }
        }
        result = &mut dispatcher_handle => {
            match result {
                Ok(Ok(())) => info!("Dispatcher exited"),
                Ok(Err(e)) => error!(error = %e, "Dispatcher error"),
                Err(e) => error!(error = %e, "Dispatcher task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for in-flight reconciliations...");
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        if !source_handle.is_finished() {
            let _ = source_handle.await;
        }
        if !dispatcher_handle.is_finished() {
            let _ = dispatcher_handle.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Shutdown grace period elapsed with work still running"
        );
    }

    info!("Controller shutdown complete");
    Ok(())
}
