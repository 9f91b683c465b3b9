//! Controller configuration (env-driven).

use std::time::Duration;

use anyhow::{Context, Result};
use bqtable_reconcile::{BackoffPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};

use crate::auth::BearerToken;
use crate::bigquery::{BigQueryConfig, DEFAULT_API_URL};
use crate::dispatcher::DispatcherConfig;
use crate::kube::KubeConfig;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane connection.
    pub kube: KubeConfig,

    /// BigQuery connection.
    pub bigquery: BigQueryConfig,

    /// Project used when a declaration names none.
    pub default_project: Option<String>,

    /// Worker pool and retry settings.
    pub dispatcher: DispatcherConfig,

    /// How often the full declaration list is re-read.
    pub resync_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let request_timeout =
            Duration::from_secs(parse(&var, "BQT_REQUEST_TIMEOUT_SECS", 30u64)?.max(1));

        let kube = KubeConfig {
            api_url: var("BQT_KUBE_API_URL").unwrap_or_else(|| "http://127.0.0.1:8001".to_string()),
            token: BearerToken::from_vars(var("BQT_KUBE_TOKEN"), var("BQT_KUBE_TOKEN_FILE")),
            namespace: var("BQT_NAMESPACE"),
            group: var("BQT_GROUP").unwrap_or_else(|| "mahdi.dev".to_string()),
            version: var("BQT_VERSION").unwrap_or_else(|| "v1".to_string()),
            request_timeout,
        };

        let bigquery = BigQueryConfig {
            api_url: var("BQT_BIGQUERY_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            token: BearerToken::from_vars(
                var("BQT_GCP_ACCESS_TOKEN"),
                var("BQT_GCP_ACCESS_TOKEN_FILE"),
            ),
            request_timeout,
        };

        let dispatcher = DispatcherConfig {
            workers: parse(&var, "BQT_WORKERS", 4usize)?.max(1),
            reconcile_timeout: Duration::from_secs(
                parse(&var, "BQT_RECONCILE_TIMEOUT_SECS", 30u64)?.max(1),
            ),
            max_retries: parse(&var, "BQT_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            retry_window: DEFAULT_RETRY_WINDOW,
            backoff: BackoffPolicy::default(),
        };

        let resync_interval =
            Duration::from_secs(parse(&var, "BQT_RESYNC_INTERVAL_SECS", 300u64)?.max(1));

        Ok(Self {
            kube,
            bigquery,
            default_project: var("GCP_PROJECT_ID"),
            dispatcher,
            resync_interval,
            log_level: var("BQT_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parse<T, F>(var: &F, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|v| v.trim().parse())
        .transpose()
        .with_context(|| format!("{name} must be a non-negative integer."))
        .map(|v| v.unwrap_or(default))
}
