//! Bearer credentials for outbound HTTP calls.
//!
//! Tokens are either fixed at startup or read from a file on every request,
//! so that a sidecar or projected volume can rotate them underneath us.
//! BigQuery calls fall back to Google application default credentials when
//! no token is configured.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use gcp_auth::TokenProvider;
use reqwest::RequestBuilder;
use thiserror::Error;
use tracing::{debug, info};

/// OAuth scope requested from application default credentials.
pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("failed to read token file: {0}")]
    Io(#[from] std::io::Error),

    #[error("configured token is empty")]
    Empty,

    #[error("application default credentials unavailable: {0}")]
    Gcp(#[from] gcp_auth::Error),
}

#[derive(Debug, Clone, Default)]
pub enum BearerToken {
    /// Send no `Authorization` header.
    #[default]
    None,

    /// A fixed token.
    Static(String),

    /// Re-read this file on every request.
    File(PathBuf),
}

impl BearerToken {
    /// Pick a token from a value variable or a file variable. The value wins.
    pub fn from_vars(value: Option<String>, file: Option<String>) -> Self {
        match (value.filter(|v| !v.trim().is_empty()), file) {
            (Some(token), _) => BearerToken::Static(token.trim().to_string()),
            (None, Some(path)) if !path.is_empty() => BearerToken::File(PathBuf::from(path)),
            _ => BearerToken::None,
        }
    }

    /// Current token, if any.
    pub async fn resolve(&self) -> std::io::Result<Option<String>> {
        match self {
            BearerToken::None => Ok(None),
            BearerToken::Static(token) => Ok(Some(token.clone())),
            BearerToken::File(path) => {
                let raw = tokio::fs::read_to_string(path).await?;
                let token = raw.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
        }
    }

    /// Attach the token to a request.
    pub async fn apply(&self, request: RequestBuilder) -> std::io::Result<RequestBuilder> {
        Ok(match self.resolve().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    pub fn is_configured(&self) -> bool {
        !matches!(self, BearerToken::None)
    }
}

/// Where BigQuery access tokens come from.
#[derive(Clone)]
pub enum AccessToken {
    /// An explicitly configured token.
    Bearer(BearerToken),

    /// Application default credentials (metadata server, workload identity,
    /// `GOOGLE_APPLICATION_CREDENTIALS`, gcloud).
    Provider(Arc<dyn TokenProvider>),
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessToken::Bearer(token) => f.debug_tuple("Bearer").field(token).finish(),
            AccessToken::Provider(_) => f.debug_tuple("Provider").finish_non_exhaustive(),
        }
    }
}

impl AccessToken {
    /// Use `configured` if set, otherwise application default credentials,
    /// and fetch one token so that missing credentials fail at startup.
    pub async fn discover(configured: BearerToken) -> Result<Self, CredentialsError> {
        let credentials = if configured.is_configured() {
            AccessToken::Bearer(configured)
        } else {
            debug!("No BigQuery token configured, using application default credentials");
            AccessToken::Provider(gcp_auth::provider().await?)
        };

        credentials.current().await?;
        info!(source = credentials.source(), "BigQuery credentials verified");
        Ok(credentials)
    }

    /// A token valid for the next request.
    pub async fn current(&self) -> Result<String, CredentialsError> {
        match self {
            AccessToken::Bearer(token) => token.resolve().await?.ok_or(CredentialsError::Empty),
            AccessToken::Provider(provider) => {
                let token = provider.token(&[BIGQUERY_SCOPE]).await?;
                Ok(token.as_str().to_string())
            }
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            AccessToken::Bearer(BearerToken::File(_)) => "token_file",
            AccessToken::Bearer(_) => "token",
            AccessToken::Provider(_) => "application_default",
        }
    }
}
