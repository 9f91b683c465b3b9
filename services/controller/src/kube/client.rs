//! Control-plane REST client for BigQueryTable declarations.

use std::sync::Arc;
use std::time::Duration;

use bqtable_events::{EventError, ListSnapshot, ObjectKey};
use bqtable_reconcile::{finalizer, Declaration, StoreError};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::auth::BearerToken;

/// Resource name of the declaration kind.
pub const PLURAL: &str = "bigquerytables";

/// Kind name written back when a record lacks one.
pub const KIND: &str = "BigQueryTable";

/// Errors from control-plane calls.
#[derive(Debug, Error)]
pub enum KubeError {
    /// Failed to build the HTTP client.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// The request could not be sent or the body could not be read.
    #[error("control plane request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The control plane answered with a non-success status.
    #[error("control plane returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The bearer token file could not be read.
    #[error("failed to read control plane token: {0}")]
    Token(#[from] std::io::Error),

    /// A response body could not be decoded.
    #[error("undecodable control plane response: {0}")]
    Decode(#[from] EventError),
}

impl KubeError {
    /// HTTP status, if the control plane answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            KubeError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify for the reconciler.
    pub fn into_store_error(self, key: &ObjectKey) -> StoreError {
        match self {
            KubeError::Status { status: 409, .. } => StoreError::Conflict(key.to_string()),
            KubeError::Status { status, body } if status == 429 || status >= 500 => {
                StoreError::Unavailable(format!("{status}: {body}"))
            }
            KubeError::Status { status, body } => StoreError::Rejected(format!("{status}: {body}")),
            KubeError::Request(e) if e.is_decode() => StoreError::Malformed(e.to_string()),
            KubeError::Request(e) => StoreError::Unavailable(e.to_string()),
            KubeError::Token(e) => StoreError::Unavailable(e.to_string()),
            KubeError::Client(e) => StoreError::Rejected(e.to_string()),
            KubeError::Decode(e) => StoreError::Malformed(e.to_string()),
        }
    }
}

/// Control-plane connection settings.
#[derive(Debug, Clone)]
pub struct KubeConfig {
    /// API server base URL (e.g. `http://127.0.0.1:8001` behind `kubectl proxy`).
    pub api_url: String,

    /// Credentials for the API server.
    pub token: BearerToken,

    /// Restrict to one namespace; `None` watches all namespaces.
    pub namespace: Option<String>,

    /// API group of the declaration kind.
    pub group: String,

    /// API version of the declaration kind.
    pub version: String,

    /// Timeout for non-streaming requests.
    pub request_timeout: Duration,
}

impl KubeConfig {
    /// Guard token for this group.
    pub fn finalizer(&self) -> String {
        finalizer::token_for_group(&self.group)
    }

    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

/// Control-plane REST client.
#[derive(Debug, Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    config: Arc<KubeConfig>,
}

impl KubeClient {
    /// Create a new client.
    ///
    /// No overall timeout is set on the HTTP client because watch responses
    /// stream for minutes; plain requests carry `request_timeout` instead.
    pub fn new(config: KubeConfig) -> Result<Self, KubeError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(KubeError::Client)?;

        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &KubeConfig {
        &self.config
    }

    fn base(&self) -> String {
        format!(
            "{}/apis/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.group,
            self.config.version
        )
    }

    /// URL of the collection, scoped to the configured namespace if any.
    pub fn collection_url(&self) -> String {
        match &self.config.namespace {
            Some(ns) => format!("{}/namespaces/{}/{}", self.base(), ns, PLURAL),
            None => format!("{}/{}", self.base(), PLURAL),
        }
    }

    pub fn object_url(&self, key: &ObjectKey) -> String {
        format!(
            "{}/namespaces/{}/{}/{}",
            self.base(),
            key.namespace,
            PLURAL,
            key.name
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, KubeError> {
        let request = self.config.token.apply(request).await?;
        Ok(request.send().await?)
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, KubeError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(KubeError::Status { status, body })
    }

    /// List every declaration in scope.
    pub async fn list(&self) -> Result<ListSnapshot, KubeError> {
        let url = self.collection_url();
        debug!(url = %url, "Listing declarations");

        let response = self
            .send(self.http.get(&url).timeout(self.config.request_timeout))
            .await?;
        let body = Self::expect_success(response).await?.bytes().await?;
        Ok(ListSnapshot::from_slice(&body)?)
    }

    /// Open a watch from `resource_version`. The caller reads the streaming body.
    pub async fn watch(
        &self,
        resource_version: &str,
        timeout_secs: u64,
    ) -> Result<reqwest::Response, KubeError> {
        let url = self.collection_url();
        debug!(url = %url, resource_version, timeout_secs, "Opening watch");

        let timeout = timeout_secs.to_string();
        let request = self.http.get(&url).query(&[
            ("watch", "1"),
            ("allowWatchBookmarks", "true"),
            ("resourceVersion", resource_version),
            ("timeoutSeconds", timeout.as_str()),
        ]);
        let response = self.send(request).await?;
        Self::expect_success(response).await
    }

    /// Fetch one declaration. `Ok(None)` on 404.
    pub async fn get(&self, key: &ObjectKey) -> Result<Option<Declaration>, KubeError> {
        let response = self
            .send(
                self.http
                    .get(self.object_url(key))
                    .timeout(self.config.request_timeout),
            )
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body = Self::expect_success(response).await?.bytes().await?;
        Declaration::from_slice(&body)
            .map(Some)
            .map_err(|e| KubeError::Decode(EventError::InvalidPayload(e.to_string())))
    }

    /// Replace one declaration, guarded by its `resourceVersion`.
    pub async fn replace(&self, declaration: &Declaration) -> Result<Declaration, KubeError> {
        let mut body = declaration.clone();
        if body.api_version.is_none() {
            body.api_version = Some(self.config.api_version());
        }
        if body.kind.is_none() {
            body.kind = Some(KIND.to_string());
        }

        let response = self
            .send(
                self.http
                    .put(self.object_url(&declaration.key()))
                    .json(&body)
                    .timeout(self.config.request_timeout),
            )
            .await?;

        let body = Self::expect_success(response).await?.bytes().await?;
        Declaration::from_slice(&body)
            .map_err(|e| KubeError::Decode(EventError::InvalidPayload(e.to_string())))
    }
}
