//! BigQuery tables API adapter.
//!
//! Only three calls are made: `tables.get` to check presence,
//! `tables.insert` with the fixed creation schema, and `tables.delete`.
//! Status codes are folded into [`BackendError`] as follows:
//!
//! | Response                        | Result        |
//! |---------------------------------|---------------|
//! | get 404                         | absent        |
//! | insert 409                      | success       |
//! | delete 404                      | success       |
//! | 401, 408, 429, 5xx, no response | `Transient`   |
//! | any other 4xx                   | `Permanent`   |

use std::time::Duration;

use async_trait::async_trait;
use bqtable_reconcile::{BackendError, DesiredState, ResourceBackend, CREATION_SCHEMA};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::auth::{AccessToken, BearerToken};

/// Default API root.
pub const DEFAULT_API_URL: &str = "https://bigquery.googleapis.com";

#[derive(Debug, Error)]
pub enum BigQueryError {
    #[error("invalid BigQuery API URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    /// API root, e.g. `https://bigquery.googleapis.com`.
    pub api_url: String,

    /// Explicit OAuth access token. Unset means application default
    /// credentials.
    pub token: BearerToken,

    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: BearerToken::None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TableReference<'a> {
    project_id: &'a str,
    dataset_id: &'a str,
    table_id: &'a str,
}

#[derive(Debug, Serialize)]
struct FieldSchema {
    name: &'static str,
    #[serde(rename = "type")]
    field_type: &'static str,
    mode: &'static str,
}

#[derive(Debug, Serialize)]
struct TableSchema {
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertTable<'a> {
    table_reference: TableReference<'a>,
    schema: TableSchema,
}

impl<'a> InsertTable<'a> {
    fn for_table(table: &'a DesiredState) -> Self {
        Self {
            table_reference: TableReference {
                project_id: &table.project,
                dataset_id: &table.dataset,
                table_id: &table.table_name,
            },
            schema: TableSchema {
                fields: CREATION_SCHEMA
                    .iter()
                    .map(|column| FieldSchema {
                        name: column.name,
                        field_type: column.field_type,
                        mode: "NULLABLE",
                    })
                    .collect(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Fold a non-success status into a backend error.
pub fn classify(status: StatusCode, body: &str) -> BackendError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.trim().to_string());
    let detail = format!("{}: {}", status.as_u16(), message);

    let transient = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::UNAUTHORIZED;

    if transient {
        BackendError::Transient(detail)
    } else {
        BackendError::Permanent(detail)
    }
}

/// [`ResourceBackend`] over the BigQuery v2 REST API.
#[derive(Debug, Clone)]
pub struct BigQueryBackend {
    http: reqwest::Client,
    base: Url,
    credentials: AccessToken,
}

impl BigQueryBackend {
    pub fn new(config: BigQueryConfig, credentials: AccessToken) -> Result<Self, BigQueryError> {
        let base = Url::parse(&config.api_url).map_err(|e| BigQueryError::InvalidUrl {
            url: config.api_url.clone(),
            reason: e.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(BigQueryError::InvalidUrl {
                url: config.api_url,
                reason: "not a base URL".to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            base,
            credentials,
        })
    }

    /// URL under the API root. Segments are percent-encoded individually.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(["bigquery", "v2"]).extend(segments);
        }
        url
    }

    fn collection_url(&self, table: &DesiredState) -> Url {
        self.url(&["projects", &table.project, "datasets", &table.dataset, "tables"])
    }

    pub fn table_url(&self, table: &DesiredState) -> Url {
        self.url(&[
            "projects",
            &table.project,
            "datasets",
            &table.dataset,
            "tables",
            &table.table_name,
        ])
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let token = self
            .credentials
            .current()
            .await
            .map_err(|e| BackendError::Transient(format!("access token unavailable: {e}")))?;

        request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))
    }

    async fn failure(response: reqwest::Response) -> BackendError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify(status, &body)
    }
}

#[async_trait]
impl ResourceBackend for BigQueryBackend {
    async fn exists(&self, table: &DesiredState) -> Result<bool, BackendError> {
        let response = self.send(self.http.get(self.table_url(table))).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::failure(response).await),
        }
    }

    async fn create_if_absent(&self, table: &DesiredState) -> Result<(), BackendError> {
        let body = InsertTable::for_table(table);
        let response = self
            .send(self.http.post(self.collection_url(table)).json(&body))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                debug!(table = %table, "Table already exists");
                Ok(())
            }
            _ => Err(Self::failure(response).await),
        }
    }

    async fn delete_if_present(&self, table: &DesiredState) -> Result<(), BackendError> {
        let response = self.send(self.http.delete(self.table_url(table))).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(table = %table, "Table already absent");
                Ok(())
            }
            _ => Err(Self::failure(response).await),
        }
    }
}
