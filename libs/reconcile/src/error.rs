//! Error taxonomy for reconciliation.
//!
//! Every error is scoped to a single declaration. [`ReconcileError::is_retryable`]
//! is the only classification the dispatcher needs.

use std::time::Duration;

use bqtable_events::ObjectKey;
use thiserror::Error;

/// The declaration's spec cannot be turned into a desired state.
///
/// Permanent: retrying without a user edit gives the same answer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("project unset")]
    ProjectUnset,

    #[error("dataset unset")]
    DatasetUnset,

    #[error("spec.{field} must be a string")]
    InvalidField { field: &'static str },
}

/// Failure from the external table service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Network, rate limit or server-side failure. Retried with backoff.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The request can never succeed as issued (e.g. malformed identifiers).
    #[error("permanent backend error: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// Failure from the declaration store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Stale resource version on update. Expected; re-read and re-decide.
    #[error("conflict: {0} was modified concurrently")]
    Conflict(String),

    /// The store could not be reached or answered with a server error.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the request.
    #[error("store rejected request: {0}")]
    Rejected(String),

    /// The stored record could not be decoded.
    #[error("malformed declaration: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Result type for a single reconciliation.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The declaration is misconfigured; stuck until the user fixes it.
    #[error("invalid declaration {key}: {source}")]
    Config {
        key: ObjectKey,
        #[source]
        source: ConfigError,
    },

    /// The external service failed.
    #[error("backend error for {key}: {source}")]
    Backend {
        key: ObjectKey,
        #[source]
        source: BackendError,
    },

    /// The declaration store failed (other than a conflict).
    #[error("store error for {key}: {source}")]
    Store {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },

    /// The declaration kept changing underneath every attempt.
    #[error("conflict: {key} changed during {attempts} reconciliation attempts")]
    Conflict { key: ObjectKey, attempts: u32 },

    /// Deadline expired before the pass finished.
    #[error("timeout after {elapsed:?} reconciling {key}")]
    Timeout { key: ObjectKey, elapsed: Duration },
}

impl ReconcileError {
    /// Returns true if redelivering the same key later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Config { .. } => false,
            ReconcileError::Backend { source, .. } => source.is_transient(),
            ReconcileError::Store { source, .. } => {
                matches!(source, StoreError::Unavailable(_) | StoreError::Conflict(_))
            }
            ReconcileError::Conflict { .. } | ReconcileError::Timeout { .. } => true,
        }
    }

    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Config { .. } => "config",
            ReconcileError::Backend { source, .. } if source.is_transient() => "backend_transient",
            ReconcileError::Backend { .. } => "backend_permanent",
            ReconcileError::Store { .. } => "store",
            ReconcileError::Conflict { .. } => "conflict",
            ReconcileError::Timeout { .. } => "timeout",
        }
    }
}
