//! Reconciliation of BigQueryTable declarations.
//!
//! This library keeps one external table in agreement with one declaration
//! stored in the cluster's control plane. Key concepts:
//!
//! - **Desired state**: the defaulted `(project, dataset, tableName)` derived
//!   from the declaration's spec.
//! - **Current state**: whether that table exists in the external service.
//! - **Finalizer**: a guard token on the declaration that keeps the record
//!   alive until the table is confirmed gone.
//!
//! # Invariants
//!
//! - Decisions come from a fresh read of the declaration, never from the
//!   notification that triggered the pass
//! - All operations are idempotent
//! - The finalizer is present iff the table has not been confirmed absent
//!
//! The collaborators ([`DeclarationStore`], [`ResourceBackend`]) are traits;
//! [`memory`] has in-process implementations.

mod backend;
mod declaration;
mod error;
pub mod finalizer;
pub mod memory;
mod reconciler;
mod retry;
pub mod spec;
mod store;

pub use backend::{Column, ResourceBackend, CREATION_SCHEMA};
pub use declaration::{Declaration, ObjectMeta};
pub use error::{BackendError, ConfigError, ReconcileError, ReconcileResult, StoreError};
pub use reconciler::{
    decide, Decision, ReconcileOutcome, Reconciler, ReconcilerConfig, DEFAULT_MAX_CONFLICT_RETRIES,
};
pub use retry::{BackoffPolicy, RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};
pub use spec::DesiredState;
pub use store::DeclarationStore;

pub use bqtable_events::ObjectKey;
