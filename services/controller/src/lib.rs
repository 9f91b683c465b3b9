//! BigQueryTable controller library.
//!
//! Wires the reconciliation core to its real collaborators:
//!
//! ```text
//! KubeWatchSource ──events──▶ Dispatcher ──key──▶ Reconciler
//!                                                  ├── KubeClient       (DeclarationStore)
//!                                                  └── BigQueryBackend  (ResourceBackend)
//! ```
//!
//! ## Modules
//!
//! - `auth`: bearer tokens and BigQuery credentials
//! - `kube`: control-plane client, declaration store and watch source
//! - `bigquery`: BigQuery tables API backend
//! - `dispatcher`: work queue and worker pool
//! - `source`: event source interface

pub mod auth;
pub mod bigquery;
pub mod config;
pub mod dispatcher;
pub mod kube;
pub mod source;

pub use bigquery::{BigQueryBackend, BigQueryConfig};
pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherConfig, WorkQueue};
pub use kube::{KubeClient, KubeConfig, KubeWatchSource};
pub use source::EventSource;
