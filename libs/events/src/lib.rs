//! # bqtable-events
//!
//! Identity and change-notification types for BigQueryTable declarations.
//!
//! ## Design Principles
//!
//! - A notification is a wake-up signal, never a source of truth
//! - Every notification names exactly one declaration by `(namespace, name)`
//! - The wire format is the control plane's list/watch stream: one JSON
//!   object per line, with bookmarks and expiry errors interleaved
//!
//! ## Notification Kinds
//!
//! - `Added`, `Modified`, `Deleted` become [`ReconcileEvent`]s and are all
//!   handled identically downstream
//! - `BOOKMARK` advances the resume point without waking anything up
//! - `ERROR` with code 410 means the resume point expired and the stream
//!   must be re-listed

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
