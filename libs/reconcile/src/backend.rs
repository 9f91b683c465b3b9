//! External table service interface.
//!
//! Every operation is idempotent from the reconciler's point of view:
//! creating an existing table and deleting an absent one both succeed.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{BackendError, DesiredState};

/// A column in the fixed creation schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub field_type: &'static str,
}

/// Columns every managed table is created with. Not user-configurable.
pub const CREATION_SCHEMA: &[Column] = &[
    Column {
        name: "id",
        field_type: "STRING",
    },
    Column {
        name: "created_at",
        field_type: "TIMESTAMP",
    },
];

/// External table service.
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    /// Whether the table exists.
    async fn exists(&self, table: &DesiredState) -> Result<bool, BackendError>;

    /// Create the table with [`CREATION_SCHEMA`]. "Already exists" is success.
    async fn create_if_absent(&self, table: &DesiredState) -> Result<(), BackendError>;

    /// Delete the table. "Not found" is success.
    async fn delete_if_present(&self, table: &DesiredState) -> Result<(), BackendError>;
}

#[async_trait]
impl<T: ResourceBackend + ?Sized> ResourceBackend for Arc<T> {
    async fn exists(&self, table: &DesiredState) -> Result<bool, BackendError> {
        (**self).exists(table).await
    }

    async fn create_if_absent(&self, table: &DesiredState) -> Result<(), BackendError> {
        (**self).create_if_absent(table).await
    }

    async fn delete_if_present(&self, table: &DesiredState) -> Result<(), BackendError> {
        (**self).delete_if_present(table).await
    }
}
