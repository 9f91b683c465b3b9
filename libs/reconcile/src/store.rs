//! Declaration store interface.
//!
//! The control plane owns the record. The reconciler reads it fresh on every
//! pass and writes it back only through [`DeclarationStore::update`], which
//! is guarded by the record's resource version.

use std::sync::Arc;

use async_trait::async_trait;
use bqtable_events::ObjectKey;

use crate::{Declaration, StoreError};

#[async_trait]
pub trait DeclarationStore: Send + Sync {
    /// Fetch the current record. `Ok(None)` if it no longer exists.
    async fn get(&self, key: &ObjectKey) -> Result<Option<Declaration>, StoreError>;

    /// Replace the record if its `resourceVersion` is still current.
    ///
    /// Returns the stored record (with its new version), or
    /// [`StoreError::Conflict`] if someone else wrote first.
    async fn update(&self, declaration: &Declaration) -> Result<Declaration, StoreError>;
}

#[async_trait]
impl<T: DeclarationStore + ?Sized> DeclarationStore for Arc<T> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Declaration>, StoreError> {
        (**self).get(key).await
    }

    async fn update(&self, declaration: &Declaration) -> Result<Declaration, StoreError> {
        (**self).update(declaration).await
    }
}
