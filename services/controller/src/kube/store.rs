//! [`DeclarationStore`] backed by the control-plane REST API.

use async_trait::async_trait;
use bqtable_events::ObjectKey;
use bqtable_reconcile::{Declaration, DeclarationStore, StoreError};

use super::KubeClient;

#[async_trait]
impl DeclarationStore for KubeClient {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Declaration>, StoreError> {
        KubeClient::get(self, key)
            .await
            .map_err(|e| e.into_store_error(key))
    }

    async fn update(&self, declaration: &Declaration) -> Result<Declaration, StoreError> {
        self.replace(declaration)
            .await
            .map_err(|e| e.into_store_error(&declaration.key()))
    }
}
