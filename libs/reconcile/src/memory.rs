//! In-memory store and backend.
//!
//! Used by tests and for running the controller without a cluster. Both
//! record every call into a shared [`CallLog`] so a test can assert on the
//! relative order of backend calls and declaration updates.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bqtable_events::ObjectKey;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{BackendError, Declaration, DeclarationStore, DesiredState, ResourceBackend, StoreError};

/// One observed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get(ObjectKey),
    Update {
        key: ObjectKey,
        finalizers: Vec<String>,
    },
    Exists(String),
    Create(String),
    Delete(String),
}

impl Call {
    pub fn is_backend_mutation(&self) -> bool {
        matches!(self, Call::Create(_) | Call::Delete(_))
    }

    pub fn is_update(&self) -> bool {
        matches!(self, Call::Update { .. })
    }
}

/// Shared, ordered record of calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, call: Call) {
        self.0.lock().await.push(call);
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.0.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.0.lock().await.clear();
    }
}

/// Declaration store with optimistic concurrency on `resourceVersion`.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<BTreeMap<ObjectKey, Declaration>>,
    next_version: AtomicU64,
    injected_conflicts: Mutex<u32>,
    log: CallLog,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a call log with a backend.
    pub fn with_log(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }

    fn bump(&self) -> String {
        (self.next_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Create or overwrite a record as a user would. Returns the stored copy.
    pub async fn apply(&self, mut declaration: Declaration) -> Declaration {
        declaration.metadata.resource_version = Some(self.bump());
        self.records
            .lock()
            .await
            .insert(declaration.key(), declaration.clone());
        declaration
    }

    /// Ask for removal, as a user delete would.
    ///
    /// Sets the deletion timestamp once. A record without finalizers is
    /// removed immediately. Returns false if the record did not exist.
    pub async fn request_deletion(&self, key: &ObjectKey) -> bool {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(key) else {
            return false;
        };

        if record.metadata.finalizers.is_empty() {
            records.remove(key);
            return true;
        }

        if record.metadata.deletion_timestamp.is_none() {
            record.metadata.deletion_timestamp = Some(Utc::now());
            record.metadata.resource_version = Some(self.bump());
        }
        true
    }

    /// Make the next `n` updates fail with a conflict, as if another writer
    /// got in first each time.
    pub async fn inject_conflicts(&self, n: u32) {
        *self.injected_conflicts.lock().await = n;
    }

    /// Current record, without logging a call.
    pub async fn peek(&self, key: &ObjectKey) -> Option<Declaration> {
        self.records.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Keys of every stored record.
    pub async fn keys(&self) -> Vec<ObjectKey> {
        self.records.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl DeclarationStore for InMemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Declaration>, StoreError> {
        self.log.record(Call::Get(key.clone())).await;
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn update(&self, declaration: &Declaration) -> Result<Declaration, StoreError> {
        let key = declaration.key();
        self.log
            .record(Call::Update {
                key: key.clone(),
                finalizers: declaration.metadata.finalizers.clone(),
            })
            .await;

        let mut records = self.records.lock().await;
        let Some(stored) = records.get_mut(&key) else {
            return Err(StoreError::Rejected(format!("{key} not found")));
        };

        {
            let mut injected = self.injected_conflicts.lock().await;
            if *injected > 0 {
                *injected -= 1;
                stored.metadata.resource_version = Some(self.bump());
                return Err(StoreError::Conflict(key.to_string()));
            }
        }

        if stored.metadata.resource_version != declaration.metadata.resource_version {
            return Err(StoreError::Conflict(key.to_string()));
        }

        let mut next = declaration.clone();
        // The store owns the deletion timestamp; writers cannot clear it.
        next.metadata.deletion_timestamp = stored.metadata.deletion_timestamp;
        next.metadata.resource_version = Some(self.bump());

        if next.is_deleting() && next.metadata.finalizers.is_empty() {
            debug!(key = %key, "Finalizers released, removing declaration");
            records.remove(&key);
            return Ok(next);
        }

        *stored = next.clone();
        Ok(next)
    }
}

/// Which backend operation a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOp {
    Exists,
    Create,
    Delete,
}

/// Table service holding a set of fully-qualified table names.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    tables: Mutex<BTreeSet<String>>,
    faults: Mutex<VecDeque<(BackendOp, BackendError)>>,
    log: CallLog,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a call log with a store.
    pub fn with_log(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }

    /// Fail the next call of `op` with `err`. Faults queue up in order.
    pub async fn fail_next(&self, op: BackendOp, err: BackendError) {
        self.faults.lock().await.push_back((op, err));
    }

    /// Create a table out of band.
    pub async fn insert(&self, table: &DesiredState) {
        self.tables.lock().await.insert(table.to_string());
    }

    pub async fn contains(&self, table: &DesiredState) -> bool {
        self.tables.lock().await.contains(&table.to_string())
    }

    pub async fn tables(&self) -> Vec<String> {
        self.tables.lock().await.iter().cloned().collect()
    }

    async fn take_fault(&self, op: BackendOp) -> Option<BackendError> {
        let mut faults = self.faults.lock().await;
        let pos = faults.iter().position(|(o, _)| *o == op)?;
        faults.remove(pos).map(|(_, err)| err)
    }
}

#[async_trait]
impl ResourceBackend for InMemoryBackend {
    async fn exists(&self, table: &DesiredState) -> Result<bool, BackendError> {
        self.log.record(Call::Exists(table.to_string())).await;
        if let Some(err) = self.take_fault(BackendOp::Exists).await {
            return Err(err);
        }
        Ok(self.contains(table).await)
    }

    async fn create_if_absent(&self, table: &DesiredState) -> Result<(), BackendError> {
        self.log.record(Call::Create(table.to_string())).await;
        if let Some(err) = self.take_fault(BackendOp::Create).await {
            return Err(err);
        }
        self.tables.lock().await.insert(table.to_string());
        Ok(())
    }

    async fn delete_if_present(&self, table: &DesiredState) -> Result<(), BackendError> {
        self.log.record(Call::Delete(table.to_string())).await;
        if let Some(err) = self.take_fault(BackendOp::Delete).await {
            return Err(err);
        }
        self.tables.lock().await.remove(&table.to_string());
        Ok(())
    }
}
