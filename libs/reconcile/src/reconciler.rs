//! Finalizer-guarded reconciliation of one declaration.
//!
//! Every pass starts from a fresh read of the declaration and acts on the
//! pair (finalizer present, deletion requested):
//!
//! ```text
//! finalizer  deleting   action
//! ---------  --------   -------------------------------------------------
//! no         no         add finalizer, persist, stop (table comes next pass)
//! yes        no         create the table if absent
//! yes        yes        delete the table, then remove finalizer and persist
//! no         yes        nothing (cleanup already acknowledged)
//! (record not found)    nothing (already fully deleted)
//! ```
//!
//! # Invariants
//!
//! - The finalizer is persisted before any table is created
//! - The finalizer is removed only after the delete call succeeded
//! - At most one successful declaration update per pass
//! - A conflicting update is never retried blindly: the record is re-read and
//!   the decision taken again

use bqtable_events::ObjectKey;
use tracing::{debug, info, instrument};

use crate::{
    finalizer, spec, Declaration, DeclarationStore, DesiredState, ReconcileError,
    ReconcileResult, ResourceBackend, StoreError,
};

/// Default number of re-reads after an update conflict within one pass.
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

/// Reconciler settings fixed at construction time.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Guard token, e.g. `bigquerytables.mahdi.dev/finalizer`.
    pub finalizer: String,

    /// Project used when a declaration does not name one.
    pub default_project: Option<String>,

    /// Re-read attempts after an update conflict before giving up the pass.
    pub max_conflict_retries: u32,
}

impl ReconcilerConfig {
    /// Settings for declarations in the given API group.
    pub fn for_group(group: &str) -> Self {
        Self {
            finalizer: finalizer::token_for_group(group),
            default_project: None,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_default_project(mut self, project: impl Into<String>) -> Self {
        self.default_project = Some(project.into());
        self
    }
}

/// What a declaration's current state calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Record the guard before touching the external table.
    AddFinalizer,
    /// Make sure the table exists.
    Ensure,
    /// Delete the table, then release the guard.
    Cleanup,
    /// Deleting, guard already released.
    Released,
}

/// Pure decision from observed state. Never looks at what woke us up.
pub fn decide(declaration: &Declaration, finalizer: &str) -> Decision {
    match (declaration.has_finalizer(finalizer), declaration.is_deleting()) {
        (false, false) => Decision::AddFinalizer,
        (true, false) => Decision::Ensure,
        (true, true) => Decision::Cleanup,
        (false, true) => Decision::Released,
    }
}

/// What a successful pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Declaration not found; nothing to do.
    Gone,
    /// Guard recorded; table sync deferred to the next pass.
    FinalizerAdded,
    /// Table was absent and has been created.
    Created,
    /// Table already exists.
    InSync,
    /// Table deleted and guard released.
    Cleaned,
    /// Deleting with no guard; nothing to do.
    Released,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Gone => "gone",
            ReconcileOutcome::FinalizerAdded => "finalizer_added",
            ReconcileOutcome::Created => "created",
            ReconcileOutcome::InSync => "in_sync",
            ReconcileOutcome::Cleaned => "cleaned",
            ReconcileOutcome::Released => "released",
        }
    }

    /// Whether the pass changed anything outside this process.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::FinalizerAdded | ReconcileOutcome::Created | ReconcileOutcome::Cleaned
        )
    }
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives one declaration's external table toward its declared state.
pub struct Reconciler<S, B> {
    store: S,
    backend: B,
    config: ReconcilerConfig,
}

impl<S, B> Reconciler<S, B>
where
    S: DeclarationStore,
    B: ResourceBackend,
{
    pub fn new(store: S, backend: B, config: ReconcilerConfig) -> Self {
        Self {
            store,
            backend,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Reconcile one declaration.
    ///
    /// Safe to call any number of times for the same key, as long as calls for
    /// the same key are not concurrent.
    #[instrument(skip(self), fields(namespace = %key.namespace, name = %key.name))]
    pub async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult<ReconcileOutcome> {
        let mut conflicts = 0;
        loop {
            match self.reconcile_once(key).await {
                Err(ReconcileError::Conflict { .. }) if conflicts < self.config.max_conflict_retries => {
                    conflicts += 1;
                    debug!(attempt = conflicts, "Declaration changed underneath, re-reading");
                }
                Err(ReconcileError::Conflict { key, .. }) => {
                    return Err(ReconcileError::Conflict {
                        key,
                        attempts: conflicts + 1,
                    });
                }
                result => return result,
            }
        }
    }

    async fn reconcile_once(&self, key: &ObjectKey) -> ReconcileResult<ReconcileOutcome> {
        let current = self
            .store
            .get(key)
            .await
            .map_err(|e| store_error(key, e))?;

        let Some(declaration) = current else {
            debug!("Declaration not found, treating as fully deleted");
            return Ok(ReconcileOutcome::Gone);
        };

        match decide(&declaration, &self.config.finalizer) {
            Decision::AddFinalizer => {
                let mut updated = declaration.clone();
                updated.metadata.finalizers =
                    finalizer::add(&declaration.metadata.finalizers, &self.config.finalizer);
                self.persist(key, &updated).await?;

                info!(finalizer = %self.config.finalizer, "Added finalizer");
                Ok(ReconcileOutcome::FinalizerAdded)
            }
            Decision::Ensure => {
                let desired = self.desired_state(key, &declaration)?;
                let exists = self
                    .backend
                    .exists(&desired)
                    .await
                    .map_err(|e| backend_error(key, e))?;

                if exists {
                    debug!(table = %desired, desired = true, actual = true, "In sync");
                    return Ok(ReconcileOutcome::InSync);
                }

                info!(table = %desired, desired = true, actual = false, "Out of sync, creating table");
                self.backend
                    .create_if_absent(&desired)
                    .await
                    .map_err(|e| backend_error(key, e))?;

                info!(table = %desired, "Created table");
                Ok(ReconcileOutcome::Created)
            }
            Decision::Cleanup => {
                let desired = self.desired_state(key, &declaration)?;

                info!(table = %desired, "Declaration deleting, removing table");
                self.backend
                    .delete_if_present(&desired)
                    .await
                    .map_err(|e| backend_error(key, e))?;

                // Only now is the table confirmed absent.
                let mut updated = declaration.clone();
                updated.metadata.finalizers =
                    finalizer::remove(&declaration.metadata.finalizers, &self.config.finalizer);
                self.persist(key, &updated).await?;

                info!(table = %desired, "Table removed, finalizer released");
                Ok(ReconcileOutcome::Cleaned)
            }
            Decision::Released => {
                debug!("Cleanup already acknowledged");
                Ok(ReconcileOutcome::Released)
            }
        }
    }

    fn desired_state(
        &self,
        key: &ObjectKey,
        declaration: &Declaration,
    ) -> ReconcileResult<DesiredState> {
        spec::extract(declaration, self.config.default_project.as_deref()).map_err(|source| {
            ReconcileError::Config {
                key: key.clone(),
                source,
            }
        })
    }

    async fn persist(&self, key: &ObjectKey, declaration: &Declaration) -> ReconcileResult<()> {
        self.store
            .update(declaration)
            .await
            .map(|_| ())
            .map_err(|e| store_error(key, e))
    }
}

fn store_error(key: &ObjectKey, err: StoreError) -> ReconcileError {
    if err.is_conflict() {
        ReconcileError::Conflict {
            key: key.clone(),
            attempts: 1,
        }
    } else {
        ReconcileError::Store {
            key: key.clone(),
            source: err,
        }
    }
}

fn backend_error(key: &ObjectKey, source: crate::BackendError) -> ReconcileError {
    ReconcileError::Backend {
        key: key.clone(),
        source,
    }
}
