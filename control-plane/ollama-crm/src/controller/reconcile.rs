use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::ReconcileErr;
use super::patch::ModelPatch;
use crate::registry::KindRegistry;
use crate::store::{ObjectKey, ObjectStore, cancellable, found};
use crate::templates::ServerTemplate;

/// Drives one Model toward its rendered server pod. Holds no object state
/// between passes; every pass starts from a fresh read.
#[derive(Clone)]
pub struct Reconciler {
    pub(super) store: Arc<dyn ObjectStore>,
    pub(super) template: ServerTemplate,
    pub(super) registry: Arc<KindRegistry>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        template: ServerTemplate,
        registry: Arc<KindRegistry>,
    ) -> Self {
        Self {
            store,
            template,
            registry,
        }
    }

    pub fn template(&self) -> &ServerTemplate {
        &self.template
    }

    pub fn registry(&self) -> &Arc<KindRegistry> {
        &self.registry
    }

    /// One convergence pass for `key`. A missing Model is a no-op.
    ///
    /// Status and metadata changes made by the pass are written back on
    /// every exit, including errors and panics; failures of those writes are
    /// logged and never replace the pass result.
    #[instrument(skip_all, fields(ns = %key.namespace, name = %key.name))]
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileErr> {
        let Some(model) =
            found(cancellable(cancel, self.store.get_model(key)).await)?
        else {
            debug!("reconcile: model not found; nothing to do");
            return Ok(());
        };

        let mut patch = ModelPatch::new(model);
        let outcome = AssertUnwindSafe(self.converge(key, &mut patch, cancel))
            .catch_unwind()
            .await;
        self.persist(key, &patch).await;
        match outcome {
            Ok(res) => res,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn converge(
        &self,
        key: &ObjectKey,
        patch: &mut ModelPatch,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileErr> {
        if patch.working.is_deleting() {
            info!("reconcile: deletion requested; starting teardown");
            self.reconcile_delete(key, patch, cancel).await
        } else {
            self.reconcile_normal(key, patch, cancel).await
        }
    }

    /// Not cancellable: whatever the pass did must be recorded.
    async fn persist(&self, key: &ObjectKey, patch: &ModelPatch) {
        let mut version = patch.resource_version();
        if let Some(status) = patch.status_patch() {
            match self.store.patch_model_status(key, &status).await {
                Ok(updated) => {
                    trace!(%status, "reconcile: status persisted");
                    version = updated.metadata.resource_version;
                }
                Err(e) => {
                    warn!(error = %e, "reconcile: unable to update Model status")
                }
            }
        }
        if let Some(meta) = patch.metadata_patch(version.as_deref()) {
            match self.store.patch_model_metadata(key, &meta).await {
                Ok(_) => trace!(%meta, "reconcile: metadata persisted"),
                Err(e) => {
                    warn!(error = %e, "reconcile: unable to update Model metadata")
                }
            }
        }
    }
}
