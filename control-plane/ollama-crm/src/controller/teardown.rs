use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::patch::ModelPatch;
use super::{ReconcileErr, Reconciler};
use crate::store::{ObjectKey, cancellable, found};

impl Reconciler {
    /// Remove the server pod, then release the finalizer. Any error keeps
    /// the finalizer so the next delivery retries.
    pub(super) async fn reconcile_delete(
        &self,
        key: &ObjectKey,
        patch: &mut ModelPatch,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileErr> {
        if !patch.working.has_finalizer() {
            debug!("teardown: finalizer already absent");
            return Ok(());
        }

        // looked up under the Model's own name, not status.podRef, so a
        // Model whose status was never written still tears down
        if found(cancellable(cancel, self.store.get_pod(key)).await)?.is_some()
        {
            self.delete_pod_if_present(key, cancel).await?;
        }

        if let Some(uid) = patch.working.uid() {
            let owned = cancellable(
                cancel,
                self.store.list_owned_pods(&key.namespace, &uid),
            )
            .await?;
            for pod in owned {
                self.delete_pod_if_present(&ObjectKey::of(&pod), cancel)
                    .await?;
            }
        }

        info!("teardown: server pods removed; releasing finalizer");
        patch.working.remove_finalizer();
        Ok(())
    }

    pub(super) async fn delete_pod_if_present(
        &self,
        pod_key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileErr> {
        if found(cancellable(cancel, self.store.delete_pod(pod_key)).await)?
            .is_some()
        {
            info!(pod = %pod_key.name, "teardown: server pod deleted");
        }
        Ok(())
    }
}
