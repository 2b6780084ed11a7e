use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::patch::ModelPatch;
use super::{ReconcileErr, Reconciler};
use crate::crd::model::{ModelSpec, PodRef};
use crate::store::{ObjectKey, StoreError, cancellable, found};

impl Reconciler {
    pub(super) async fn reconcile_normal(
        &self,
        key: &ObjectKey,
        patch: &mut ModelPatch,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileErr> {
        // persisted on its own so a crash later in the pass still leaves the
        // Model protected
        if patch.working.add_finalizer() {
            info!("reconcile: adding finalizer");
            let body = json!({
                "metadata": {
                    "finalizers": patch.working.finalizers(),
                    "resourceVersion": patch.resource_version(),
                }
            });
            let persisted = cancellable(
                cancel,
                self.store.patch_model_metadata(key, &body),
            )
            .await?;
            patch.rebase(persisted);
        }

        if patch.working.spec.is_paused() {
            return self.suspend(key, patch, cancel).await;
        }

        let name = patch.working.pod_ref_name().to_string();
        let mut current = self.lookup_pod(&key.namespace, &name, cancel).await?;
        let owned = self.owned_pods(key, patch, cancel).await?;

        // a pod created by an earlier pass whose status write was lost is
        // adopted; every other owned pod goes
        let recorded = current.as_ref().map(|c| c.name_any());
        let mut strays = Vec::new();
        for pod in owned {
            if recorded.as_deref() == Some(pod.name_any().as_str()) {
                continue;
            }
            if current.is_none()
                && self.matches_template(&patch.working.spec, &pod)
            {
                info!(pod = %pod.name_any(), "reconcile: adopting owned server pod");
                patch.working.set_pod_ref(Some(pod_ref(key, &pod)));
                current = Some(pod);
                continue;
            }
            strays.push(pod);
        }
        for pod in strays {
            info!(pod = %pod.name_any(), "reconcile: removing stray server pod");
            self.delete_pod_if_present(&ObjectKey::of(&pod), cancel).await?;
        }

        match current {
            None => {
                debug!(pod = %name, "reconcile: server pod not found; creating");
                self.create_pod(key, patch, cancel).await
            }
            Some(pod) => self.update_pod(key, patch, pod, cancel).await,
        }
    }

    async fn lookup_pod(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Pod>, StoreError> {
        if name.is_empty() {
            return Ok(None);
        }
        let pod_key = ObjectKey::new(namespace, name);
        found(cancellable(cancel, self.store.get_pod(&pod_key)).await)
    }

    /// Live pods carrying this Model's back-reference.
    async fn owned_pods(
        &self,
        key: &ObjectKey,
        patch: &ModelPatch,
        cancel: &CancellationToken,
    ) -> Result<Vec<Pod>, StoreError> {
        let Some(uid) = patch.working.uid() else {
            return Ok(Vec::new());
        };
        let pods = cancellable(
            cancel,
            self.store.list_owned_pods(&key.namespace, &uid),
        )
        .await?;
        Ok(pods
            .into_iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none())
            .filter(|p| {
                p.owner_references()
                    .iter()
                    .any(|o| o.uid == uid && self.registry.is_model_owner(o))
            })
            .collect())
    }

    fn matches_template(&self, spec: &ModelSpec, observed: &Pod) -> bool {
        let mut desired = observed.clone();
        self.template.apply(spec, &mut desired);
        desired.spec == observed.spec
    }

    async fn create_pod(
        &self,
        key: &ObjectKey,
        patch: &mut ModelPatch,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileErr> {
        let owner = self
            .registry
            .owner_reference(&patch.working)
            .ok_or_else(|| ReconcileErr::MissingUid(key.clone()))?;
        let pod = self.template.build(&patch.working, owner);
        let created = cancellable(cancel, self.store.create_pod(&pod)).await?;
        let pod_ref = pod_ref(key, &created);
        info!(pod = %pod_ref.name, image = %self.template.image(), "reconcile: server pod created");
        patch.working.set_pod_ref(Some(pod_ref));
        Ok(())
    }

    /// Pod specs are mostly immutable, so any drift means replace.
    async fn update_pod(
        &self,
        key: &ObjectKey,
        patch: &mut ModelPatch,
        observed: Pod,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileErr> {
        if self.matches_template(&patch.working.spec, &observed) {
            trace!(pod = %observed.name_any(), "reconcile: server pod up to date");
            return Ok(());
        }

        let pod_key = ObjectKey::of(&observed);
        info!(pod = %pod_key.name, "reconcile: server pod spec drifted; recreating");
        // a crash between delete and create heals on the next pass: the
        // recorded name no longer resolves and the create path runs again
        found(cancellable(cancel, self.store.delete_pod(&pod_key)).await)?;
        self.create_pod(key, patch, cancel).await
    }

    /// Paused Models run no server: the recorded pod and every owned pod
    /// are removed.
    async fn suspend(
        &self,
        key: &ObjectKey,
        patch: &mut ModelPatch,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileErr> {
        let name = patch.working.pod_ref_name().to_string();
        let mut doomed: BTreeSet<String> = self
            .owned_pods(key, patch, cancel)
            .await?
            .iter()
            .map(|p| p.name_any())
            .collect();
        if let Some(pod) = self.lookup_pod(&key.namespace, &name, cancel).await? {
            doomed.insert(pod.name_any());
        }
        for pod_name in doomed {
            info!(pod = %pod_name, "reconcile: model paused; removing server pod");
            self.delete_pod_if_present(
                &ObjectKey::new(&key.namespace, pod_name),
                cancel,
            )
            .await?;
        }
        if !name.is_empty() {
            patch.working.set_pod_ref(None);
        }
        Ok(())
    }
}

fn pod_ref(key: &ObjectKey, pod: &Pod) -> PodRef {
    PodRef {
        name: pod.name_any(),
        namespace: pod.namespace().unwrap_or_else(|| key.namespace.clone()),
    }
}
