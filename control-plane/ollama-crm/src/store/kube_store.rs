use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::Value;
use tracing::trace;

use super::{ObjectKey, ObjectStore, StoreError};
use crate::crd::model::Model;

/// Store backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn models(&self, ns: &str) -> Api<Model> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn pods(&self, ns: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), ns)
    }
}

fn from_kube(kind: &'static str, key: &ObjectKey, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::not_found(kind, key),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
        other => StoreError::Transport(other.to_string()),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_model(&self, key: &ObjectKey) -> Result<Model, StoreError> {
        self.models(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| from_kube("Model", key, e))
    }

    async fn patch_model_metadata(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<Model, StoreError> {
        trace!(%key, %patch, "patch model metadata");
        self.models(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| from_kube("Model", key, e))
    }

    async fn patch_model_status(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<Model, StoreError> {
        trace!(%key, %patch, "patch model status");
        self.models(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| from_kube("Model", key, e))
    }

    async fn get_pod(&self, key: &ObjectKey) -> Result<Pod, StoreError> {
        // an empty name would address the collection
        if key.name.is_empty() {
            return Err(StoreError::not_found("Pod", key));
        }
        self.pods(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| from_kube("Pod", key, e))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        let ns = pod.metadata.namespace.as_deref().ok_or_else(|| {
            StoreError::Invalid("pod has no namespace".into())
        })?;
        let key = ObjectKey::new(
            ns,
            pod.metadata
                .name
                .clone()
                .or_else(|| pod.metadata.generate_name.clone())
                .unwrap_or_default(),
        );
        self.pods(ns)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| from_kube("Pod", &key, e))
    }

    async fn delete_pod(&self, key: &ObjectKey) -> Result<(), StoreError> {
        if key.name.is_empty() {
            return Err(StoreError::not_found("Pod", key));
        }
        self.pods(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| from_kube("Pod", key, e))
    }

    async fn list_owned_pods(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<Pod>, StoreError> {
        let key = ObjectKey::new(namespace, "");
        let list = self
            .pods(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| from_kube("Pod", &key, e))?;
        Ok(list
            .items
            .into_iter()
            .filter(|p| {
                p.metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|refs| refs.iter().any(|o| o.uid == owner_uid))
            })
            .collect())
    }
}
