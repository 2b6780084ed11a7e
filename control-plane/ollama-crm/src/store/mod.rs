//! Boundary to the system of record for Models and their server pods.

mod kube_store;
pub mod memory;

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::crd::model::Model;

pub use kube_store::KubeStore;
pub use memory::{MemoryStore, Op, StoreEvent};

/// Namespace + name of a stored object; also the reconciliation key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_else(|| "default".into()),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn not_found(kind: &'static str, key: &ObjectKey) -> Self {
        StoreError::NotFound {
            kind,
            key: key.clone(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// `NotFound` becomes `None`; every other error is kept.
pub fn found<T>(res: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Race a store call against `token`.
pub async fn cancellable<T, F>(
    token: &CancellationToken,
    fut: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(StoreError::Cancelled),
        res = fut => res,
    }
}

/// Patches are RFC 7386 JSON merge patches. A patch carrying
/// `metadata.resourceVersion` is rejected with `Conflict` when stale.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_model(&self, key: &ObjectKey) -> Result<Model, StoreError>;

    async fn patch_model_metadata(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<Model, StoreError>;

    async fn patch_model_status(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<Model, StoreError>;

    /// An empty name never matches.
    async fn get_pod(&self, key: &ObjectKey) -> Result<Pod, StoreError>;

    /// Creates in the pod's own namespace, honouring `generateName`.
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, StoreError>;

    async fn delete_pod(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Pods in `namespace` whose owner references include `owner_uid`.
    async fn list_owned_pods(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<Pod>, StoreError>;
}
