use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::registry::KindRegistry;
use crate::store::ObjectKey;

/// Reconciliation keys for the Models a pod points back to.
///
/// A back-reference matches only when both its kind and its API group are
/// the Model's. Either check alone would route pods owned by an unrelated
/// `Model` kind, or by any kind of this group, to the reconciler.
pub fn pod_to_models(registry: &KindRegistry, pod: &Pod) -> Vec<ObjectKey> {
    let ns = pod.namespace().unwrap_or_else(|| "default".into());
    pod.owner_references()
        .iter()
        .filter(|o| registry.is_model_owner(o))
        .map(|o| ObjectKey::new(ns.clone(), o.name.clone()))
        .collect()
}
