use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Toleration, TopologySpreadConstraint, Volume, VolumeMount,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Blocks erasure of a Model until its server pod is gone.
pub const MODEL_FINALIZER: &str = "sivchari.io/model";

#[derive(
    CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema,
)]
#[kube(
    group = "ollama.sivchari.io",
    version = "v1alpha1",
    kind = "Model",
    plural = "models",
    namespaced,
    status = "ModelStatus",
    printcolumn = r#"{"name":"Pod", "type":"string", "jsonPath":".status.podRef.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    /// Models pulled by the server right after it starts. At least one.
    #[schemars(length(min = 1))]
    pub images: Vec<String>,
    /// When true the server is not provisioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    /// Pass-through fragment for the server pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<ModelTemplate>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ModelTemplateSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Subset of the core/v1 PodSpec copied verbatim onto the server pod.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts: Option<Vec<VolumeMount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology_spread_constraints: Option<Vec<TopologySpreadConstraint>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    /// Server pod currently backing this Model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ref: Option<PodRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
}

impl ModelSpec {
    pub fn is_paused(&self) -> bool {
        self.paused.unwrap_or(false)
    }
}

impl Model {
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == MODEL_FINALIZER)
    }

    /// Returns true when the finalizer was added.
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.finalizers_mut().push(MODEL_FINALIZER.to_string());
        true
    }

    /// Returns true when the finalizer was present and removed.
    pub fn remove_finalizer(&mut self) -> bool {
        if !self.has_finalizer() {
            return false;
        }
        self.finalizers_mut().retain(|f| f != MODEL_FINALIZER);
        true
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Name recorded in `status.podRef`, empty when unset.
    pub fn pod_ref_name(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.pod_ref.as_ref())
            .map(|r| r.name.as_str())
            .unwrap_or("")
    }

    pub fn set_pod_ref(&mut self, pod_ref: Option<PodRef>) {
        self.status.get_or_insert_with(Default::default).pod_ref = pod_ref;
    }
}
