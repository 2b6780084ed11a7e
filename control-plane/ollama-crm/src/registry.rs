//! Kinds this operator knows about, built once at startup and passed to the
//! reconciler and stores that need to recognise them.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::GroupVersionKind;
use kube::{Resource, ResourceExt};

use crate::crd::model::Model;

#[derive(Clone, Debug)]
pub struct KindRegistry {
    model: GroupVersionKind,
    pod: GroupVersionKind,
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KindRegistry {
    pub fn new() -> Self {
        Self {
            model: GroupVersionKind::gvk(
                &Model::group(&()),
                &Model::version(&()),
                &Model::kind(&()),
            ),
            pod: GroupVersionKind::gvk(
                &Pod::group(&()),
                &Pod::version(&()),
                &Pod::kind(&()),
            ),
        }
    }

    pub fn model(&self) -> &GroupVersionKind {
        &self.model
    }

    pub fn pod(&self) -> &GroupVersionKind {
        &self.pod
    }

    pub fn model_api_version(&self) -> String {
        self.model.api_version()
    }

    /// Back-reference stamped on a Model's server pod. `None` until the
    /// store has assigned the Model a uid.
    pub fn owner_reference(&self, model: &Model) -> Option<OwnerReference> {
        let uid = model.uid()?;
        Some(OwnerReference {
            api_version: self.model_api_version(),
            kind: self.model.kind.clone(),
            name: model.name_any(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }

    /// Both kind and API group must match; the version is ignored so refs
    /// written by an older served version still route.
    pub fn is_model_owner(&self, owner: &OwnerReference) -> bool {
        owner.kind == self.model.kind
            && api_group(&owner.api_version) == self.model.group
    }
}

/// Group part of an apiVersion; core kinds (`v1`) have an empty group.
fn api_group(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}
