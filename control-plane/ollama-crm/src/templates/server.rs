use std::collections::HashSet;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, ExecAction, Lifecycle,
    LifecycleHandler, Pod, PodSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    ObjectMeta, OwnerReference,
};
use kube::ResourceExt;

use crate::crd::model::{Model, ModelSpec};

pub const DEFAULT_SERVER_IMAGE: &str = "ollama/ollama:latest";
pub const SERVER_CONTAINER_NAME: &str = "ollama-server";
pub const SERVER_PORT: i32 = 11434;
pub const SERVER_HOST_ENV: &str = "OLLAMA_HOST";

/// Renders the ollama server pod for a Model. Rendering is a pure function of
/// the Model spec and the configured image.
#[derive(Clone, Debug)]
pub struct ServerTemplate {
    image: String,
}

impl Default for ServerTemplate {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ServerTemplate {
    pub fn new(image_override: Option<&str>) -> Self {
        let image = image_override
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SERVER_IMAGE);
        Self {
            image: image.to_string(),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Fresh server pod for `model`: placed in its namespace, named from it,
    /// and carrying `owner` as back-reference.
    pub fn build(&self, model: &Model, owner: OwnerReference) -> Pod {
        let mut pod = Pod {
            metadata: ObjectMeta {
                namespace: model.namespace(),
                generate_name: Some(format!("{}-", model.name_any())),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            ..Default::default()
        };
        self.apply(&model.spec, &mut pod);
        pod
    }

    pub fn render(&self, spec: &ModelSpec) -> Pod {
        let mut pod = Pod::default();
        self.apply(spec, &mut pod);
        pod
    }

    /// Overwrite every field this template owns on `pod`. Container fields
    /// the template leaves unset keep whatever the existing server container
    /// holds, so values the platform fills in on admission survive the
    /// comparison against a freshly rendered spec.
    pub fn apply(&self, spec: &ModelSpec, pod: &mut Pod) {
        let meta = spec.template.as_ref().and_then(|t| t.metadata.as_ref());
        if let Some(meta) = meta {
            pod.metadata.labels = meta.labels.clone();
            pod.metadata.annotations = meta.annotations.clone();
        }

        let tspec = spec.template.as_ref().and_then(|t| t.spec.as_ref());
        let pod_spec = pod.spec.get_or_insert_with(PodSpec::default);

        let mut container = pod_spec
            .containers
            .iter()
            .find(|c| c.name == SERVER_CONTAINER_NAME)
            .cloned()
            .unwrap_or_default();
        container.name = SERVER_CONTAINER_NAME.to_string();
        container.image = Some(self.image.clone());
        container.ports = Some(vec![ContainerPort {
            name: Some(SERVER_CONTAINER_NAME.to_string()),
            container_port: SERVER_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]);
        container.env = Some(vec![EnvVar {
            name: SERVER_HOST_ENV.to_string(),
            value: Some(format!("0.0.0.0:{}", SERVER_PORT)),
            ..Default::default()
        }]);
        container.args = Some(vec!["serve".to_string()]);
        container.volume_mounts = tspec.and_then(|t| t.volume_mounts.clone());
        container.lifecycle = Some(Lifecycle {
            post_start: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(vec![
                        "/bin/sh".to_string(),
                        "-c".to_string(),
                        post_start_script(&spec.images),
                    ]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });

        pod_spec.containers = vec![container];
        pod_spec.volumes = tspec.and_then(|t| t.volumes.clone());
        pod_spec.node_selector = tspec.and_then(|t| t.node_selector.clone());
        pod_spec.affinity = tspec.and_then(|t| t.affinity.clone());
        pod_spec.tolerations = tspec.and_then(|t| t.tolerations.clone());
        pod_spec.topology_spread_constraints =
            tspec.and_then(|t| t.topology_spread_constraints.clone());
        // the server never calls the API; an injected token volume would
        // otherwise show up as spec drift
        pod_spec.automount_service_account_token = Some(false);
    }
}

/// Shell script run by the postStart hook: one `ollama pull` per image in
/// input order. Blank identifiers are skipped and repeats pulled once.
pub fn post_start_script(images: &[String]) -> String {
    let mut seen = HashSet::new();
    images
        .iter()
        .map(|i| i.trim())
        .filter(|i| !i.is_empty() && seen.insert(*i))
        .map(|i| format!("ollama pull {};", i))
        .collect()
}
