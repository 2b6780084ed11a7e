#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::{Client, ResourceExt, api::Api};
use ollama_crm::controller::queue::LocalController;
use ollama_crm::controller::{ReconcileErr, Reconciler};
use ollama_crm::crd::model::{Model, ModelSpec};
use ollama_crm::registry::KindRegistry;
use ollama_crm::store::{MemoryStore, ObjectKey};
use ollama_crm::templates::ServerTemplate;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const NS: &str = "ml";

// DNS-1123 safe numeric suffix for unique names
pub const DIGITS: [char; 10] =
    ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];
pub fn uniq(prefix: &str) -> String {
    format!("{prefix}-{}", nanoid::nanoid!(6, &DIGITS))
}

// Env guard utilities
pub struct EnvGuard {
    key: &'static str,
    old: Option<String>,
}
impl Drop for EnvGuard {
    fn drop(&mut self) {
        unsafe {
            if let Some(ref v) = self.old {
                std::env::set_var(self.key, v);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }
}
pub fn set_env(key: &'static str, val: &str) -> EnvGuard {
    let old = std::env::var(key).ok();
    unsafe {
        std::env::set_var(key, val);
    }
    EnvGuard { key, old }
}

pub fn spec(images: &[&str]) -> ModelSpec {
    ModelSpec {
        images: images.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Reconciler wired to an in-memory store.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_image(None)
    }

    pub fn with_image(image: Option<&str>) -> Self {
        let registry = Arc::new(KindRegistry::new());
        let store = Arc::new(MemoryStore::new(registry.clone()));
        let reconciler =
            Reconciler::new(store.clone(), ServerTemplate::new(image), registry);
        Self { store, reconciler }
    }

    /// Subscribes before returning, so later writes are observed.
    pub fn controller(&self) -> LocalController {
        LocalController::new(self.reconciler.clone(), self.store.subscribe())
    }

    pub fn create(&self, name: &str, spec: ModelSpec) -> ObjectKey {
        let mut model = Model::new(name, spec);
        model.metadata.namespace = Some(NS.into());
        let created = self.store.create_model(model).expect("create model");
        ObjectKey::of(&created)
    }

    pub async fn pass(&self, key: &ObjectKey) -> Result<(), ReconcileErr> {
        self.reconciler
            .reconcile(key, &CancellationToken::new())
            .await
    }

    pub fn model(&self, key: &ObjectKey) -> Model {
        self.store.model(key).expect("model exists")
    }

    /// The pod recorded in the Model's status, if it still exists.
    pub fn server_pod(&self, key: &ObjectKey) -> Option<Pod> {
        let model = self.store.model(key)?;
        let name = model.pod_ref_name();
        if name.is_empty() {
            return None;
        }
        self.store.pod(&ObjectKey::new(&key.namespace, name))
    }

    pub fn pods(&self) -> Vec<Pod> {
        self.store.pods_in(NS)
    }
}

pub fn post_start(pod: &Pod) -> String {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.lifecycle.as_ref())
        .and_then(|l| l.post_start.as_ref())
        .and_then(|h| h.exec.as_ref())
        .and_then(|e| e.command.as_ref())
        .and_then(|c| c.get(2))
        .cloned()
        .unwrap_or_default()
}

pub fn image(pod: &Pod) -> String {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.image.clone())
        .unwrap_or_default()
}

pub async fn wait_for_model_pod(
    ns: &str,
    name: &str,
    client: Client,
) -> Option<String> {
    let api: Api<Model> = Api::namespaced(client, ns);
    for _ in 0..60 {
        if let Ok(Some(m)) = api.get_opt(name).await {
            let pod = m.pod_ref_name();
            if !pod.is_empty() {
                return Some(pod.to_string());
            }
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;
    }
    None
}

// RAII guard to ensure controller abort + cleanup
pub struct ControllerGuard {
    ns: String,
    name: String,
    client: Client,
    ctrl: Option<JoinHandle<()>>,
}

impl ControllerGuard {
    pub fn new(ns: &str, name: &str, client: Client) -> Self {
        Self {
            ns: ns.to_string(),
            name: name.to_string(),
            client,
            ctrl: None,
        }
    }
    pub fn with_controller(mut self, ctrl: JoinHandle<()>) -> Self {
        self.ctrl = Some(ctrl);
        self
    }
}

impl Drop for ControllerGuard {
    fn drop(&mut self) {
        if let Some(ref handle) = self.ctrl {
            handle.abort();
        }
        let api: Api<Model> = Api::namespaced(self.client.clone(), &self.ns);
        let name = self.name.clone();
        let _ = tokio::spawn(async move {
            // best effort: the finalizer stays once the controller is gone
            let _ = api.delete(&name, &Default::default()).await;
            let patch = serde_json::json!({"metadata": {"finalizers": null}});
            let _ = api
                .patch(
                    &name,
                    &kube::api::PatchParams::default(),
                    &kube::api::Patch::Merge(&patch),
                )
                .await;
        });
    }
}

pub fn owner_of(pod: &Pod) -> Option<String> {
    pod.owner_references().first().map(|o| o.name.clone())
}
