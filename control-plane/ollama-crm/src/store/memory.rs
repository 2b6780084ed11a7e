//! In-process store with the API server semantics the reconciler relies on:
//! generated names, resource versions, finalizer-gated deletion, owner
//! cascade and change notifications.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{ObjectKey, ObjectStore, StoreError};
use crate::crd::model::{Model, ModelSpec};
use crate::registry::KindRegistry;

const NAME_SUFFIX_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o',
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3',
    '4', '5', '6', '7', '8', '9',
];

/// Store operations, used to target injected faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    GetModel,
    PatchModelMetadata,
    PatchModelStatus,
    GetPod,
    CreatePod,
    DeletePod,
    ListOwnedPods,
}

/// Change notification. Pod events carry the object as last seen, so a
/// deleted pod still exposes its owner references.
#[derive(Clone, Debug)]
pub enum StoreEvent {
    Model(ObjectKey),
    Pod(Pod),
}

#[derive(Default)]
struct State {
    models: BTreeMap<ObjectKey, Model>,
    pods: BTreeMap<ObjectKey, Pod>,
    // Model uid -> pods carrying its back-reference
    owned: HashMap<String, BTreeSet<ObjectKey>>,
    version: u64,
    mutations: u64,
    faults: HashMap<Op, VecDeque<StoreError>>,
    subscribers: Vec<mpsc::UnboundedSender<StoreEvent>>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn take_fault(&mut self, op: Op) -> Result<(), StoreError> {
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(e) => {
                debug!(?op, error = %e, "memory store: injected fault");
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn emit(&mut self, ev: StoreEvent) {
        self.subscribers.retain(|s| s.send(ev.clone()).is_ok());
    }

    fn insert_pod(&mut self, registry: &KindRegistry, key: ObjectKey, pod: Pod) {
        let owners = pod
            .owner_references()
            .iter()
            .filter(|o| registry.is_model_owner(o));
        for o in owners {
            self.owned
                .entry(o.uid.clone())
                .or_default()
                .insert(key.clone());
        }
        self.pods.insert(key, pod.clone());
        self.mutations += 1;
        self.emit(StoreEvent::Pod(pod));
    }

    fn remove_pod(&mut self, key: &ObjectKey) -> Option<Pod> {
        let pod = self.pods.remove(key)?;
        for o in pod.owner_references() {
            if let Some(set) = self.owned.get_mut(&o.uid) {
                set.remove(key);
                if set.is_empty() {
                    self.owned.remove(&o.uid);
                }
            }
        }
        self.mutations += 1;
        self.emit(StoreEvent::Pod(pod.clone()));
        Some(pod)
    }

    /// Drop the model and garbage-collect the pods it owns.
    fn erase_model(&mut self, key: &ObjectKey) {
        let Some(model) = self.models.remove(key) else {
            return;
        };
        self.mutations += 1;
        debug!(%key, "memory store: model erased");
        self.emit(StoreEvent::Model(key.clone()));
        let Some(uid) = model.uid() else {
            return;
        };
        let children: Vec<ObjectKey> = self
            .owned
            .get(&uid)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for child in children {
            trace!(%key, pod = %child, "memory store: cascade delete");
            self.remove_pod(&child);
        }
    }
}

#[derive(Clone, Copy)]
enum Section {
    Metadata,
    Status,
}

impl Section {
    fn field(self) -> &'static str {
        match self {
            Section::Metadata => "metadata",
            Section::Status => "status",
        }
    }
}

pub struct MemoryStore {
    registry: Arc<KindRegistry>,
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new(registry: Arc<KindRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // a panic while holding the lock leaves plain data behind
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Receive every change made from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().subscribers.push(tx);
        rx
    }

    /// Make the next call of `op` fail with `err`. Queued faults fire in
    /// order, one per call.
    pub fn fail_next(&self, op: Op, err: StoreError) {
        self.state().faults.entry(op).or_default().push_back(err);
    }

    /// Successful writes so far, including cascades.
    pub fn mutations(&self) -> u64 {
        self.state().mutations
    }

    pub fn model(&self, key: &ObjectKey) -> Option<Model> {
        self.state().models.get(key).cloned()
    }

    pub fn pod(&self, key: &ObjectKey) -> Option<Pod> {
        self.state().pods.get(key).cloned()
    }

    pub fn pods_in(&self, namespace: &str) -> Vec<Pod> {
        self.state()
            .pods
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Create a Model as a user would: uid, version and generation are
    /// assigned; status and finalizers are left as given.
    pub fn create_model(&self, mut model: Model) -> Result<Model, StoreError> {
        let key = ObjectKey::of(&model);
        if key.name.is_empty() {
            return Err(StoreError::Invalid("model has no name".into()));
        }
        let mut st = self.state();
        if st.models.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{key} already exists")));
        }
        model.metadata.namespace = Some(key.namespace.clone());
        model.metadata.uid = Some(nanoid::nanoid!());
        model.metadata.resource_version = Some(st.next_version());
        model.metadata.generation = Some(1);
        model.metadata.deletion_timestamp = None;
        st.models.insert(key.clone(), model.clone());
        st.mutations += 1;
        st.emit(StoreEvent::Model(key));
        Ok(model)
    }

    /// Change a Model's spec as a user would.
    pub fn update_model_spec(
        &self,
        key: &ObjectKey,
        f: impl FnOnce(&mut ModelSpec),
    ) -> Result<Model, StoreError> {
        let mut st = self.state();
        let version = st.next_version();
        let model = st
            .models
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found("Model", key))?;
        f(&mut model.spec);
        model.metadata.resource_version = Some(version);
        model.metadata.generation = Some(model.metadata.generation.unwrap_or(0) + 1);
        let updated = model.clone();
        st.mutations += 1;
        st.emit(StoreEvent::Model(key.clone()));
        Ok(updated)
    }

    /// Ask for deletion: erased at once without finalizers, otherwise marked
    /// with a deletion timestamp until the last finalizer is removed.
    pub fn request_model_deletion(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut st = self.state();
        let model = st
            .models
            .get(key)
            .ok_or_else(|| StoreError::not_found("Model", key))?;
        if model.finalizers().is_empty() {
            st.erase_model(key);
            return Ok(());
        }
        if model.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let ts = serde_json::from_value(json!(now))
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let version = st.next_version();
        if let Some(model) = st.models.get_mut(key) {
            model.metadata.deletion_timestamp = Some(ts);
            model.metadata.resource_version = Some(version);
        }
        st.mutations += 1;
        st.emit(StoreEvent::Model(key.clone()));
        Ok(())
    }

    fn patch_model(
        &self,
        key: &ObjectKey,
        patch: &Value,
        section: Section,
    ) -> Result<Model, StoreError> {
        let mut st = self.state();
        st.take_fault(match section {
            Section::Metadata => Op::PatchModelMetadata,
            Section::Status => Op::PatchModelStatus,
        })?;
        let current = st
            .models
            .get(key)
            .ok_or_else(|| StoreError::not_found("Model", key))?;
        if let Some(expected) = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
        {
            if current.metadata.resource_version.as_deref() != Some(expected) {
                return Err(StoreError::Conflict(format!(
                    "{key}: resourceVersion {expected} is stale"
                )));
            }
        }

        let mut doc = serde_json::to_value(current)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        if let Some(mut sub) = patch.get(section.field()).cloned() {
            if let Some(meta) = sub.as_object_mut() {
                if matches!(section, Section::Metadata) {
                    // identity and lifecycle fields are server-owned
                    for f in [
                        "resourceVersion",
                        "uid",
                        "name",
                        "namespace",
                        "deletionTimestamp",
                        "generation",
                    ] {
                        meta.remove(f);
                    }
                }
            }
            if let Some(obj) = doc.as_object_mut() {
                let target = obj
                    .entry(section.field().to_string())
                    .or_insert(Value::Null);
                json_patch::merge(target, &sub);
            }
        }
        let mut updated: Model = serde_json::from_value(doc)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        updated.metadata.resource_version = Some(st.next_version());

        if updated.metadata.deletion_timestamp.is_some()
            && updated.finalizers().is_empty()
        {
            st.erase_model(key);
            return Ok(updated);
        }
        st.models.insert(key.clone(), updated.clone());
        st.mutations += 1;
        st.emit(StoreEvent::Model(key.clone()));
        Ok(updated)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_model(&self, key: &ObjectKey) -> Result<Model, StoreError> {
        let mut st = self.state();
        st.take_fault(Op::GetModel)?;
        st.models
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Model", key))
    }

    async fn patch_model_metadata(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<Model, StoreError> {
        self.patch_model(key, patch, Section::Metadata)
    }

    async fn patch_model_status(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<Model, StoreError> {
        self.patch_model(key, patch, Section::Status)
    }

    async fn get_pod(&self, key: &ObjectKey) -> Result<Pod, StoreError> {
        let mut st = self.state();
        st.take_fault(Op::GetPod)?;
        st.pods
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Pod", key))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, StoreError> {
        let mut st = self.state();
        st.take_fault(Op::CreatePod)?;
        let ns = pod
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| StoreError::Invalid("pod has no namespace".into()))?;
        let name = match (&pod.metadata.name, &pod.metadata.generate_name) {
            (Some(n), _) if !n.is_empty() => n.clone(),
            (_, Some(prefix)) => loop {
                let candidate = format!(
                    "{prefix}{}",
                    nanoid::nanoid!(5, &NAME_SUFFIX_ALPHABET)
                );
                if !st.pods.contains_key(&ObjectKey::new(&ns, &candidate)) {
                    break candidate;
                }
            },
            _ => {
                return Err(StoreError::Invalid(
                    "pod needs a name or generateName".into(),
                ));
            }
        };
        let key = ObjectKey::new(ns, name);
        if st.pods.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{key} already exists")));
        }
        let mut created = pod.clone();
        created.metadata.name = Some(key.name.clone());
        created.metadata.uid = Some(nanoid::nanoid!());
        created.metadata.resource_version = Some(st.next_version());
        trace!(pod = %key, "memory store: pod created");
        st.insert_pod(&self.registry, key, created.clone());
        Ok(created)
    }

    async fn delete_pod(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut st = self.state();
        st.take_fault(Op::DeletePod)?;
        st.remove_pod(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("Pod", key))
    }

    async fn list_owned_pods(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<Pod>, StoreError> {
        let mut st = self.state();
        st.take_fault(Op::ListOwnedPods)?;
        let keys = st.owned.get(owner_uid).cloned().unwrap_or_default();
        Ok(keys
            .iter()
            .filter(|k| k.namespace == namespace)
            .filter_map(|k| st.pods.get(k).cloned())
            .collect())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state();
        f.debug_struct("MemoryStore")
            .field("model_kind", &self.registry.model().kind)
            .field("models", &st.models.len())
            .field("pods", &st.pods.len())
            .field("mutations", &st.mutations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::model::MODEL_FINALIZER;
    use crate::templates::ServerTemplate;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(KindRegistry::new()))
    }

    fn model(name: &str) -> Model {
        let mut m = Model::new(
            name,
            ModelSpec {
                images: vec!["llama3".into()],
                ..Default::default()
            },
        );
        m.metadata.namespace = Some("ns".into());
        m
    }

    fn owned_pod(store: &MemoryStore, owner: &Model) -> Pod {
        let oref = store
            .registry
            .owner_reference(owner)
            .expect("model has uid");
        ServerTemplate::default().build(owner, oref)
    }

    #[tokio::test]
    async fn generated_pod_names_extend_the_prefix() {
        let s = store();
        let m = s.create_model(model("llama")).unwrap();
        let a = s.create_pod(&owned_pod(&s, &m)).await.unwrap();
        let b = s.create_pod(&owned_pod(&s, &m)).await.unwrap();
        let (a, b) = (a.name_any(), b.name_any());
        assert!(a.starts_with("llama-") && a.len() == "llama-".len() + 5);
        assert_ne!(a, b);
        assert_eq!(s.pods_in("ns").len(), 2);
        assert!(s.pods_in("other").is_empty());
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let s = store();
        let m = s.create_model(model("llama")).unwrap();
        let key = ObjectKey::of(&m);
        s.update_model_spec(&key, |spec| spec.images.push("mistral".into()))
            .unwrap();
        let body = json!({"metadata": {
            "finalizers": [MODEL_FINALIZER],
            "resourceVersion": m.resource_version(),
        }});
        let err = s.patch_model_metadata(&key, &body).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(s.model(&key).unwrap().finalizers().is_empty());
    }

    #[tokio::test]
    async fn metadata_patch_cannot_rewrite_identity() {
        let s = store();
        let m = s.create_model(model("llama")).unwrap();
        let key = ObjectKey::of(&m);
        let body = json!({"metadata": {
            "uid": "forged",
            "labels": {"team": "ml"},
        }});
        let updated = s.patch_model_metadata(&key, &body).await.unwrap();
        assert_eq!(updated.metadata.uid, m.metadata.uid);
        assert_eq!(updated.labels().get("team").map(String::as_str), Some("ml"));
        assert_ne!(updated.resource_version(), m.resource_version());
    }

    #[tokio::test]
    async fn deletion_waits_for_finalizers_and_cascades() {
        let s = store();
        let mut m = model("llama");
        m.add_finalizer();
        let m = s.create_model(m).unwrap();
        let key = ObjectKey::of(&m);
        let pod = s.create_pod(&owned_pod(&s, &m)).await.unwrap();
        let pod_key = ObjectKey::of(&pod);

        s.request_model_deletion(&key).unwrap();
        let marked = s.model(&key).unwrap();
        assert!(marked.is_deleting());
        assert!(s.pod(&pod_key).is_some());

        let body = json!({"metadata": {"finalizers": null}});
        s.patch_model_metadata(&key, &body).await.unwrap();
        assert!(s.model(&key).is_none());
        assert!(s.pod(&pod_key).is_none(), "owned pod collected");
    }

    #[tokio::test]
    async fn deletion_without_finalizers_is_immediate() {
        let s = store();
        let m = s.create_model(model("llama")).unwrap();
        let key = ObjectKey::of(&m);
        s.request_model_deletion(&key).unwrap();
        assert!(s.model(&key).is_none());
        assert!(s.get_model(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn injected_faults_fire_once_in_order() {
        let s = store();
        let m = s.create_model(model("llama")).unwrap();
        let key = ObjectKey::of(&m);
        s.fail_next(Op::GetModel, StoreError::Transport("boom".into()));
        s.fail_next(Op::GetModel, StoreError::Conflict("again".into()));
        assert!(matches!(
            s.get_model(&key).await,
            Err(StoreError::Transport(_))
        ));
        assert!(matches!(
            s.get_model(&key).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(s.get_model(&key).await.is_ok());
    }

    #[tokio::test]
    async fn owned_listing_ignores_foreign_owners() {
        let s = store();
        let m = s.create_model(model("llama")).unwrap();
        let uid = m.uid().unwrap();
        s.create_pod(&owned_pod(&s, &m)).await.unwrap();

        let mut foreign = owned_pod(&s, &m);
        if let Some(refs) = foreign.metadata.owner_references.as_mut() {
            refs[0].kind = "ReplicaSet".into();
            refs[0].api_version = "apps/v1".into();
        }
        s.create_pod(&foreign).await.unwrap();

        assert_eq!(s.list_owned_pods("ns", &uid).await.unwrap().len(), 1);
        assert!(s.list_owned_pods("other", &uid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_writes() {
        let s = store();
        let mut rx = s.subscribe();
        let m = s.create_model(model("llama")).unwrap();
        let pod = s.create_pod(&owned_pod(&s, &m)).await.unwrap();
        s.delete_pod(&ObjectKey::of(&pod)).await.unwrap();

        assert!(matches!(rx.try_recv(), Ok(StoreEvent::Model(k)) if k.name == "llama"));
        assert!(matches!(rx.try_recv(), Ok(StoreEvent::Pod(_))));
        match rx.try_recv() {
            Ok(StoreEvent::Pod(p)) => assert_eq!(p.owner_references().len(), 1),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(s.mutations(), 3);
    }

    #[tokio::test]
    async fn deleting_a_missing_pod_is_not_found() {
        let s = store();
        let err = s
            .delete_pod(&ObjectKey::new("ns", "ghost"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
