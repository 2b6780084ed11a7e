use kube::ResourceExt;
use serde_json::{Map, Value, json};

use crate::crd::model::Model;

/// A Model as loaded at the start of a pass plus the copy the pass mutates.
/// Status and metadata changes are written back as two merge patches
/// computed against `before`.
#[derive(Clone, Debug)]
pub struct ModelPatch {
    before: Model,
    pub working: Model,
}

impl ModelPatch {
    pub fn new(model: Model) -> Self {
        Self {
            before: model.clone(),
            working: model,
        }
    }

    pub fn before(&self) -> &Model {
        &self.before
    }

    /// Adopt metadata the store just persisted so it is not written again.
    pub fn rebase(&mut self, persisted: Model) {
        self.working.metadata = persisted.metadata.clone();
        self.before.metadata = persisted.metadata;
    }

    pub fn resource_version(&self) -> Option<String> {
        self.before.resource_version()
    }

    pub fn status_patch(&self) -> Option<Value> {
        let before = serde_json::to_value(&self.before.status).ok()?;
        let after = serde_json::to_value(&self.working.status).ok()?;
        merge_from(&before, &after).map(|diff| json!({ "status": diff }))
    }

    /// Carries `resource_version` so a concurrent writer makes the patch
    /// fail instead of being overwritten.
    pub fn metadata_patch(&self, resource_version: Option<&str>) -> Option<Value> {
        let before = serde_json::to_value(&self.before.metadata).ok()?;
        let after = serde_json::to_value(&self.working.metadata).ok()?;
        let mut diff = merge_from(&before, &after)?;
        if let (Some(obj), Some(rv)) = (diff.as_object_mut(), resource_version)
        {
            obj.insert("resourceVersion".into(), Value::String(rv.into()));
        }
        Some(json!({ "metadata": diff }))
    }
}

/// RFC 7386 merge patch that turns `before` into `after`, or `None` when
/// they are equal. Arrays and scalars are replaced whole.
pub fn merge_from(before: &Value, after: &Value) -> Option<Value> {
    if before == after {
        return None;
    }
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let mut out = Map::new();
            for (k, bv) in b {
                match a.get(k) {
                    None => {
                        out.insert(k.clone(), Value::Null);
                    }
                    Some(av) => {
                        if let Some(d) = merge_from(bv, av) {
                            out.insert(k.clone(), d);
                        }
                    }
                }
            }
            for (k, av) in a {
                if !b.contains_key(k) {
                    out.insert(k.clone(), av.clone());
                }
            }
            (!out.is_empty()).then_some(Value::Object(out))
        }
        _ => Some(after.clone()),
    }
}
