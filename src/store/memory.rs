//! In-memory ClusterStore used by tests and local runs

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use serde_json::Value;

use super::{ClusterStore, ObjectKey, ResourceKind};
use crate::{Error, Result};

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    next_resource_version: u64,
    next_uid: u64,
    pending_conflicts: usize,
    mutations: u64,
}

impl State {
    fn bump(&mut self, obj: &mut DynamicObject) {
        self.next_resource_version += 1;
        obj.metadata.resource_version = Some(self.next_resource_version.to_string());
        self.mutations += 1;
    }
}

/// ClusterStore holding objects in a map.
///
/// Mimics the API server where reconcilers can observe it: resource
/// versions, conflicts on stale writes, label selectors, deletion
/// timestamps for objects carrying finalizers, and owner-reference
/// cascade deletion.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` replace or merge-patch calls fail with a conflict
    pub fn inject_conflicts(&self, n: usize) {
        self.lock().pending_conflicts = n;
    }

    /// Number of writes performed so far
    pub fn mutation_count(&self) -> u64 {
        self.lock().mutations
    }

    /// Every stored object of a kind, across namespaces
    pub fn all(&self, kind: ResourceKind) -> Vec<DynamicObject> {
        self.lock()
            .objects
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Events recorded so far as `(reason, message)` pairs
    pub fn events(&self) -> Vec<(String, String)> {
        self.all(ResourceKind::Event)
            .into_iter()
            .map(|e| {
                let field = |name: &str| {
                    e.data
                        .get(name)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                (field("reason"), field("message"))
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only happens after a panicking test
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn key_for(kind: ResourceKind, obj: &DynamicObject) -> Result<ObjectKey> {
        let key = ObjectKey::of(kind, obj);
        if key.name.is_empty() {
            return Err(Error::internal(format!("{kind} without a name")));
        }
        if kind.is_namespaced() && key.namespace.is_none() {
            return Err(Error::internal(format!("{kind} {} without a namespace", key.name)));
        }
        Ok(key)
    }

    fn remove_cascading(state: &mut State, key: &ObjectKey) {
        let Some(removed) = state.objects.remove(key) else {
            return;
        };
        state.mutations += 1;
        let Some(uid) = removed.metadata.uid else {
            return;
        };
        let dependents: Vec<ObjectKey> = state
            .objects
            .iter()
            .filter(|(_, o)| {
                o.metadata
                    .owner_references
                    .as_ref()
                    .map(|refs| refs.iter().any(|r| r.uid == uid))
                    .unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for dep in dependents {
            Self::delete_locked(state, &dep);
        }
    }

    fn delete_locked(state: &mut State, key: &ObjectKey) {
        let Some(obj) = state.objects.get(key).cloned() else {
            return;
        };
        let has_finalizers = obj
            .metadata
            .finalizers
            .as_ref()
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if has_finalizers {
            if obj.metadata.deletion_timestamp.is_none() {
                let mut obj = obj;
                obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
                state.bump(&mut obj);
                state.objects.insert(key.clone(), obj);
            }
        } else {
            Self::remove_cascading(state, key);
        }
    }

    /// Store an updated object, keeping server-owned fields and finishing
    /// deletion when the last finalizer is gone.
    fn commit(
        state: &mut State,
        key: &ObjectKey,
        existing: &DynamicObject,
        mut obj: DynamicObject,
    ) -> DynamicObject {
        obj.metadata.uid = existing.metadata.uid.clone();
        obj.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        obj.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
        obj.metadata.namespace = existing.metadata.namespace.clone();
        obj.metadata.name = existing.metadata.name.clone();
        if obj.types.is_none() {
            obj.types = existing.types.clone();
        }

        let generation = existing.metadata.generation.unwrap_or(1);
        let spec_changed = strip_status(&obj.data) != strip_status(&existing.data);
        obj.metadata.generation = Some(if spec_changed { generation + 1 } else { generation });

        let finalizers_empty = obj
            .metadata
            .finalizers
            .as_ref()
            .map(|f| f.is_empty())
            .unwrap_or(true);
        if obj.metadata.deletion_timestamp.is_some() && finalizers_empty {
            state.objects.insert(key.clone(), obj.clone());
            Self::remove_cascading(state, key);
            return obj;
        }

        state.bump(&mut obj);
        state.objects.insert(key.clone(), obj.clone());
        obj
    }
}

fn strip_status(data: &Value) -> Value {
    let mut data = data.clone();
    if let Value::Object(map) = &mut data {
        map.remove("status");
    }
    data
}

fn labels_match(obj: &DynamicObject, selector: &BTreeMap<String, String>) -> bool {
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        Ok(self.lock().objects.get(key).cloned())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
            .filter(|(_, o)| labels_match(o, labels))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = Self::key_for(kind, obj)?;
        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            return Err(Error::Conflict(format!("{key} already exists")));
        }
        let mut obj = obj.clone();
        if obj.types.is_none() {
            obj.types = Some(kube::api::TypeMeta {
                api_version: kind.api_version(),
                kind: kind.kind_name().to_string(),
            });
        }
        state.next_uid += 1;
        obj.metadata.uid = Some(format!("uid-{}", state.next_uid));
        obj.metadata.creation_timestamp = Some(Time(Utc::now()));
        obj.metadata.deletion_timestamp = None;
        obj.metadata.generation = Some(1);
        state.bump(&mut obj);
        state.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn replace(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = Self::key_for(kind, obj)?;
        let mut state = self.lock();
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(Error::Conflict(format!("{key} was modified")));
        }
        let existing = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != existing.metadata.resource_version
        {
            return Err(Error::Conflict(format!("{key} was modified")));
        }
        let mut obj = obj.clone();
        match existing.data.get("status") {
            Some(status) => {
                if let Value::Object(map) = &mut obj.data {
                    map.insert("status".to_string(), status.clone());
                }
            }
            None => {
                if let Value::Object(map) = &mut obj.data {
                    map.remove("status");
                }
            }
        }
        Ok(Self::commit(&mut state, &key, &existing, obj))
    }

    async fn patch_merge(&self, key: &ObjectKey, patch: &Value) -> Result<DynamicObject> {
        let mut state = self.lock();
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(Error::Conflict(format!("{key} was modified")));
        }
        let existing = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let expected = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        if expected.is_some() && expected != existing.metadata.resource_version.as_deref() {
            return Err(Error::Conflict(format!("{key} was modified")));
        }
        let mut value = serde_json::to_value(&existing)?;
        let mut patch = patch.clone();
        if let Value::Object(map) = &mut patch {
            map.remove("status");
        }
        json_patch::merge(&mut value, &patch);
        let obj: DynamicObject = serde_json::from_value(value)?;
        Ok(Self::commit(&mut state, key, &existing, obj))
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<DynamicObject> {
        let mut state = self.lock();
        let existing = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let mut obj = existing.clone();
        if let Some(status_patch) = patch.get("status") {
            if let Value::Object(map) = &mut obj.data {
                let status = map.entry("status".to_string()).or_insert(Value::Null);
                json_patch::merge(status, status_patch);
            }
        }
        state.bump(&mut obj);
        state.objects.insert(key.clone(), obj.clone());
        Ok(obj)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.lock();
        Self::delete_locked(&mut state, key);
        Ok(())
    }
}
