//! Apply/own engine
//!
//! Converges each desired child onto the cluster with a three-way merge
//! between the last-applied snapshot (kept in an annotation), the observed
//! object and the desired object. Only fields the builders set take part,
//! so anything users add on top survives.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::builders::{
    DesiredObject, DPA_NAMESPACE_LABEL, DPA_NAME_LABEL, MANAGED_BY, MANAGED_BY_LABEL,
};
use crate::crd::DataProtectionApplication;
use crate::error::{Error, Result};
use crate::metrics;
use crate::store::{ClusterStore, ObjectKey, ResourceKind};

pub const LAST_APPLIED_ANNOTATION: &str = "oadp.openshift.io/last-applied-configuration";

/// Conflict retries before the error surfaces to the controller
pub const MAX_CONFLICT_RETRIES: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
    /// The object is being deleted; create again once it is gone
    Deferred,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Created => "created",
            ApplyOutcome::Updated => "updated",
            ApplyOutcome::Unchanged => "unchanged",
            ApplyOutcome::Deferred => "deferred",
        }
    }
}

/// The DPA children are applied for
#[derive(Clone, Debug)]
pub struct Owner {
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

impl Owner {
    pub fn of_dpa(dpa: &DataProtectionApplication) -> Result<Self> {
        let uid = dpa
            .uid()
            .ok_or_else(|| Error::internal(format!("DataProtectionApplication {} has no uid", dpa.name_any())))?;
        Ok(Self {
            name: dpa.name_any(),
            namespace: dpa.namespace().unwrap_or_default(),
            uid,
        })
    }

    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: DataProtectionApplication::api_version(&()).to_string(),
            kind: DataProtectionApplication::kind(&()).to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Whether `obj` belongs to this DPA
    pub fn owns(&self, kind: ResourceKind, obj: &DynamicObject) -> bool {
        if kind.is_namespaced() {
            obj.metadata
                .owner_references
                .as_ref()
                .map(|refs| refs.iter().any(|r| r.uid == self.uid))
                .unwrap_or(false)
        } else {
            let labels = obj.labels();
            labels.get(DPA_NAMESPACE_LABEL) == Some(&self.namespace)
                && labels.get(DPA_NAME_LABEL) == Some(&self.name)
        }
    }

    /// Name of another parent controlling `obj`, if any
    fn foreign_owner(&self, kind: ResourceKind, obj: &DynamicObject) -> Option<String> {
        if kind.is_namespaced() {
            obj.metadata
                .owner_references
                .as_ref()?
                .iter()
                .find(|r| r.controller == Some(true) && r.uid != self.uid)
                .map(|r| format!("{} {}", r.kind, r.name))
        } else {
            let labels = obj.labels();
            match (labels.get(DPA_NAMESPACE_LABEL), labels.get(DPA_NAME_LABEL)) {
                (Some(ns), Some(name)) if *ns != self.namespace || *name != self.name => {
                    Some(format!("DataProtectionApplication {ns}/{name}"))
                }
                _ => None,
            }
        }
    }

    /// Label selector for managed children of `kind`
    fn selector(&self, kind: ResourceKind) -> BTreeMap<String, String> {
        let mut selector =
            BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string())]);
        if !kind.is_namespaced() {
            selector.insert(DPA_NAMESPACE_LABEL.to_string(), self.namespace.clone());
            selector.insert(DPA_NAME_LABEL.to_string(), self.name.clone());
        }
        selector
    }
}

/// Apply one desired object, retrying on optimistic-concurrency conflicts
pub async fn apply(
    store: &dyn ClusterStore,
    owner: &Owner,
    desired: &DesiredObject,
) -> Result<ApplyOutcome> {
    let mut retries = 0;
    loop {
        match apply_once(store, owner, desired).await {
            Err(e) if e.is_conflict() && retries < MAX_CONFLICT_RETRIES => {
                retries += 1;
                debug!(object = %desired.key(), retries, "conflict, re-reading");
            }
            Ok(outcome) => {
                metrics::APPLIED_OBJECTS
                    .with_label_values(&[desired.kind.kind_name(), outcome.as_str()])
                    .inc();
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        }
    }
}

async fn apply_once(
    store: &dyn ClusterStore,
    owner: &Owner,
    desired: &DesiredObject,
) -> Result<ApplyOutcome> {
    let key = desired.key();
    let owned = owned_fields(&desired.object)?;
    let snapshot = serde_json::to_string(&owned)?;

    let Some(observed) = store.get(&key).await? else {
        let mut obj = desired.object.clone();
        obj.annotations_mut()
            .insert(LAST_APPLIED_ANNOTATION.to_string(), snapshot);
        if key.kind.is_namespaced() {
            obj.metadata.owner_references = Some(vec![owner.owner_reference()]);
        }
        store.create(key.kind, &obj).await?;
        info!(object = %key, "created");
        return Ok(ApplyOutcome::Created);
    };

    if observed.metadata.deletion_timestamp.is_some() {
        debug!(object = %key, "waiting for deletion to finish");
        return Ok(ApplyOutcome::Deferred);
    }
    if observed.labels().get(MANAGED_BY_LABEL).map(String::as_str) != Some(MANAGED_BY) {
        return Err(Error::OwnershipConflict(format!(
            "{key} exists and is not managed by {MANAGED_BY}"
        )));
    }
    if let Some(other) = owner.foreign_owner(key.kind, &observed) {
        return Err(Error::OwnershipConflict(format!("{key} is owned by {other}")));
    }

    let previous: Option<Value> = observed
        .annotations()
        .get(LAST_APPLIED_ANNOTATION)
        .and_then(|s| serde_json::from_str(s).ok());

    // Server-side defaults inside owned lists are not drift
    let observed_value = serde_json::to_value(&observed)?;
    let adopt = key.kind.is_namespaced() && !owner.owns(key.kind, &observed);
    if !adopt && previous.as_ref() == Some(&owned) && covers(&observed_value, &owned) {
        return Ok(ApplyOutcome::Unchanged);
    }

    let mut patch = owned;
    if let Some(previous) = &previous {
        add_removals(&mut patch, previous);
    }
    patch["metadata"]["annotations"][LAST_APPLIED_ANNOTATION] = Value::String(snapshot);
    if adopt {
        let mut refs = observed.metadata.owner_references.clone().unwrap_or_default();
        refs.push(owner.owner_reference());
        patch["metadata"]["ownerReferences"] = serde_json::to_value(refs)?;
    }

    let mut merged = observed_value.clone();
    json_patch::merge(&mut merged, &patch);
    if merged == observed_value {
        return Ok(ApplyOutcome::Unchanged);
    }

    if let Some(rv) = &observed.metadata.resource_version {
        patch["metadata"]["resourceVersion"] = json!(rv);
    }
    store.patch_merge(&key, &patch).await?;
    info!(object = %key, "updated");
    Ok(ApplyOutcome::Updated)
}

/// Delete managed children of `owner` that are no longer desired
pub async fn garbage_collect(
    store: &dyn ClusterStore,
    owner: &Owner,
    desired: &[DesiredObject],
) -> Result<Vec<ObjectKey>> {
    let keep: BTreeSet<ObjectKey> = desired.iter().map(DesiredObject::key).collect();
    let mut deleted = Vec::new();

    for kind in ResourceKind::MANAGED {
        let namespace = kind.is_namespaced().then_some(owner.namespace.as_str());
        for obj in store.list(*kind, namespace, &owner.selector(*kind)).await? {
            if !owner.owns(*kind, &obj) || obj.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let key = ObjectKey::of(*kind, &obj);
            if keep.contains(&key) {
                continue;
            }
            store.delete(&key).await?;
            metrics::APPLIED_OBJECTS
                .with_label_values(&[kind.kind_name(), "deleted"])
                .inc();
            info!(object = %key, "deleted stale child");
            deleted.push(key);
        }
    }
    Ok(deleted)
}

/// The part of a desired object the operator owns: everything except
/// server-managed metadata and status.
pub fn owned_fields(obj: &DynamicObject) -> Result<Value> {
    let mut value = serde_json::to_value(obj)?;
    if let Value::Object(map) = &mut value {
        map.remove("apiVersion");
        map.remove("kind");
        map.remove("status");
        let mut metadata = Map::new();
        if let Some(labels) = obj.metadata.labels.as_ref().filter(|l| !l.is_empty()) {
            metadata.insert("labels".to_string(), serde_json::to_value(labels)?);
        }
        if let Some(annotations) = &obj.metadata.annotations {
            let annotations: BTreeMap<&String, &String> = annotations
                .iter()
                .filter(|(k, _)| k.as_str() != LAST_APPLIED_ANNOTATION)
                .collect();
            if !annotations.is_empty() {
                metadata.insert("annotations".to_string(), serde_json::to_value(annotations)?);
            }
        }
        map.insert("metadata".to_string(), Value::Object(metadata));
    }
    Ok(value)
}

/// Whether `observed` carries every owned value. Objects may hold extra
/// keys at any depth; lists must match in length and element by element.
fn covers(observed: &Value, owned: &Value) -> bool {
    match (observed, owned) {
        (Value::Object(observed), Value::Object(owned)) => owned
            .iter()
            .all(|(k, v)| observed.get(k).map_or(v.is_null(), |o| covers(o, v))),
        (Value::Array(observed), Value::Array(owned)) => {
            observed.len() == owned.len()
                && observed.iter().zip(owned).all(|(o, v)| covers(o, v))
        }
        (observed, owned) => observed == owned,
    }
}

/// Null out fields present in the previous snapshot but no longer desired
fn add_removals(patch: &mut Value, previous: &Value) {
    let (Value::Object(patch_map), Value::Object(prev_map)) = (patch, previous) else {
        return;
    };
    for (k, prev) in prev_map {
        match patch_map.get_mut(k) {
            None => {
                patch_map.insert(k.clone(), Value::Null);
            }
            Some(current) => add_removals(current, prev),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removals_only_touch_previously_applied_fields() {
        let mut patch = json!({"spec": {"a": 1}, "metadata": {"labels": {"x": "1"}}});
        let previous = json!({"spec": {"a": 1, "b": 2}, "metadata": {"labels": {"x": "1", "y": "2"}}});
        add_removals(&mut patch, &previous);
        assert_eq!(
            patch,
            json!({"spec": {"a": 1, "b": null}, "metadata": {"labels": {"x": "1", "y": null}}})
        );
    }

    #[test]
    fn server_defaults_inside_lists_are_covered() {
        let owned = json!({"spec": {"containers": [{"name": "velero", "args": ["server"]}]}});
        let defaulted = json!({"spec": {"containers": [{
            "name": "velero",
            "args": ["server"],
            "terminationMessagePath": "/dev/termination-log",
            "imagePullPolicy": "IfNotPresent",
        }]}, "status": {}});
        assert!(covers(&defaulted, &owned));

        let drifted = json!({"spec": {"containers": [{"name": "velero", "args": ["server", "--x"]}]}});
        assert!(!covers(&drifted, &owned));
        let extra = json!({"spec": {"containers": [{"name": "velero", "args": ["server"]}, {"name": "sidecar"}]}});
        assert!(!covers(&extra, &owned));
    }

    #[test]
    fn owned_fields_drop_server_metadata() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm",
                "namespace": "ns",
                "uid": "u",
                "resourceVersion": "3",
                "labels": {"a": "b"},
                "annotations": {"oadp.openshift.io/last-applied-configuration": "{}"},
            },
            "data": {"k": "v"},
        }))
        .unwrap();
        assert_eq!(
            owned_fields(&obj).unwrap(),
            json!({"metadata": {"labels": {"a": "b"}}, "data": {"k": "v"}})
        );
    }
}
