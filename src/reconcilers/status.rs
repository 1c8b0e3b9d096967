//! Status aggregation and event recording

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::warn;

use super::builders::{registry_deployment_name, registry_route_name, NODE_AGENT_NAME, VELERO_NAME};
use super::resolver::ResolvedDpa;
use crate::crd::velero::{BackupStorageLocation, VolumeSnapshotLocation, PHASE_AVAILABLE};
use crate::crd::{ComponentStatus, Condition, DataProtectionApplication, DataProtectionApplicationStatus};
use crate::error::{Error, Result};
use crate::store::{get_as, to_dynamic, ClusterStore, ObjectKey, ResourceKind};

pub const CONDITION_RECONCILED: &str = "Reconciled";
pub const CONDITION_BSLS: &str = "BSLsAvailable";
pub const CONDITION_VSLS: &str = "VSLsAvailable";
pub const CONDITION_VELERO: &str = "VeleroAvailable";
pub const CONDITION_NODE_AGENT: &str = "NodeAgentAvailable";
pub const CONDITION_REGISTRY: &str = "RegistryAvailable";

pub const REASON_COMPLETE: &str = "Complete";
pub const REASON_PROGRESSING: &str = "Progressing";

const REPORTING_COMPONENT: &str = "oadp-operator";

/// Readiness of one child group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupReadiness {
    pub condition: &'static str,
    pub ready: bool,
    pub message: String,
}

impl GroupReadiness {
    fn new(condition: &'static str, problems: Vec<String>) -> Self {
        Self {
            condition,
            ready: problems.is_empty(),
            message: if problems.is_empty() {
                "available".to_string()
            } else {
                problems.join("; ")
            },
        }
    }
}

/// Read every owned child and compute per-group readiness
pub async fn observe_readiness(
    store: &dyn ClusterStore,
    dpa: &DataProtectionApplication,
    resolved: &ResolvedDpa,
) -> Result<Vec<GroupReadiness>> {
    let ns = resolved.namespace.as_str();
    let mut groups = Vec::new();

    let mut problems = Vec::new();
    for location in &resolved.locations {
        let key = ObjectKey::namespaced(ResourceKind::BackupStorageLocation, ns, &location.name);
        let phase = get_as::<BackupStorageLocation>(store, &key)
            .await?
            .and_then(|b| b.status)
            .and_then(|s| s.phase);
        if phase.as_deref() != Some(PHASE_AVAILABLE) {
            problems.push(format!(
                "BackupStorageLocation {} is {}",
                location.name,
                phase.as_deref().unwrap_or("pending")
            ));
        }
    }
    groups.push(GroupReadiness::new(CONDITION_BSLS, problems));

    let mut problems = Vec::new();
    for location in &resolved.snapshot_locations {
        let key = ObjectKey::namespaced(ResourceKind::VolumeSnapshotLocation, ns, &location.name);
        match get_as::<VolumeSnapshotLocation>(store, &key).await? {
            None => problems.push(format!("VolumeSnapshotLocation {} is missing", location.name)),
            Some(vsl) => {
                let phase = vsl.status.and_then(|s| s.phase);
                if let Some(phase) = phase.filter(|p| p != PHASE_AVAILABLE) {
                    problems.push(format!("VolumeSnapshotLocation {} is {phase}", location.name));
                }
            }
        }
    }
    groups.push(GroupReadiness::new(CONDITION_VSLS, problems));

    let mut problems = Vec::new();
    deployment_problem(store, ns, VELERO_NAME, &mut problems).await?;
    groups.push(GroupReadiness::new(CONDITION_VELERO, problems));

    if dpa.spec.node_agent_enabled() {
        let mut problems = Vec::new();
        let key = ObjectKey::namespaced(ResourceKind::DaemonSet, ns, NODE_AGENT_NAME);
        match get_as::<DaemonSet>(store, &key).await?.and_then(|d| d.status) {
            Some(s) if s.desired_number_scheduled == s.number_ready => {}
            Some(s) => problems.push(format!(
                "DaemonSet {NODE_AGENT_NAME} has {}/{} pods ready",
                s.number_ready, s.desired_number_scheduled
            )),
            None => problems.push(format!("DaemonSet {NODE_AGENT_NAME} has no status yet")),
        }
        groups.push(GroupReadiness::new(CONDITION_NODE_AGENT, problems));
    }

    let registries: Vec<&str> = resolved
        .locations
        .iter()
        .filter(|l| l.registry.is_some())
        .map(|l| l.name.as_str())
        .collect();
    if dpa.spec.backup_images() && !registries.is_empty() {
        let mut problems = Vec::new();
        for bsl in registries {
            deployment_problem(store, ns, &registry_deployment_name(bsl), &mut problems).await?;
            let route = store
                .get(&ObjectKey::namespaced(ResourceKind::Route, ns, &registry_route_name(bsl)))
                .await?;
            if !route.as_ref().map(route_admitted).unwrap_or(false) {
                problems.push(format!("Route {} is not admitted", registry_route_name(bsl)));
            }
        }
        groups.push(GroupReadiness::new(CONDITION_REGISTRY, problems));
    }

    Ok(groups)
}

async fn deployment_problem(
    store: &dyn ClusterStore,
    ns: &str,
    name: &str,
    problems: &mut Vec<String>,
) -> Result<()> {
    let key = ObjectKey::namespaced(ResourceKind::Deployment, ns, name);
    let Some(deployment) = get_as::<Deployment>(store, &key).await? else {
        problems.push(format!("Deployment {name} is missing"));
        return Ok(());
    };
    let wanted = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);
    if available < wanted {
        problems.push(format!("Deployment {name} has {available}/{wanted} replicas available"));
    }
    Ok(())
}

fn route_admitted(route: &DynamicObject) -> bool {
    route
        .data
        .pointer("/status/ingress")
        .and_then(Value::as_array)
        .map(|ingress| {
            ingress.iter().any(|i| {
                i.get("conditions")
                    .and_then(Value::as_array)
                    .map(|cs| {
                        cs.iter().any(|c| {
                            c.get("type").and_then(Value::as_str) == Some("Admitted")
                                && c.get("status").and_then(Value::as_str) == Some("True")
                        })
                    })
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Upsert a condition, keeping `lastTransitionTime` when the status is unchanged
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    let status = if status { "True" } else { "False" }.to_string();
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status;
            existing.reason = Some(reason.to_string());
            existing.message = Some(message.to_string());
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            last_transition_time: now,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }),
    }
}

pub fn condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Status after a reconcile whose steps all succeeded
pub fn success_status(
    dpa: &DataProtectionApplication,
    groups: &[GroupReadiness],
    now: DateTime<Utc>,
) -> DataProtectionApplicationStatus {
    let mut status = dpa.status.clone().unwrap_or_default();
    let mut waiting = Vec::new();
    for group in groups {
        let reason = if group.ready { REASON_COMPLETE } else { REASON_PROGRESSING };
        set_condition(&mut status.conditions, group.condition, group.ready, reason, &group.message, now);
        if !group.ready {
            waiting.push(group.message.clone());
        }
    }
    // groups that no longer apply (node agent disabled, no registry)
    status
        .conditions
        .retain(|c| c.type_ == CONDITION_RECONCILED || groups.iter().any(|g| g.condition == c.type_));

    if waiting.is_empty() {
        set_condition(
            &mut status.conditions,
            CONDITION_RECONCILED,
            true,
            REASON_COMPLETE,
            "Reconcile complete",
            now,
        );
    } else {
        set_condition(
            &mut status.conditions,
            CONDITION_RECONCILED,
            false,
            REASON_PROGRESSING,
            &format!("waiting for: {}", waiting.join("; ")),
            now,
        );
    }

    let previous = std::mem::take(&mut status.components);
    status.components = groups
        .iter()
        .map(|g| {
            let last = previous.iter().find(|c| c.name == g.condition);
            let last_transition_time = match last {
                Some(c) if c.ready == g.ready => c.last_transition_time,
                _ => Some(now),
            };
            ComponentStatus {
                name: g.condition.to_string(),
                ready: g.ready,
                message: Some(g.message.clone()),
                last_transition_time,
            }
        })
        .collect();
    status.observed_generation = dpa.metadata.generation;
    status
}

/// Status after a failed reconcile; `observedGeneration` is left alone
pub fn failure_status(
    dpa: &DataProtectionApplication,
    err: &Error,
    now: DateTime<Utc>,
) -> DataProtectionApplicationStatus {
    let mut status = dpa.status.clone().unwrap_or_default();
    set_condition(
        &mut status.conditions,
        CONDITION_RECONCILED,
        false,
        err.kind().as_str(),
        &err.to_string(),
        now,
    );
    status
}

/// Write the status subresource when it differs from what is stored
pub async fn write_status(
    store: &dyn ClusterStore,
    dpa: &DataProtectionApplication,
    status: &DataProtectionApplicationStatus,
) -> Result<bool> {
    if dpa.status.as_ref() == Some(status) {
        return Ok(false);
    }
    let key = ObjectKey::namespaced(
        ResourceKind::DataProtectionApplication,
        &dpa.namespace().unwrap_or_default(),
        &dpa.name_any(),
    );
    store.patch_status(&key, &json!({ "status": status })).await?;
    Ok(true)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Object an event is reported against
#[derive(Clone, Debug)]
pub struct EventTarget {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
}

impl EventTarget {
    pub fn of<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        Self {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            namespace: obj.meta().namespace.clone().unwrap_or_default(),
            name: obj.meta().name.clone().unwrap_or_default(),
            uid: obj.meta().uid.clone(),
        }
    }
}

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Record an Event; failures are logged and swallowed
pub async fn record_event(
    store: &dyn ClusterStore,
    target: &EventTarget,
    type_: EventType,
    reason: &str,
    message: &str,
) {
    let now = Utc::now();
    let seq = EVENT_SEQ.fetch_add(1, Ordering::Relaxed);
    let event = Event {
        metadata: ObjectMeta {
            name: Some(format!(
                "{}.{:x}{:x}",
                target.name,
                now.timestamp_nanos_opt().unwrap_or_default(),
                seq
            )),
            namespace: Some(target.namespace.clone()),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some(target.api_version.clone()),
            kind: Some(target.kind.clone()),
            name: Some(target.name.clone()),
            namespace: Some(target.namespace.clone()),
            uid: target.uid.clone(),
            ..Default::default()
        },
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        type_: Some(type_.as_str().to_string()),
        source: Some(EventSource {
            component: Some(REPORTING_COMPONENT.to_string()),
            ..Default::default()
        }),
        reporting_component: Some(REPORTING_COMPONENT.to_string()),
        first_timestamp: Some(Time(now)),
        last_timestamp: Some(Time(now)),
        count: Some(1),
        ..Default::default()
    };
    let result = match to_dynamic(&event) {
        Ok(obj) => store.create(ResourceKind::Event, &obj).await.map(|_| ()),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(reason, error = %e, "failed to record event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn transition_time_only_moves_on_status_change() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(30);
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Reconciled", false, "Progressing", "waiting", t0);
        set_condition(&mut conditions, "Reconciled", false, "Progressing", "still waiting", t1);
        assert_eq!(conditions[0].last_transition_time, t0);
        assert_eq!(conditions[0].message.as_deref(), Some("still waiting"));

        set_condition(&mut conditions, "Reconciled", true, "Complete", "done", t1);
        assert_eq!(conditions[0].last_transition_time, t1);
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn failure_reason_is_the_error_kind() {
        let dpa = DataProtectionApplication::new("dpa", Default::default());
        let status = failure_status(&dpa, &Error::dependency("secret missing"), Utc::now());
        let reconciled = condition(&status.conditions, CONDITION_RECONCILED).unwrap();
        assert_eq!(reconciled.status, "False");
        assert_eq!(reconciled.reason.as_deref(), Some("DependencyMissing"));
        assert!(status.observed_generation.is_none());
    }

    #[test]
    fn unready_group_keeps_reconciled_progressing() {
        let mut dpa = DataProtectionApplication::new("dpa", Default::default());
        dpa.metadata.generation = Some(3);
        let groups = vec![
            GroupReadiness::new(CONDITION_VELERO, vec![]),
            GroupReadiness::new(CONDITION_BSLS, vec!["BackupStorageLocation dpa-1 is pending".into()]),
        ];
        let status = success_status(&dpa, &groups, Utc::now());
        let reconciled = condition(&status.conditions, CONDITION_RECONCILED).unwrap();
        assert_eq!(reconciled.status, "False");
        assert_eq!(reconciled.reason.as_deref(), Some(REASON_PROGRESSING));
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(status.components.len(), 2);
    }
}
