//! Desired-state builders for DataProtectionApplication children
//!
//! Every builder is a pure function of the DPA and its resolved
//! descriptors. Fields a builder leaves unset are not owned by the
//! operator and are never touched by the apply engine.

mod bsl;
mod ca_bundle;
mod monitoring;
mod node_agent;
mod non_admin;
mod rbac;
mod registry;
mod velero;
mod version_priority;
mod vsl;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use serde::Serialize;

use crate::config::OperatorEnv;
use crate::crd::DataProtectionApplication;
use crate::error::Result;
use crate::store::{to_dynamic, ObjectKey, ResourceKind};

use super::resolver::ResolvedDpa;

pub use ca_bundle::{CA_BUNDLE_CONFIGMAP, CA_BUNDLE_KEY};
pub use node_agent::NODE_AGENT_NAME;
pub use non_admin::NON_ADMIN_NAME;
pub use rbac::{privileged_binding_name, VELERO_SERVICE_ACCOUNT};
pub use registry::{registry_deployment_name, registry_route_name};
pub use velero::VELERO_NAME;
pub use version_priority::{API_GROUP_VERSIONS_CONFIGMAP, VERSION_PRIORITY_KEY};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "oadp-operator";
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const OADP_LABEL: &str = "openshift.io/oadp";

/// Labels tying cluster-scoped children back to their DPA
pub const DPA_NAMESPACE_LABEL: &str = "oadp.openshift.io/dpa-namespace";
pub const DPA_NAME_LABEL: &str = "oadp.openshift.io/dpa-name";

/// One object the DPA should own
#[derive(Clone, Debug)]
pub struct DesiredObject {
    pub kind: ResourceKind,
    pub object: DynamicObject,
}

impl DesiredObject {
    pub fn new<T: Serialize>(kind: ResourceKind, obj: &T) -> Result<Self> {
        Ok(Self {
            kind,
            object: to_dynamic(obj)?,
        })
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(self.kind, &self.object)
    }
}

/// Inputs shared by every builder
pub struct BuildContext<'a> {
    pub dpa: &'a DataProtectionApplication,
    pub resolved: &'a ResolvedDpa,
    pub env: &'a OperatorEnv,
}

impl BuildContext<'_> {
    pub fn namespace(&self) -> &str {
        &self.resolved.namespace
    }

    pub fn dpa_name(&self) -> &str {
        &self.resolved.name
    }

    /// Standard labels for a child
    pub fn labels(&self, name: &str, instance: &str, component: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (NAME_LABEL.to_string(), name.to_string()),
            (INSTANCE_LABEL.to_string(), instance.to_string()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
            (COMPONENT_LABEL.to_string(), component.to_string()),
            (OADP_LABEL.to_string(), "True".to_string()),
        ])
    }

    pub fn metadata(&self, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace().to_string()),
            labels: Some(labels),
            ..Default::default()
        }
    }

    /// Proxy settings forwarded to managed pods
    pub fn proxy_env(&self) -> Vec<EnvVar> {
        self.env
            .proxy
            .iter()
            .map(|(k, v)| env_var(k, v))
            .collect()
    }
}

/// Build every desired child, in apply order
pub fn build_all(
    dpa: &DataProtectionApplication,
    resolved: &ResolvedDpa,
    env: &OperatorEnv,
) -> Result<Vec<DesiredObject>> {
    let ctx = BuildContext { dpa, resolved, env };
    let mut out = Vec::new();

    out.extend(ca_bundle::build(&ctx)?);
    out.extend(version_priority::build(&ctx)?);
    out.extend(rbac::build(&ctx)?);
    for location in &resolved.locations {
        out.push(bsl::build(&ctx, location)?);
    }
    for location in &resolved.snapshot_locations {
        out.push(vsl::build(&ctx, location)?);
    }
    out.push(velero::build(&ctx)?);
    if dpa.spec.node_agent_enabled() {
        out.push(node_agent::build(&ctx)?);
    }
    for location in &resolved.locations {
        if let Some(storage) = &location.registry {
            out.extend(registry::build(&ctx, location, storage)?);
        }
    }
    out.extend(monitoring::build(&ctx)?);
    if dpa.spec.non_admin_enabled() {
        out.extend(non_admin::build(&ctx)?);
    }
    Ok(out)
}

pub(crate) fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// `podConfig.resourceAllocations`, else the default requests
pub(crate) fn resources_or_default(configured: Option<&ResourceRequirements>) -> ResourceRequirements {
    if let Some(r) = configured {
        return r.clone();
    }
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("500m".to_string())),
            ("memory".to_string(), Quantity("128Mi".to_string())),
        ])),
        ..Default::default()
    }
}

fn non_empty<K: Ord + Clone, V: Clone>(map: &BTreeMap<K, V>) -> Option<BTreeMap<K, V>> {
    if map.is_empty() {
        None
    } else {
        Some(map.clone())
    }
}

fn non_empty_vec<T: Clone>(v: &[T]) -> Option<Vec<T>> {
    if v.is_empty() {
        None
    } else {
        Some(v.to_vec())
    }
}
