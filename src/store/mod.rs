//! Abstract access to cluster state.
//!
//! Reconcilers never talk to the API server directly; they go through a
//! [`ClusterStore`], which is either backed by a `kube::Client` or held in
//! memory for tests. Objects travel as `DynamicObject`s and are converted
//! to typed structs with [`to_dynamic`] and [`from_dynamic`].

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::Result;

/// Kinds the operator reads or writes
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Deployment,
    DaemonSet,
    Service,
    ServiceAccount,
    ConfigMap,
    Secret,
    Event,
    Namespace,
    RoleBinding,
    ClusterRoleBinding,
    Route,
    ServiceMonitor,
    BackupStorageLocation,
    VolumeSnapshotLocation,
    VolumeSnapshot,
    DataProtectionApplication,
    CloudStorage,
    DataProtectionTest,
    Infrastructure,
    Lease,
}

impl ResourceKind {
    /// Kinds created as DataProtectionApplication children, in apply order
    pub const MANAGED: &'static [ResourceKind] = &[
        ResourceKind::ConfigMap,
        ResourceKind::ServiceAccount,
        ResourceKind::ClusterRoleBinding,
        ResourceKind::RoleBinding,
        ResourceKind::BackupStorageLocation,
        ResourceKind::VolumeSnapshotLocation,
        ResourceKind::Deployment,
        ResourceKind::DaemonSet,
        ResourceKind::Secret,
        ResourceKind::Service,
        ResourceKind::Route,
        ResourceKind::ServiceMonitor,
    ];

    fn coordinates(&self) -> (&'static str, &'static str, &'static str, &'static str) {
        // (group, version, kind, plural)
        match self {
            ResourceKind::Deployment => ("apps", "v1", "Deployment", "deployments"),
            ResourceKind::DaemonSet => ("apps", "v1", "DaemonSet", "daemonsets"),
            ResourceKind::Service => ("", "v1", "Service", "services"),
            ResourceKind::ServiceAccount => ("", "v1", "ServiceAccount", "serviceaccounts"),
            ResourceKind::ConfigMap => ("", "v1", "ConfigMap", "configmaps"),
            ResourceKind::Secret => ("", "v1", "Secret", "secrets"),
            ResourceKind::Event => ("", "v1", "Event", "events"),
            ResourceKind::Namespace => ("", "v1", "Namespace", "namespaces"),
            ResourceKind::RoleBinding => {
                ("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings")
            }
            ResourceKind::ClusterRoleBinding => (
                "rbac.authorization.k8s.io",
                "v1",
                "ClusterRoleBinding",
                "clusterrolebindings",
            ),
            ResourceKind::Route => ("route.openshift.io", "v1", "Route", "routes"),
            ResourceKind::ServiceMonitor => {
                ("monitoring.coreos.com", "v1", "ServiceMonitor", "servicemonitors")
            }
            ResourceKind::BackupStorageLocation => {
                ("velero.io", "v1", "BackupStorageLocation", "backupstoragelocations")
            }
            ResourceKind::VolumeSnapshotLocation => {
                ("velero.io", "v1", "VolumeSnapshotLocation", "volumesnapshotlocations")
            }
            ResourceKind::VolumeSnapshot => {
                ("snapshot.storage.k8s.io", "v1", "VolumeSnapshot", "volumesnapshots")
            }
            ResourceKind::DataProtectionApplication => (
                crate::crd::GROUP,
                "v1alpha1",
                "DataProtectionApplication",
                "dataprotectionapplications",
            ),
            ResourceKind::CloudStorage => {
                (crate::crd::GROUP, "v1alpha1", "CloudStorage", "cloudstorages")
            }
            ResourceKind::DataProtectionTest => (
                crate::crd::GROUP,
                "v1alpha1",
                "DataProtectionTest",
                "dataprotectiontests",
            ),
            ResourceKind::Infrastructure => {
                ("config.openshift.io", "v1", "Infrastructure", "infrastructures")
            }
            ResourceKind::Lease => ("coordination.k8s.io", "v1", "Lease", "leases"),
        }
    }

    /// API resource descriptor for dynamic clients
    pub fn api_resource(&self) -> ApiResource {
        let (group, version, kind, plural) = self.coordinates();
        let api_version = if group.is_empty() {
            version.to_string()
        } else {
            format!("{group}/{version}")
        };
        ApiResource {
            group: group.to_string(),
            version: version.to_string(),
            api_version,
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }

    pub fn api_version(&self) -> String {
        self.api_resource().api_version
    }

    pub fn kind_name(&self) -> &'static str {
        self.coordinates().2
    }

    pub fn is_namespaced(&self) -> bool {
        !matches!(
            self,
            ResourceKind::Namespace | ResourceKind::ClusterRoleBinding | ResourceKind::Infrastructure
        )
    }

    /// Look a kind up by its `kind` string
    pub fn from_kind_name(kind: &str) -> Option<ResourceKind> {
        ALL_KINDS.iter().copied().find(|k| k.kind_name() == kind)
    }
}

const ALL_KINDS: &[ResourceKind] = &[
    ResourceKind::Deployment,
    ResourceKind::DaemonSet,
    ResourceKind::Service,
    ResourceKind::ServiceAccount,
    ResourceKind::ConfigMap,
    ResourceKind::Secret,
    ResourceKind::Event,
    ResourceKind::Namespace,
    ResourceKind::RoleBinding,
    ResourceKind::ClusterRoleBinding,
    ResourceKind::Route,
    ResourceKind::ServiceMonitor,
    ResourceKind::BackupStorageLocation,
    ResourceKind::VolumeSnapshotLocation,
    ResourceKind::VolumeSnapshot,
    ResourceKind::DataProtectionApplication,
    ResourceKind::CloudStorage,
    ResourceKind::DataProtectionTest,
    ResourceKind::Infrastructure,
    ResourceKind::Lease,
];

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_name())
    }
}

/// Identity of one object in the cluster
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn cluster(kind: ResourceKind, name: &str) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.to_string(),
        }
    }

    /// Key of a dynamic object of the given kind
    pub fn of(kind: ResourceKind, obj: &DynamicObject) -> Self {
        Self {
            kind,
            namespace: if kind.is_namespaced() {
                obj.metadata.namespace.clone()
            } else {
                None
            },
            name: obj.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Read and write access to cluster objects with optimistic concurrency.
///
/// `replace` is a compare-and-set on `metadata.resourceVersion` and fails
/// with [`crate::Error::Conflict`] when the stored version moved on.
/// `create` fails with `Conflict` when the object already exists.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    /// List objects of a kind, optionally within a namespace, matching every label
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn replace(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject>;

    /// JSON merge patch of the main resource
    async fn patch_merge(&self, key: &ObjectKey, patch: &Value) -> Result<DynamicObject>;

    /// JSON merge patch of the status subresource
    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<DynamicObject>;

    /// Delete an object; succeeds when it is already gone
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

/// Convert a typed Kubernetes object into a dynamic one
pub fn to_dynamic<T: Serialize>(obj: &T) -> Result<DynamicObject> {
    let value = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(value)?)
}

/// Convert a dynamic object into a typed one
pub fn from_dynamic<T: DeserializeOwned>(obj: &DynamicObject) -> Result<T> {
    let value = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(value)?)
}

/// Fetch and convert a typed object
pub async fn get_as<T: DeserializeOwned>(
    store: &dyn ClusterStore,
    key: &ObjectKey,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(obj) => Ok(Some(from_dynamic(&obj)?)),
        None => Ok(None),
    }
}

/// List and convert typed objects
pub async fn list_as<T: DeserializeOwned>(
    store: &dyn ClusterStore,
    kind: ResourceKind,
    namespace: Option<&str>,
) -> Result<Vec<T>> {
    store
        .list(kind, namespace, &BTreeMap::new())
        .await?
        .iter()
        .map(|o| from_dynamic::<T>(o))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_resource_for_core_and_grouped_kinds() {
        let secret = ResourceKind::Secret.api_resource();
        assert_eq!(secret.api_version, "v1");
        assert_eq!(secret.plural, "secrets");

        let bsl = ResourceKind::BackupStorageLocation.api_resource();
        assert_eq!(bsl.api_version, "velero.io/v1");
        assert!(!ResourceKind::ClusterRoleBinding.is_namespaced());
        assert_eq!(
            ResourceKind::from_kind_name("DaemonSet"),
            Some(ResourceKind::DaemonSet)
        );
    }

    #[test]
    fn typed_round_trip_keeps_kind() {
        let cm = k8s_openapi::api::core::v1::ConfigMap {
            metadata: kube::api::ObjectMeta {
                name: Some("velero-ca-bundle".into()),
                namespace: Some("openshift-adp".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let dynamic = to_dynamic(&cm).unwrap();
        assert_eq!(dynamic.types.as_ref().unwrap().kind, "ConfigMap");
        let key = ObjectKey::of(ResourceKind::ConfigMap, &dynamic);
        assert_eq!(key.to_string(), "ConfigMap openshift-adp/velero-ca-bundle");
    }
}
