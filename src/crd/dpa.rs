//! DataProtectionApplication Custom Resource Definition

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{EnvVar, PodDNSConfig, ResourceRequirements, Toleration};
use k8s_openapi::ByteString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::velero::{BackupStorageLocationSpec, VolumeSnapshotLocationSpec};
use super::{Condition, CredentialRef};

/// DataProtectionApplication resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "oadp.openshift.io",
    version = "v1alpha1",
    kind = "DataProtectionApplication",
    plural = "dataprotectionapplications",
    singular = "dataprotectionapplication",
    shortname = "dpa",
    namespaced,
    status = "DataProtectionApplicationStatus",
    printcolumn = r#"{"name": "Reconciled", "type": "string", "jsonPath": ".status.conditions[?(@.type==\"Reconciled\")].status"}"#,
    printcolumn = r#"{"name": "Reason", "type": "string", "jsonPath": ".status.conditions[?(@.type==\"Reconciled\")].reason"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataProtectionApplicationSpec {
    /// Backup storage locations to create as Velero BackupStorageLocations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_locations: Vec<BackupLocation>,

    /// Volume snapshot locations to create as Velero VolumeSnapshotLocations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshot_locations: Vec<SnapshotLocation>,

    /// Image overrides keyed by image key (escape hatch, unsupported)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unsupported_overrides: BTreeMap<String, String>,

    /// Annotations added to every managed pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_annotations: BTreeMap<String, String>,

    /// DNS policy forwarded to managed pods
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_dns_policy: Option<String>,

    /// DNS config forwarded to managed pods
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_dns_config: Option<PodDNSConfig>,

    /// Create an internal image registry per backup location (default true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_images: Option<bool>,

    /// Velero and node agent configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ApplicationConfig>,

    /// Optional feature toggles
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,

    /// Image pull policy for managed containers (Always, IfNotPresent, Never)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Non-admin controller deployment toggle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub non_admin: Option<NonAdmin>,

    /// Log format for managed components (text, json)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<String>,
}

impl DataProtectionApplicationSpec {
    /// Whether the internal registry should be deployed
    pub fn backup_images(&self) -> bool {
        self.backup_images.unwrap_or(true)
    }

    pub fn velero(&self) -> Option<&VeleroConfig> {
        self.configuration.as_ref().and_then(|c| c.velero.as_ref())
    }

    pub fn node_agent(&self) -> Option<&NodeAgentConfig> {
        self.configuration.as_ref().and_then(|c| c.node_agent.as_ref())
    }

    /// Whether the node agent daemon set is enabled
    pub fn node_agent_enabled(&self) -> bool {
        self.node_agent().and_then(|n| n.enable).unwrap_or(false)
    }

    pub fn non_admin_enabled(&self) -> bool {
        self.non_admin.as_ref().and_then(|n| n.enable).unwrap_or(false)
    }

    pub fn data_mover_enabled(&self) -> bool {
        self.features
            .as_ref()
            .and_then(|f| f.data_mover.as_ref())
            .map(|d| d.enable)
            .unwrap_or(false)
    }

    /// Whether a Velero feature flag is declared
    pub fn has_feature_flag(&self, flag: &str) -> bool {
        self.velero()
            .map(|v| v.feature_flags.iter().any(|f| f == flag))
            .unwrap_or(false)
    }

    pub fn has_plugin(&self, plugin: DefaultPlugin) -> bool {
        self.velero()
            .map(|v| v.default_plugins.contains(&plugin))
            .unwrap_or(false)
    }
}

/// Application configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConfig {
    /// Velero server configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velero: Option<VeleroConfig>,

    /// Node agent (file system backup) configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_agent: Option<NodeAgentConfig>,
}

/// Velero server configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VeleroConfig {
    /// Velero feature flags (passed as --features)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feature_flags: Vec<String>,

    /// Built-in plugins to install as init containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_plugins: Vec<DefaultPlugin>,

    /// Additional plugins given by name and image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_plugins: Vec<CustomPlugin>,

    /// API group version priority for restores
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_resources_version_priority: Option<String>,

    /// Run without any backup location
    #[serde(default)]
    pub no_default_backup_location: bool,

    /// Pod scheduling and resource configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_config: Option<PodConfig>,

    /// Velero log level (trace, debug, info, warning, error, fatal, panic)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_operation_sync_frequency: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_item_operation_timeout: Option<String>,

    #[serde(rename = "defaultVolumesToFSBackup", skip_serializing_if = "Option::is_none")]
    pub default_volumes_to_fs_backup: Option<bool>,

    /// Run the node agent unprivileged without host volumes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_fs_backup: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_snapshot_move_data: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_informer_cache: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_timeout: Option<String>,

    #[serde(rename = "client-burst", skip_serializing_if = "Option::is_none")]
    pub client_burst: Option<i32>,

    #[serde(rename = "client-qps", skip_serializing_if = "Option::is_none")]
    pub client_qps: Option<i32>,
}

impl VeleroConfig {
    pub fn disable_fs_backup(&self) -> bool {
        self.disable_fs_backup.unwrap_or(false)
    }
}

/// Pod-level overrides shared by the Velero deployment and node agent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_allocations: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

/// Node agent configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAgentConfig {
    /// Deploy the node agent daemon set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,

    /// Uploader used for file system backups
    #[serde(default)]
    pub uploader_type: UploaderType,

    /// File system backup timeout (default 4h)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_config: Option<PodConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_mover_prepare_timeout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_timeout: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supplemental_groups: Vec<i64>,
}

/// Uploader implementation used by the node agent
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploaderType {
    Restic,
    #[default]
    Kopia,
}

impl UploaderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploaderType::Restic => "restic",
            UploaderType::Kopia => "kopia",
        }
    }
}

/// Built-in Velero plugins
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DefaultPlugin {
    #[serde(rename = "aws")]
    Aws,
    #[serde(rename = "legacy-aws")]
    LegacyAws,
    #[serde(rename = "gcp")]
    Gcp,
    #[serde(rename = "azure")]
    Azure,
    #[serde(rename = "csi")]
    Csi,
    #[serde(rename = "vsm")]
    Vsm,
    #[serde(rename = "openshift")]
    OpenShift,
    #[serde(rename = "kubevirt")]
    KubeVirt,
    #[serde(rename = "hypershift")]
    Hypershift,
}

impl DefaultPlugin {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefaultPlugin::Aws => "aws",
            DefaultPlugin::LegacyAws => "legacy-aws",
            DefaultPlugin::Gcp => "gcp",
            DefaultPlugin::Azure => "azure",
            DefaultPlugin::Csi => "csi",
            DefaultPlugin::Vsm => "vsm",
            DefaultPlugin::OpenShift => "openshift",
            DefaultPlugin::KubeVirt => "kubevirt",
            DefaultPlugin::Hypershift => "hypershift",
        }
    }

    /// Init container name for the plugin image
    pub fn container_name(&self) -> &'static str {
        match self {
            DefaultPlugin::Aws => "velero-plugin-for-aws",
            DefaultPlugin::LegacyAws => "velero-plugin-for-legacy-aws",
            DefaultPlugin::Gcp => "velero-plugin-for-gcp",
            DefaultPlugin::Azure => "velero-plugin-for-microsoft-azure",
            DefaultPlugin::Csi => "velero-plugin-for-csi",
            DefaultPlugin::Vsm => "vsm",
            DefaultPlugin::OpenShift => "velero-plugin-for-openshift",
            DefaultPlugin::KubeVirt => "kubevirt-velero-plugin",
            DefaultPlugin::Hypershift => "hypershift-oadp-plugin",
        }
    }

    /// Plugin serving a cloud provider name, if any
    pub fn for_provider(provider: &str) -> Option<DefaultPlugin> {
        match provider {
            "aws" => Some(DefaultPlugin::Aws),
            "gcp" => Some(DefaultPlugin::Gcp),
            "azure" => Some(DefaultPlugin::Azure),
            _ => None,
        }
    }
}

impl fmt::Display for DefaultPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plugin outside the built-in set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CustomPlugin {
    pub name: String,
    pub image: String,
}

/// Backup location entry; exactly one of `velero` or `bucket` is set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupLocation {
    /// Explicit BSL name; defaults to `<dpa-name>-<index>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Inline Velero BackupStorageLocation spec
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velero: Option<BackupStorageLocationSpec>,

    /// Reference to a CloudStorage in the same namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<CloudStorageLocation>,
}

impl BackupLocation {
    pub fn is_default(&self) -> bool {
        match (&self.velero, &self.bucket) {
            (Some(v), _) => v.default,
            (None, Some(b)) => b.default,
            (None, None) => false,
        }
    }
}

/// Backup location backed by a CloudStorage object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudStorageLocation {
    pub cloud_storage_ref: LocalObjectRef,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRef>,

    #[serde(default)]
    pub default: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_sync_period: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub ca_cert: Option<ByteString>,
}

/// Reference to an object by name in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalObjectRef {
    pub name: String,
}

/// Snapshot location entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotLocation {
    /// Explicit VSL name; defaults to `<dpa-name>-<index>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub velero: VolumeSnapshotLocationSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_mover: Option<DataMover>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DataMover {
    #[serde(default)]
    pub enable: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NonAdmin {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
}

/// DataProtectionApplication status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataProtectionApplicationStatus {
    /// Generation of the spec last reconciled successfully
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// `Reconciled` plus per-component availability conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Per-component readiness summary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentStatus>,
}

/// Readiness of one managed component group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub name: String,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<chrono::DateTime<chrono::Utc>>,
}
