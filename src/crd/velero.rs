//! Velero kinds managed as DataProtectionApplication children

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::CredentialRef;

/// Velero BackupStorageLocation
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "BackupStorageLocation",
    plural = "backupstoragelocations",
    namespaced,
    status = "BackupStorageLocationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocationSpec {
    /// Object storage plugin provider name
    #[serde(default)]
    pub provider: String,

    /// Bucket and prefix
    #[serde(default)]
    pub object_storage: ObjectStorageLocation,

    /// Provider specific configuration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    /// Secret key holding the provider credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRef>,

    /// Default location for backups that name none
    #[serde(default)]
    pub default: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_sync_period: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_frequency: Option<String>,
}

/// Object storage coordinates of a backup location
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageLocation {
    #[serde(default)]
    pub bucket: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// PEM encoded CA bundle used to verify the storage endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub ca_cert: Option<ByteString>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocationStatus {
    /// Available or Unavailable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_validation_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Velero VolumeSnapshotLocation
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "VolumeSnapshotLocation",
    plural = "volumesnapshotlocations",
    namespaced,
    status = "VolumeSnapshotLocationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotLocationSpec {
    #[serde(default)]
    pub provider: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRef>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct VolumeSnapshotLocationStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// Phase reported by Velero when a location is usable
pub const PHASE_AVAILABLE: &str = "Available";
