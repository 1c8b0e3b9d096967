//! CloudStorage Custom Resource Definition

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Condition, CredentialRef};

/// CloudStorage resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "oadp.openshift.io",
    version = "v1alpha1",
    kind = "CloudStorage",
    plural = "cloudstorages",
    singular = "cloudstorage",
    shortname = "cs",
    namespaced,
    status = "CloudStorageStatus",
    printcolumn = r#"{"name": "Bucket", "type": "string", "jsonPath": ".status.name"}"#,
    printcolumn = r#"{"name": "Last Synced", "type": "string", "jsonPath": ".status.lastSyncTimestamp"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CloudStorageSpec {
    /// Bucket name
    pub name: String,

    /// Object storage provider
    pub provider: CloudStorageProvider,

    /// Bucket region
    #[serde(default = "default_region")]
    pub region: String,

    /// Secret key holding credentials allowed to create the bucket
    pub creation_secret: CredentialRef,

    /// Use the shared AWS config file format for the credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_shared_config: Option<bool>,

    /// Tags applied to the bucket on creation
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Supported bucket providers
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CloudStorageProvider {
    Aws,
    Azure,
    Gcp,
}

impl CloudStorageProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudStorageProvider::Aws => "aws",
            CloudStorageProvider::Azure => "azure",
            CloudStorageProvider::Gcp => "gcp",
        }
    }
}

/// CloudStorage status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudStorageStatus {
    /// Bucket name last synced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Last successful sync with the provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
