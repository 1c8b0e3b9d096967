//! Pod Security Admission labels on the install namespace
//!
//! The node agent needs host mounts and privileged containers, so the
//! namespace is opted into the `privileged` profile. Other labels on the
//! namespace are left untouched.

use std::collections::BTreeMap;

use serde_json::json;
use tracing::info;

use crate::error::{Error, Result};
use crate::store::{ClusterStore, ObjectKey, ResourceKind};

pub const PSA_LABELS: &[&str] = &[
    "pod-security.kubernetes.io/enforce",
    "pod-security.kubernetes.io/audit",
    "pod-security.kubernetes.io/warn",
];

pub const PSA_PROFILE: &str = "privileged";

/// Merge the privileged PSA labels into the namespace
pub async fn label_namespace(store: &dyn ClusterStore, namespace: &str) -> Result<()> {
    let key = ObjectKey::cluster(ResourceKind::Namespace, namespace);
    let existing = store
        .get(&key)
        .await?
        .ok_or_else(|| Error::Bootstrap(format!("namespace {namespace} does not exist")))?;

    let current = existing.metadata.labels.unwrap_or_default();
    let missing: BTreeMap<&str, &str> = PSA_LABELS
        .iter()
        .filter(|l| current.get(**l).map(String::as_str) != Some(PSA_PROFILE))
        .map(|l| (*l, PSA_PROFILE))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    store
        .patch_merge(&key, &json!({ "metadata": { "labels": missing } }))
        .await?;
    info!(namespace, "applied privileged pod security labels");
    Ok(())
}
