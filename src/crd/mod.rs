//! Custom Resource Definitions for the OADP Operator

mod cloud_storage;
mod dpa;
pub mod velero;

pub use cloud_storage::*;
pub use data_protection_test::*;
pub use dpa::*;

use chrono::{DateTime, Utc};
use kube::CustomResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the operator's own kinds
pub const GROUP: &str = "oadp.openshift.io";

/// Reference to one key of a Secret in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CredentialRef {
    /// Secret name
    pub name: String,

    /// Key within the secret
    pub key: String,
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Machine-readable reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Generate all CRD YAML manifests shipped by the operator
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![
        serde_yaml::to_string(&DataProtectionApplication::crd())?,
        serde_yaml::to_string(&CloudStorage::crd())?,
        serde_yaml::to_string(&DataProtectionTest::crd())?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crds_carry_short_names() {
        let dpa = DataProtectionApplication::crd();
        let names = dpa.spec.names;
        assert_eq!(names.short_names, Some(vec!["dpa".to_string()]));
        assert_eq!(dpa.spec.group, GROUP);

        let dpt = DataProtectionTest::crd();
        assert_eq!(dpt.spec.names.short_names, Some(vec!["dpt".to_string()]));
    }

    #[test]
    fn generated_yaml_has_every_kind() {
        let docs = generate_crds().unwrap();
        assert_eq!(docs.len(), 3);
        assert!(docs[0].contains("DataProtectionApplication"));
        assert!(docs[1].contains("CloudStorage"));
        assert!(docs[2].contains("DataProtectionTest"));
    }

    #[test]
    fn condition_type_serializes_as_type() {
        let c = Condition {
            type_: "Reconciled".into(),
            status: "True".into(),
            last_transition_time: Utc::now(),
            reason: Some("Complete".into()),
            message: None,
        };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "Reconciled");
        assert!(v.get("message").is_none());
    }
}
