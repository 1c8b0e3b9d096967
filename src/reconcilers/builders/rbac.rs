use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{BuildContext, DesiredObject, DPA_NAMESPACE_LABEL, DPA_NAME_LABEL};
use crate::error::Result;
use crate::store::ResourceKind;

pub const VELERO_SERVICE_ACCOUNT: &str = "velero";
const PRIVILEGED_SCC_ROLE: &str = "system:openshift:scc:privileged";
const METRICS_READER_BINDING: &str = "oadp-velero-metrics-reader";
const METRICS_READER_ROLE: &str = "oadp-metrics-reader";

pub(super) fn build(ctx: &BuildContext<'_>) -> Result<Vec<DesiredObject>> {
    let namespace = ctx.namespace();
    let labels = ctx.labels("velero", ctx.dpa_name(), "rbac");

    let sa = ServiceAccount {
        metadata: ctx.metadata(VELERO_SERVICE_ACCOUNT, labels.clone()),
        ..Default::default()
    };

    let mut cluster_labels = labels.clone();
    cluster_labels.insert(DPA_NAMESPACE_LABEL.to_string(), namespace.to_string());
    cluster_labels.insert(DPA_NAME_LABEL.to_string(), ctx.dpa_name().to_string());
    let crb = ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(privileged_binding_name(namespace)),
            labels: Some(cluster_labels),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: PRIVILEGED_SCC_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: VELERO_SERVICE_ACCOUNT.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    };

    let rb = RoleBinding {
        metadata: ctx.metadata(METRICS_READER_BINDING, labels),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: METRICS_READER_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: "prometheus-k8s".to_string(),
            namespace: Some("openshift-monitoring".to_string()),
            ..Default::default()
        }]),
    };

    Ok(vec![
        DesiredObject::new(ResourceKind::ServiceAccount, &sa)?,
        DesiredObject::new(ResourceKind::ClusterRoleBinding, &crb)?,
        DesiredObject::new(ResourceKind::RoleBinding, &rb)?,
    ])
}

pub fn privileged_binding_name(namespace: &str) -> String {
    format!("oadp-{namespace}-velero-privileged")
}
