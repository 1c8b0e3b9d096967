use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use serde_json::json;

use super::velero::{selector_labels, METRICS_PORT};
use super::{BuildContext, DesiredObject};
use crate::error::Result;
use crate::store::ResourceKind;

const METRICS_SERVICE: &str = "openshift-adp-velero-metrics-svc";
const SERVICE_MONITOR: &str = "openshift-adp-velero-metrics-sm";

/// Metrics Service for the Velero pod and the ServiceMonitor scraping it
pub(super) fn build(ctx: &BuildContext<'_>) -> Result<Vec<DesiredObject>> {
    let labels = ctx.labels("velero", ctx.dpa_name(), "monitoring");

    let service = Service {
        metadata: ctx.metadata(METRICS_SERVICE, labels.clone()),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels()),
            ports: Some(vec![ServicePort {
                name: Some("monitoring".to_string()),
                port: METRICS_PORT,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(METRICS_PORT)),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };

    let monitor: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "monitoring.coreos.com/v1",
        "kind": "ServiceMonitor",
        "metadata": ctx.metadata(SERVICE_MONITOR, labels.clone()),
        "spec": {
            "endpoints": [{
                "interval": "30s",
                "port": "monitoring",
                "metricRelabelings": [{
                    "action": "keep",
                    "regex": "velero_backup_total|velero_restore_total",
                    "sourceLabels": ["__name__"],
                }],
            }],
            "selector": { "matchLabels": labels },
        },
    }))?;

    Ok(vec![
        DesiredObject::new(ResourceKind::Service, &service)?,
        DesiredObject {
            kind: ResourceKind::ServiceMonitor,
            object: monitor,
        },
    ])
}
