//! Internal image registry per backup location

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, PodSpec, PodTemplateSpec,
    Probe, Secret, SecretKeySelector, SecretVolumeSource, Service, ServicePort, ServiceSpec,
    Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::DynamicObject;
use serde_json::json;

use super::velero::mount;
use super::{env_var, BuildContext, DesiredObject};
use crate::error::Result;
use crate::reconcilers::images::{image_pull_policy, ImageKey};
use crate::reconcilers::resolver::{RegistryStorage, ResolvedLocation};
use crate::store::ResourceKind;

const REGISTRY_PORT: i32 = 5000;
const REGISTRY_PORT_NAME: &str = "5000-tcp";

pub fn registry_deployment_name(bsl: &str) -> String {
    format!("{bsl}-registry")
}

fn registry_secret_name(bsl: &str) -> String {
    format!("{bsl}-registry-secret")
}

fn registry_service_name(bsl: &str) -> String {
    format!("{bsl}-registry-svc")
}

pub fn registry_route_name(bsl: &str) -> String {
    format!("{bsl}-registry-route")
}

fn selector_labels(bsl: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/component".to_string(), "registry".to_string()),
        ("app.kubernetes.io/instance".to_string(), bsl.to_string()),
    ])
}

pub(super) fn build(
    ctx: &BuildContext<'_>,
    location: &ResolvedLocation,
    storage: &RegistryStorage,
) -> Result<Vec<DesiredObject>> {
    let bsl = location.name.as_str();
    let labels = ctx.labels("registry", bsl, "registry");
    let mut out = Vec::new();

    if !storage.secret_data.is_empty() {
        let secret = Secret {
            metadata: ctx.metadata(&registry_secret_name(bsl), labels.clone()),
            type_: Some("Opaque".to_string()),
            data: Some(
                storage
                    .secret_data
                    .iter()
                    .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        out.push(DesiredObject::new(ResourceKind::Secret, &secret)?);
    }

    let mut env: Vec<EnvVar> = vec![
        env_var("REGISTRY_STORAGE_DELETE_ENABLED", "true"),
        env_var("REGISTRY_HTTP_ADDR", &format!(":{REGISTRY_PORT}")),
    ];
    env.extend(storage.env.iter().map(|(k, v)| env_var(k, v)));
    env.extend(storage.secret_env.iter().map(|(name, key)| EnvVar {
        name: name.clone(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: registry_secret_name(bsl),
                key: key.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }));
    env.extend(ctx.proxy_env());

    let (volumes, mounts) = match &storage.credential_mount {
        Some(m) => (
            Some(vec![Volume {
                name: m.volume_name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(m.secret_name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            Some(vec![mount(&m.volume_name, &m.mount_path)]),
        ),
        None => (None, None),
    };

    let probe = Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/v2/_catalog?n=5".to_string()),
            port: IntOrString::Int(REGISTRY_PORT),
            ..Default::default()
        }),
        period_seconds: Some(5),
        timeout_seconds: Some(3),
        ..Default::default()
    };

    let image = ctx.resolved.images.get(ImageKey::Registry).to_string();
    let deployment = Deployment {
        metadata: ctx.metadata(&registry_deployment_name(bsl), labels.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels(bsl)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector_labels(bsl)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "registry".to_string(),
                        image_pull_policy: Some(image_pull_policy(&ctx.dpa.spec, &image)),
                        image: Some(image),
                        ports: Some(vec![ContainerPort {
                            container_port: REGISTRY_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        env: Some(env),
                        liveness_probe: Some(probe.clone()),
                        readiness_probe: Some(probe),
                        volume_mounts: mounts,
                        ..Default::default()
                    }],
                    volumes,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    out.push(DesiredObject::new(ResourceKind::Deployment, &deployment)?);

    let service = Service {
        metadata: ctx.metadata(&registry_service_name(bsl), labels.clone()),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(bsl)),
            ports: Some(vec![ServicePort {
                name: Some(REGISTRY_PORT_NAME.to_string()),
                port: REGISTRY_PORT,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(REGISTRY_PORT)),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    out.push(DesiredObject::new(ResourceKind::Service, &service)?);

    let route: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "route.openshift.io/v1",
        "kind": "Route",
        "metadata": ctx.metadata(&registry_route_name(bsl), labels),
        "spec": {
            "to": { "kind": "Service", "name": registry_service_name(bsl) },
            "port": { "targetPort": REGISTRY_PORT_NAME },
        },
    }))?;
    out.push(DesiredObject {
        kind: ResourceKind::Route,
        object: route,
    });
    Ok(out)
}
