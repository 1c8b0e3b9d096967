use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use super::{env_var, BuildContext, DesiredObject};
use crate::error::Result;
use crate::reconcilers::images::{image_pull_policy, ImageKey};
use crate::store::ResourceKind;

pub const NON_ADMIN_NAME: &str = "non-admin-controller";

pub(super) fn build(ctx: &BuildContext<'_>) -> Result<Vec<DesiredObject>> {
    let labels = ctx.labels(NON_ADMIN_NAME, ctx.dpa_name(), "non-admin");
    let selector = BTreeMap::from([("control-plane".to_string(), NON_ADMIN_NAME.to_string())]);
    let mut pod_labels = selector.clone();
    pod_labels.extend(labels.clone());

    let log_level = ctx
        .dpa
        .spec
        .velero()
        .and_then(|v| v.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    let log_format = ctx.dpa.spec.log_format.clone().unwrap_or_else(|| "text".to_string());
    let image = ctx.resolved.images.get(ImageKey::NonAdminController).to_string();

    let sa = ServiceAccount {
        metadata: ctx.metadata(NON_ADMIN_NAME, labels.clone()),
        ..Default::default()
    };
    let deployment = Deployment {
        metadata: ctx.metadata(NON_ADMIN_NAME, labels),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(NON_ADMIN_NAME.to_string()),
                    containers: vec![Container {
                        name: NON_ADMIN_NAME.to_string(),
                        image_pull_policy: Some(image_pull_policy(&ctx.dpa.spec, &image)),
                        image: Some(image),
                        env: Some(vec![
                            env_var("WATCH_NAMESPACE", ctx.namespace()),
                            env_var("LOG_LEVEL", &log_level),
                            env_var("LOG_FORMAT", &log_format),
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(vec![
        DesiredObject::new(ResourceKind::ServiceAccount, &sa)?,
        DesiredObject::new(ResourceKind::Deployment, &deployment)?,
    ])
}
