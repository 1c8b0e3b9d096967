//! Velero server Deployment

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{
    ConfigMapProjection, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, ProjectedVolumeSource, SecretVolumeSource,
    ServiceAccountTokenProjection, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{
    env_var, non_empty, non_empty_vec, resources_or_default, BuildContext, DesiredObject,
    CA_BUNDLE_CONFIGMAP, VELERO_SERVICE_ACCOUNT,
};
use crate::crd::{DefaultPlugin, UploaderType, VeleroConfig};
use crate::error::{Error, Result};
use crate::reconcilers::images::{image_pull_policy, ImageKey};
use crate::store::ResourceKind;

pub const VELERO_NAME: &str = "velero";
pub const METRICS_PORT: i32 = 8085;

const PLUGINS_DIR: &str = "/plugins";
const SCRATCH_DIR: &str = "/scratch";
const CERTS_DIR: &str = "/etc/ssl/certs";
const CA_BUNDLE_DIR: &str = "/etc/velero-ca";
pub const BOUND_SA_TOKEN_DIR: &str = "/var/run/secrets/openshift/serviceaccount";
const DEFAULT_FS_BACKUP_TIMEOUT: &str = "4h";

const RESTORE_RESOURCE_PRIORITIES: &str = "securitycontextconstraints,customresourcedefinitions,\
namespaces,storageclasses,volumesnapshotclass.snapshot.storage.k8s.io,\
volumesnapshotcontents.snapshot.storage.k8s.io,volumesnapshots.snapshot.storage.k8s.io,\
persistentvolumes,persistentvolumeclaims,serviceaccounts,secrets,configmaps,limitranges,pods,\
replicasets.apps,clusterclasses.cluster.x-k8s.io,endpoints,services,-,\
clusterbootstraps.run.tanzu.vmware.com,clusters.cluster.x-k8s.io,\
clusterresourcesets.addons.cluster.x-k8s.io";

/// Pod selector shared by the Deployment and the metrics Service
pub fn selector_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("component".to_string(), "velero".to_string()),
        ("deploy".to_string(), "velero".to_string()),
    ])
}

pub(super) fn build(ctx: &BuildContext<'_>) -> Result<DesiredObject> {
    let spec = &ctx.dpa.spec;
    let velero = spec
        .velero()
        .ok_or_else(|| Error::internal("velero deployment built without velero configuration"))?;
    let pod_config = velero.pod_config.as_ref();

    let labels = ctx.labels(VELERO_NAME, ctx.dpa_name(), "server");
    let mut pod_labels = selector_labels();
    pod_labels.extend(labels.clone());
    if let Some(pc) = pod_config {
        pod_labels.extend(pc.labels.clone());
    }

    let velero_image = ctx.resolved.images.get(ImageKey::Velero).to_string();

    let mut volumes = vec![
        empty_dir("plugins"),
        empty_dir("scratch"),
        empty_dir("certs"),
    ];
    let mut mounts = vec![
        mount("plugins", PLUGINS_DIR),
        mount("scratch", SCRATCH_DIR),
        mount("certs", CERTS_DIR),
    ];
    for cred in ctx.resolved.credential_mounts() {
        volumes.push(Volume {
            name: cred.volume_name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(cred.secret_name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(mount(&cred.volume_name, &cred.mount_path));
    }
    if ctx.resolved.ca_bundle.is_some() {
        volumes.push(Volume {
            name: "ca-bundle".to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    config_map: Some(ConfigMapProjection {
                        name: CA_BUNDLE_CONFIGMAP.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(mount("ca-bundle", CA_BUNDLE_DIR));
    }
    if ctx.resolved.sts {
        volumes.push(bound_sa_token_volume());
        mounts.push(mount("bound-sa-token", BOUND_SA_TOKEN_DIR));
    }

    let container = Container {
        name: VELERO_NAME.to_string(),
        image: Some(velero_image.clone()),
        image_pull_policy: Some(image_pull_policy(spec, &velero_image)),
        command: Some(vec!["/velero".to_string()]),
        args: Some(server_args(ctx, velero)),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".to_string()),
            container_port: METRICS_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(server_env(ctx, velero)),
        resources: Some(resources_or_default(
            pod_config.and_then(|pc| pc.resource_allocations.as_ref()),
        )),
        volume_mounts: Some(mounts),
        termination_message_policy: Some("FallbackToLogsOnError".to_string()),
        ..Default::default()
    };

    let deployment = Deployment {
        metadata: ctx.metadata(VELERO_NAME, labels),
        spec: Some(DeploymentSpec {
            replicas: Some(ctx.env.velero_replicas_override.unwrap_or(1)),
            revision_history_limit: Some(10),
            progress_deadline_seconds: Some(600),
            selector: LabelSelector {
                match_labels: Some(selector_labels()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_surge: Some(IntOrString::String("25%".to_string())),
                    max_unavailable: Some(IntOrString::String("25%".to_string())),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: non_empty(&spec.pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(VELERO_SERVICE_ACCOUNT.to_string()),
                    init_containers: non_empty_vec(&plugin_containers(ctx)),
                    containers: vec![container],
                    volumes: Some(volumes),
                    node_selector: pod_config.and_then(|pc| non_empty(&pc.node_selector)),
                    tolerations: pod_config.and_then(|pc| non_empty_vec(&pc.tolerations)),
                    dns_policy: spec.pod_dns_policy.clone(),
                    dns_config: spec.pod_dns_config.clone(),
                    restart_policy: Some("Always".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    DesiredObject::new(ResourceKind::Deployment, &deployment)
}

/// One init container per plugin; each copies its binary into /target
fn plugin_containers(ctx: &BuildContext<'_>) -> Vec<Container> {
    let spec = &ctx.dpa.spec;
    let builtin = ctx.resolved.plugins.iter().filter_map(|plugin| {
        ImageKey::for_plugin(*plugin).map(|key| {
            (
                plugin.container_name().to_string(),
                ctx.resolved.images.get(key).to_string(),
            )
        })
    });
    let custom = ctx
        .resolved
        .custom_plugins
        .iter()
        .map(|p| (p.name.clone(), p.image.clone()));

    builtin
        .chain(custom)
        .map(|(name, image)| Container {
            name,
            image_pull_policy: Some(image_pull_policy(spec, &image)),
            image: Some(image),
            volume_mounts: Some(vec![mount("plugins", "/target")]),
            termination_message_policy: Some("FallbackToLogsOnError".to_string()),
            ..Default::default()
        })
        .collect()
}

fn server_args(ctx: &BuildContext<'_>, velero: &VeleroConfig) -> Vec<String> {
    let spec = &ctx.dpa.spec;
    let mut args = vec!["server".to_string()];

    if !ctx.resolved.feature_flags.is_empty() {
        let flags: Vec<&str> = ctx.resolved.feature_flags.iter().map(String::as_str).collect();
        args.push(format!("--features={}", flags.join(",")));
    }

    let node_agent = spec.node_agent();
    let uploader = node_agent.map(|n| n.uploader_type).unwrap_or_default();
    args.push(format!("--uploader-type={}", uploader.as_str()));

    match velero.default_volumes_to_fs_backup {
        Some(v) => args.push(format!("--default-volumes-to-fs-backup={v}")),
        None if spec.node_agent_enabled() && uploader == UploaderType::Restic => {
            args.push("--default-volumes-to-fs-backup=true".to_string())
        }
        None => {}
    }

    let fs_timeout = node_agent
        .and_then(|n| n.timeout.clone())
        .unwrap_or_else(|| DEFAULT_FS_BACKUP_TIMEOUT.to_string());
    args.push(format!("--fs-backup-timeout={fs_timeout}"));
    args.push(format!("--restore-resource-priorities={RESTORE_RESOURCE_PRIORITIES}"));

    if let Some(level) = &velero.log_level {
        args.push(format!("--log-level={level}"));
    }
    args.push(format!(
        "--disable-informer-cache={}",
        velero.disable_informer_cache.unwrap_or(false)
    ));
    if let Some(v) = velero.default_snapshot_move_data {
        args.push(format!("--default-snapshot-move-data={v}"));
    }
    if let Some(v) = &velero.item_operation_sync_frequency {
        args.push(format!("--item-operation-sync-frequency={v}"));
    }
    if let Some(v) = &velero.default_item_operation_timeout {
        args.push(format!("--default-item-operation-timeout={v}"));
    }
    if let Some(v) = &velero.resource_timeout {
        args.push(format!("--resource-timeout={v}"));
    }
    if let Some(v) = velero.client_burst {
        args.push(format!("--client-burst={v}"));
    }
    if let Some(v) = velero.client_qps {
        args.push(format!("--client-qps={v}"));
    }
    args
}

fn server_env(ctx: &BuildContext<'_>, velero: &VeleroConfig) -> Vec<EnvVar> {
    let mut env = vec![
        env_var("VELERO_SCRATCH_DIR", SCRATCH_DIR),
        EnvVar {
            name: "VELERO_NAMESPACE".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.namespace".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        env_var("LD_LIBRARY_PATH", PLUGINS_DIR),
    ];
    for (name, value) in &ctx.resolved.provider_env {
        env.push(env_var(name, value));
    }
    if ctx.resolved.locations.iter().any(|l| l.registry.is_some())
        && ctx.resolved.plugins.contains(&DefaultPlugin::OpenShift)
    {
        env.push(env_var("OPENSHIFT_IMAGESTREAM_BACKUP", "true"));
    }
    env.extend(ctx.proxy_env());
    if let Some(pc) = &velero.pod_config {
        env.extend(pc.env.iter().cloned());
    }
    env
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

pub(super) fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn bound_sa_token_volume() -> Volume {
    Volume {
        name: "bound-sa-token".to_string(),
        projected: Some(ProjectedVolumeSource {
            default_mode: Some(0o420),
            sources: Some(vec![VolumeProjection {
                service_account_token: Some(ServiceAccountTokenProjection {
                    audience: Some("openshift".to_string()),
                    expiration_seconds: Some(3600),
                    path: "token".to_string(),
                }),
                ..Default::default()
            }]),
        }),
        ..Default::default()
    }
}
