//! File-system backup agent DaemonSet

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, RollingUpdateDaemonSet,
};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, HostPathVolumeSource,
    ObjectFieldSelector, PodSecurityContext, PodSpec, PodTemplateSpec, SeccompProfile,
    SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::velero::mount;
use super::{
    env_var, non_empty, non_empty_vec, resources_or_default, BuildContext, DesiredObject,
    VELERO_SERVICE_ACCOUNT,
};
use crate::error::{Error, Result};
use crate::reconcilers::images::{image_pull_policy, ImageKey};
use crate::store::ResourceKind;

pub const NODE_AGENT_NAME: &str = "node-agent";

const DEFAULT_PODS_HOSTPATH: &str = "/var/lib/kubelet/pods";
const DEFAULT_PLUGINS_HOSTPATH: &str = "/var/lib/kubelet/plugins";

fn selector_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("component".to_string(), "velero".to_string()),
        ("name".to_string(), NODE_AGENT_NAME.to_string()),
    ])
}

pub(super) fn build(ctx: &BuildContext<'_>) -> Result<DesiredObject> {
    let spec = &ctx.dpa.spec;
    let node_agent = spec
        .node_agent()
        .ok_or_else(|| Error::internal("node agent built without configuration"))?;
    let fs_disabled = spec.velero().map(|v| v.disable_fs_backup()).unwrap_or(false);
    let pod_config = node_agent.pod_config.as_ref();

    let labels = ctx.labels(NODE_AGENT_NAME, ctx.dpa_name(), "node-agent");
    let mut pod_labels = selector_labels();
    pod_labels.extend(labels.clone());
    if let Some(pc) = pod_config {
        pod_labels.extend(pc.labels.clone());
    }

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    if !fs_disabled {
        let pods = ctx.env.fs_pv_hostpath.as_deref().unwrap_or(DEFAULT_PODS_HOSTPATH);
        let plugins = ctx
            .env
            .plugins_hostpath
            .as_deref()
            .unwrap_or(DEFAULT_PLUGINS_HOSTPATH);
        volumes.push(host_path("host-pods", pods));
        volumes.push(host_path("host-plugins", plugins));
        mounts.push(VolumeMount {
            mount_propagation: Some("HostToContainer".to_string()),
            ..mount("host-pods", "/host_pods")
        });
        mounts.push(VolumeMount {
            mount_propagation: Some("HostToContainer".to_string()),
            ..mount("host-plugins", DEFAULT_PLUGINS_HOSTPATH)
        });
    }
    for (name, path) in [("scratch", "/scratch"), ("certs", "/etc/ssl/certs")] {
        volumes.push(Volume {
            name: name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        mounts.push(mount(name, path));
    }
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

    let mut args = vec![
        NODE_AGENT_NAME.to_string(),
        "server".to_string(),
        format!("--uploader-type={}", node_agent.uploader_type.as_str()),
    ];
    if let Some(v) = &node_agent.data_mover_prepare_timeout {
        args.push(format!("--data-mover-prepare-timeout={v}"));
    }
    if let Some(v) = &node_agent.resource_timeout {
        args.push(format!("--resource-timeout={v}"));
    }

    let mut env = vec![
        field_env("NODE_NAME", "spec.nodeName"),
        field_env("VELERO_NAMESPACE", "metadata.namespace"),
        env_var("VELERO_SCRATCH_DIR", "/scratch"),
    ];
    for (name, value) in &ctx.resolved.provider_env {
        env.push(env_var(name, value));
    }
    env.extend(ctx.proxy_env());
    if let Some(pc) = pod_config {
        env.extend(pc.env.iter().cloned());
    }

    let (pod_security, container_security) = if fs_disabled {
        (
            PodSecurityContext {
                run_as_non_root: Some(true),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                supplemental_groups: non_empty_vec(&node_agent.supplemental_groups),
                ..Default::default()
            },
            SecurityContext {
                allow_privilege_escalation: Some(false),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    } else {
        (
            PodSecurityContext {
                run_as_user: Some(0),
                supplemental_groups: non_empty_vec(&node_agent.supplemental_groups),
                ..Default::default()
            },
            SecurityContext {
                privileged: Some(true),
                ..Default::default()
            },
        )
    };

    let image = ctx.resolved.images.get(ImageKey::Velero).to_string();
    let container = Container {
        name: NODE_AGENT_NAME.to_string(),
        image_pull_policy: Some(image_pull_policy(spec, &image)),
        image: Some(image),
        command: Some(vec!["/velero".to_string()]),
        args: Some(args),
        env: Some(env),
        resources: Some(resources_or_default(
            pod_config.and_then(|pc| pc.resource_allocations.as_ref()),
        )),
        security_context: Some(container_security),
        volume_mounts: Some(mounts),
        termination_message_policy: Some("FallbackToLogsOnError".to_string()),
        ..Default::default()
    };

    let ds = DaemonSet {
        metadata: ctx.metadata(NODE_AGENT_NAME, labels),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels()),
                ..Default::default()
            },
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDaemonSet {
                    max_unavailable: Some(IntOrString::Int(1)),
                    ..Default::default()
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
                    containers: vec![container],
                    volumes: Some(volumes),
                    security_context: Some(pod_security),
                    node_selector: pod_config.and_then(|pc| non_empty(&pc.node_selector)),
                    tolerations: pod_config.and_then(|pc| non_empty_vec(&pc.tolerations)),
                    dns_policy: spec.pod_dns_policy.clone(),
                    dns_config: spec.pod_dns_config.clone(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    DesiredObject::new(ResourceKind::DaemonSet, &ds)
}

fn host_path(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
