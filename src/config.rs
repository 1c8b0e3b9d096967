//! Process configuration: command line flags and environment snapshot

use std::collections::BTreeMap;
use std::net::SocketAddr;

use clap::{ArgAction, Parser};

use crate::{Error, Result};

/// Command line flags of the operator process
#[derive(Parser, Debug, Clone)]
#[command(name = "oadp-operator", version, about = "OpenShift API for Data Protection operator")]
pub struct Args {
    /// Address the metrics endpoint binds to; "0" disables it
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = ":8080")]
    pub metrics_bind_address: String,

    /// Address the health probe endpoint binds to
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = ":8081")]
    pub health_probe_bind_address: String,

    /// Enable leader election; ensures a single active controller manager
    #[arg(
        long,
        env = "LEADER_ELECT",
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub leader_elect: bool,

    /// Serve metrics behind a TLS terminator
    #[arg(
        long,
        env = "METRICS_SECURE",
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub metrics_secure: bool,

    /// Allow HTTP/2 on the metrics and probe servers
    #[arg(
        long,
        env = "ENABLE_HTTP2",
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub enable_http2: bool,
}

/// Parse a bind address of the form `host:port` or `:port`.
///
/// Returns `Ok(None)` for `"0"`, which disables the listener.
pub fn parse_bind_address(addr: &str) -> Result<Option<SocketAddr>> {
    let addr = addr.trim();
    if addr == "0" {
        return Ok(None);
    }
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse::<SocketAddr>()
        .map(Some)
        .map_err(|e| Error::config(format!("invalid bind address {addr:?}: {e}")))
}

/// Proxy variables forwarded into managed pods
pub const PROXY_ENV_VARS: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
];

/// Snapshot of the process environment taken once at start
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OperatorEnv {
    pub watch_namespace: Option<String>,

    /// AWS STS role
    pub role_arn: Option<String>,

    /// GCP workload identity federation
    pub service_account_email: Option<String>,
    pub project_number: Option<String>,
    pub pool_id: Option<String>,
    pub provider_id: Option<String>,

    /// Azure federated identity
    pub client_id: Option<String>,
    pub tenant_id: Option<String>,
    pub subscription_id: Option<String>,

    /// `RELATED_IMAGE_*` values keyed by the suffix after the prefix
    pub related_images: BTreeMap<String, String>,

    pub velero_replicas_override: Option<i32>,
    pub fs_pv_hostpath: Option<String>,
    pub plugins_hostpath: Option<String>,

    /// Leader election identity
    pub pod_name: Option<String>,

    pub proxy: Vec<(String, String)>,
}

const RELATED_IMAGE_PREFIX: &str = "RELATED_IMAGE_";

impl OperatorEnv {
    /// Capture the environment of the running process
    pub fn from_process() -> Self {
        let related = std::env::vars()
            .filter(|(k, _)| k.starts_with(RELATED_IMAGE_PREFIX))
            .collect::<Vec<_>>();
        let mut env = Self::from_lookup(|k| std::env::var(k).ok());
        for (k, v) in related {
            if !v.is_empty() {
                env.related_images
                    .insert(k.trim_start_matches(RELATED_IMAGE_PREFIX).to_string(), v);
            }
        }
        env
    }

    /// Build from an arbitrary lookup; used with fixed maps in tests.
    ///
    /// `RELATED_IMAGE_*` entries are looked up by their known names only.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).filter(|v| !v.is_empty());

        let mut related_images = BTreeMap::new();
        for key in crate::reconcilers::images::RELATED_IMAGE_KEYS {
            if let Some(v) = get(&format!("{RELATED_IMAGE_PREFIX}{key}")) {
                related_images.insert(key.to_string(), v);
            }
        }

        let proxy = PROXY_ENV_VARS
            .iter()
            .filter_map(|k| get(k).map(|v| (k.to_string(), v)))
            .collect();

        Self {
            watch_namespace: get("WATCH_NAMESPACE"),
            role_arn: get("ROLEARN"),
            service_account_email: get("SERVICE_ACCOUNT_EMAIL"),
            project_number: get("PROJECT_NUMBER"),
            pool_id: get("POOL_ID"),
            provider_id: get("PROVIDER_ID"),
            client_id: get("CLIENTID"),
            tenant_id: get("TENANTID"),
            subscription_id: get("SUBSCRIPTIONID"),
            related_images,
            velero_replicas_override: get("VELERO_DEBUG_REPLICAS_OVERRIDE")
                .and_then(|v| v.parse().ok()),
            fs_pv_hostpath: get("FS_PV_HOSTPATH"),
            plugins_hostpath: get("PLUGINS_HOSTPATH"),
            pod_name: get("POD_NAME"),
            proxy,
        }
    }

    /// Environment for a watch namespace with nothing else set
    pub fn for_namespace(namespace: &str) -> Self {
        Self {
            watch_namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    /// The mandatory watch namespace
    pub fn require_watch_namespace(&self) -> Result<&str> {
        self.watch_namespace
            .as_deref()
            .ok_or_else(|| Error::Bootstrap("WATCH_NAMESPACE must be set".to_string()))
    }
}
