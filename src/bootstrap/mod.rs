//! One-shot process bootstrap
//!
//! Runs before the controllers start: pod security labels on the install
//! namespace, short-term credential secrets, and the choice of leader
//! election timings. Every step is idempotent.

pub mod leader;
pub mod psa;
pub mod sts;

use std::time::Duration;

use tracing::info;

use crate::config::OperatorEnv;
use crate::error::{Error, Result};
use crate::store::ClusterStore;

pub use leader::{LeaderElector, LeaderGuard, LeaderTimings};

/// How long to wait for a synthesized secret to become readable
#[derive(Clone, Debug)]
pub struct BootstrapSettings {
    pub secret_wait_timeout: Duration,
    pub secret_wait_interval: Duration,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            secret_wait_timeout: sts::SECRET_WAIT_TIMEOUT,
            secret_wait_interval: sts::SECRET_WAIT_INTERVAL,
        }
    }
}

/// What bootstrap decided
#[derive(Clone, Debug, PartialEq)]
pub struct Bootstrapped {
    pub timings: LeaderTimings,
    /// Name of the credentials secret written from the environment
    pub sts_secret: Option<&'static str>,
}

/// Run every bootstrap step; failures are reported as `Error::Bootstrap`
pub async fn run(
    store: &dyn ClusterStore,
    env: &OperatorEnv,
    settings: &BootstrapSettings,
) -> Result<Bootstrapped> {
    let namespace = env.require_watch_namespace()?;

    psa::label_namespace(store, namespace)
        .await
        .map_err(|e| bootstrap_error("labelling namespace", e))?;

    let credential = sts::detect(env)?;
    if let Some(credential) = &credential {
        info!(provider = credential.provider, "short-term credentials configured");
        sts::write_secret(store, namespace, credential)
            .await
            .map_err(|e| bootstrap_error("writing credentials secret", e))?;
        sts::wait_for_secret(
            store,
            namespace,
            credential.secret_name,
            settings.secret_wait_timeout,
            settings.secret_wait_interval,
        )
        .await?;
    }

    let timings = leader::select_timings(store).await;
    Ok(Bootstrapped {
        timings,
        sts_secret: credential.map(|c| c.secret_name),
    })
}

fn bootstrap_error(step: &str, err: Error) -> Error {
    match err {
        Error::Bootstrap(_) => err,
        other => Error::Bootstrap(format!("{step}: {other}")),
    }
}
