//! Leader election on a coordination.k8s.io/v1 Lease
//!
//! Uses resourceVersion for compare-and-swap semantics: if the lease
//! changes between read and write the store reports a conflict and the
//! attempt counts as not acquired. Only the holder runs controllers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::store::{get_as, to_dynamic, ClusterStore, ObjectKey, ResourceKind};

/// Lease shared by every operator replica
pub const LEASE_NAME: &str = "oadp.openshift.io";

const INFRASTRUCTURE_NAME: &str = "cluster";
const SINGLE_REPLICA_TOPOLOGY: &str = "SingleReplica";

/// Lease timings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaderTimings {
    pub lease_duration: Duration,
    /// A holder that has not renewed within this window steps down
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

/// Defaults for highly available control planes
pub const HA_TIMINGS: LeaderTimings = LeaderTimings {
    lease_duration: Duration::from_secs(137),
    renew_deadline: Duration::from_secs(107),
    retry_period: Duration::from_secs(26),
};

/// Relaxed timings for single-node clusters, where API restarts are common
pub const SNO_TIMINGS: LeaderTimings = LeaderTimings {
    lease_duration: Duration::from_secs(270),
    renew_deadline: Duration::from_secs(240),
    retry_period: Duration::from_secs(60),
};

/// Pick timings from the cluster's control plane topology
pub async fn select_timings(store: &dyn ClusterStore) -> LeaderTimings {
    let key = ObjectKey::cluster(ResourceKind::Infrastructure, INFRASTRUCTURE_NAME);
    match store.get(&key).await {
        Ok(Some(infra)) => {
            let topology = infra
                .data
                .pointer("/status/controlPlaneTopology")
                .and_then(Value::as_str);
            if topology == Some(SINGLE_REPLICA_TOPOLOGY) {
                info!("single replica control plane, using relaxed leader election timings");
                SNO_TIMINGS
            } else {
                HA_TIMINGS
            }
        }
        Ok(None) => HA_TIMINGS,
        Err(e) => {
            warn!(error = %e, "unable to read cluster infrastructure, using default leader election timings");
            HA_TIMINGS
        }
    }
}

/// Leader elector backed by a Lease in the watch namespace
pub struct LeaderElector {
    store: Arc<dyn ClusterStore>,
    namespace: String,
    identity: String,
    timings: LeaderTimings,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        namespace: &str,
        identity: &str,
        timings: LeaderTimings,
    ) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            timings,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::namespaced(ResourceKind::Lease, &self.namespace, LEASE_NAME)
    }

    /// Block until leadership is acquired, then return a guard that keeps renewing
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, lease = LEASE_NAME, "waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    metrics::LEADER.set(1.0);
                    return self.create_guard();
                }
                Ok(false) => debug!(identity = %self.identity, "lease held by another replica"),
                Err(e) => warn!(identity = %self.identity, error = %e, "failed to acquire lease"),
            }
            tokio::time::sleep(self.timings.retry_period).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });
        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// One compare-and-set round: create, renew or take over the lease.
    ///
    /// Returns `Ok(false)` when another replica holds a live lease or won
    /// the race for it.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let Some(lease) = get_as::<Lease>(self.store.as_ref(), &self.key()).await? else {
            return self.create_lease(now).await;
        };

        let spec = lease.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() == Some(self.identity.as_str()) {
            let mut renewed = lease;
            if let Some(spec) = renewed.spec.as_mut() {
                spec.renew_time = Some(MicroTime(now));
                spec.lease_duration_seconds = Some(self.timings.lease_duration.as_secs() as i32);
            }
            return self.compare_and_set(&renewed).await;
        }

        let released = spec.holder_identity.as_deref().map_or(true, str::is_empty);
        let expired = match (&spec.renew_time, spec.lease_duration_seconds) {
            (Some(renewed), Some(seconds)) => {
                now > renewed.0 + chrono::Duration::seconds(i64::from(seconds))
            }
            _ => true,
        };
        if !released && !expired {
            return Ok(false);
        }

        let transitions = spec.lease_transitions.unwrap_or(0) + 1;
        let taken = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                resource_version: lease.metadata.resource_version.clone(),
                ..Default::default()
            },
            spec: Some(self.spec(now, transitions)),
        };
        let acquired = self.compare_and_set(&taken).await?;
        if acquired {
            info!(identity = %self.identity, transitions, "took over expired lease");
        }
        Ok(acquired)
    }

    fn spec(&self, now: chrono::DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.timings.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create_lease(&self, now: chrono::DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.spec(now, 0)),
        };
        match self.store.create(ResourceKind::Lease, &to_dynamic(&lease)?).await {
            Ok(_) => {
                info!(identity = %self.identity, "created lease");
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn compare_and_set(&self, lease: &Lease) -> Result<bool> {
        if lease.metadata.resource_version.is_none() {
            return Err(Error::internal("lease has no resourceVersion"));
        }
        match self.store.replace(ResourceKind::Lease, &to_dynamic(lease)?).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        let mut last_renewal = Instant::now();
        loop {
            tokio::time::sleep(self.timings.retry_period).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewal = Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "lease taken by another replica");
                    break;
                }
                Err(e) if last_renewal.elapsed() < self.timings.renew_deadline => {
                    warn!(identity = %self.identity, error = %e, "failed to renew lease, retrying");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "renew deadline exceeded");
                    break;
                }
            }
        }
        warn!(identity = %self.identity, "leadership lost");
        self.is_leader.store(false, Ordering::SeqCst);
        metrics::LEADER.set(0.0);
        let _ = lost_tx.send(());
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<()> {
        let Some(mut lease) = get_as::<Lease>(self.store.as_ref(), &self.key()).await? else {
            return Ok(());
        };
        let holds = lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            == Some(self.identity.as_str());
        if !holds {
            return Ok(());
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = Some(MicroTime(Utc::now() - chrono::Duration::seconds(60)));
        }
        self.compare_and_set(&lease).await?;
        info!(identity = %self.identity, "lease released");
        Ok(())
    }
}

/// Held while this replica leads; renewal runs in the background
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Step down during graceful shutdown
    pub async fn release_leadership(&self) -> Result<()> {
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        metrics::LEADER.set(0.0);
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "leadership released");
    }
}
