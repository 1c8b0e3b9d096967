//! DataProtectionApplication reconciler
//!
//! One attempt runs validate, resolve, build, apply and aggregate-status
//! in that order. Failures are recorded on the DPA before they reach the
//! controller's error policy.

use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::apply::{apply, garbage_collect, ApplyOutcome, Owner};
use super::builders::build_all;
use super::resolver::{resolve, ObservedInputs};
use super::status::{
    condition, failure_status, observe_readiness, record_event, success_status, write_status,
    EventTarget, EventType, CONDITION_BSLS, CONDITION_RECONCILED,
};
use super::validator::validate;
use crate::config::OperatorEnv;
use crate::crd::DataProtectionApplication;
use crate::error::{Error, Result};
use crate::store::ClusterStore;

/// Finalizer releasing cluster-scoped children on delete
pub const DPA_FINALIZER: &str = "oadp.openshift.io/dpa-cleanup";

/// Requeue while children are still becoming ready
pub const REQUEUE_PROGRESSING: Duration = Duration::from_secs(30);

/// Periodic resync after a clean pass
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// Reconcile one DPA, recording any failure in its status
#[instrument(skip_all, fields(name = %dpa.name_any(), namespace = dpa.namespace()))]
pub async fn reconcile(
    store: &dyn ClusterStore,
    env: &OperatorEnv,
    dpa: &DataProtectionApplication,
    cancel: &CancellationToken,
) -> Result<Action> {
    match run(store, env, dpa, cancel).await {
        Ok(action) => Ok(action),
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            let status = failure_status(dpa, &e, Utc::now());
            let previous = dpa
                .status
                .as_ref()
                .and_then(|s| condition(&s.conditions, CONDITION_RECONCILED).cloned());
            match write_status(store, dpa, &status).await {
                Ok(true) => {
                    let now = condition(&status.conditions, CONDITION_RECONCILED);
                    if previous.as_ref().map(|c| (&c.reason, &c.message))
                        != now.map(|c| (&c.reason, &c.message))
                    {
                        record_event(
                            store,
                            &EventTarget::of(dpa),
                            EventType::Warning,
                            e.kind().as_str(),
                            &e.to_string(),
                        )
                        .await;
                    }
                }
                Ok(false) => {}
                Err(se) => warn!(error = %se, "failed to record failure status"),
            }
            Err(e)
        }
    }
}

async fn run(
    store: &dyn ClusterStore,
    env: &OperatorEnv,
    dpa: &DataProtectionApplication,
    cancel: &CancellationToken,
) -> Result<Action> {
    let observed = ObservedInputs::fetch(store, dpa).await?;
    let errors = validate(dpa, &observed);
    if !errors.is_empty() {
        return Err(Error::InvalidSpec(errors));
    }

    let resolved = resolve(dpa, &observed, env)?;
    let desired = build_all(dpa, &resolved, env)?;
    let owner = Owner::of_dpa(dpa)?;

    let mut deferred = false;
    for obj in &desired {
        if cancel.is_cancelled() {
            info!("shutdown requested, stopping before {}", obj.key());
            return Err(Error::Cancelled);
        }
        if apply(store, &owner, obj).await? == ApplyOutcome::Deferred {
            deferred = true;
        }
    }
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    garbage_collect(store, &owner, &desired).await?;

    // status is best effort from here on
    let groups = match observe_readiness(store, dpa, &resolved).await {
        Ok(groups) => groups,
        Err(e) => {
            warn!(error = %e, "failed to read child readiness");
            return Ok(Action::requeue(REQUEUE_PROGRESSING));
        }
    };
    let status = success_status(dpa, &groups, Utc::now());
    let previous = dpa.status.clone().unwrap_or_default();
    match write_status(store, dpa, &status).await {
        Ok(true) => {
            emit_transition_events(store, dpa, &previous.conditions, &status.conditions).await
        }
        Ok(false) => {}
        Err(e) => warn!(error = %e, "failed to write status"),
    }

    let ready = groups.iter().all(|g| g.ready);
    if deferred || !ready {
        debug!(deferred, ready, "children not settled yet");
        Ok(Action::requeue(REQUEUE_PROGRESSING))
    } else {
        Ok(Action::requeue(RESYNC_INTERVAL))
    }
}

async fn emit_transition_events(
    store: &dyn ClusterStore,
    dpa: &DataProtectionApplication,
    before: &[crate::crd::Condition],
    after: &[crate::crd::Condition],
) {
    let target = EventTarget::of(dpa);
    let was = condition(before, CONDITION_RECONCILED).map(|c| c.status.as_str());
    if condition(after, CONDITION_RECONCILED).map(|c| c.status.as_str()) == Some("True")
        && was != Some("True")
    {
        record_event(
            store,
            &target,
            EventType::Normal,
            "ReconcileComplete",
            "All children are ready",
        )
        .await;
    }

    let bsl_before = condition(before, CONDITION_BSLS).and_then(|c| c.message.clone());
    if let Some(bsl) = condition(after, CONDITION_BSLS) {
        let message = bsl.message.clone().unwrap_or_default();
        let unavailable = bsl.status == "False" && message.contains("Unavailable");
        if unavailable && bsl_before.as_ref() != Some(&message) {
            record_event(
                store,
                &target,
                EventType::Warning,
                "BackupStorageLocationUnavailable",
                &message,
            )
            .await;
        }
    }
}

/// Release what owner references cannot: cluster-scoped children
#[instrument(skip_all, fields(name = %dpa.name_any(), namespace = dpa.namespace()))]
pub async fn cleanup(store: &dyn ClusterStore, dpa: &DataProtectionApplication) -> Result<Action> {
    let owner = Owner::of_dpa(dpa)?;
    let deleted = garbage_collect(store, &owner, &[]).await?;
    info!(children = deleted.len(), "released DataProtectionApplication children");
    Ok(Action::await_change())
}
