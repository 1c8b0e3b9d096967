//! DataProtectionApplication controller
//!
//! Watches DPAs in the watch namespace plus every child kind they own and
//! triggers reconciliation.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config as WatcherConfig,
    },
    Api, ResourceExt,
};
use tracing::{error, info, instrument};

use super::{backoff_key, Context, CONCURRENCY};
use crate::crd::velero::{BackupStorageLocation, VolumeSnapshotLocation};
use crate::crd::DataProtectionApplication;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::dpa::{self as dpa_reconciler, DPA_FINALIZER};

const KIND: &str = "DataProtectionApplication";

/// Run the DataProtectionApplication controller
pub async fn run(context: Arc<Context>) -> Result<()> {
    let namespace = context.env.require_watch_namespace()?.to_string();
    let client = context.client.clone();
    let api: Api<DataProtectionApplication> = Api::namespaced(client.clone(), &namespace);

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("DataProtectionApplication CRD not installed: {}", e);
        return Err(e.into());
    }

    info!(namespace = %namespace, "Starting DataProtectionApplication controller");

    Controller::new(api, WatcherConfig::default())
        .owns(Api::<Deployment>::namespaced(client.clone(), &namespace), WatcherConfig::default())
        .owns(Api::<DaemonSet>::namespaced(client.clone(), &namespace), WatcherConfig::default())
        .owns(Api::<Service>::namespaced(client.clone(), &namespace), WatcherConfig::default())
        .owns(
            Api::<ServiceAccount>::namespaced(client.clone(), &namespace),
            WatcherConfig::default(),
        )
        .owns(Api::<ConfigMap>::namespaced(client.clone(), &namespace), WatcherConfig::default())
        .owns(Api::<Secret>::namespaced(client.clone(), &namespace), WatcherConfig::default())
        .owns(Api::<RoleBinding>::namespaced(client.clone(), &namespace), WatcherConfig::default())
        .owns(
            Api::<BackupStorageLocation>::namespaced(client.clone(), &namespace),
            WatcherConfig::default(),
        )
        .owns(
            Api::<VolumeSnapshotLocation>::namespaced(client.clone(), &namespace),
            WatcherConfig::default(),
        )
        .with_config(ControllerConfig::default().concurrency(CONCURRENCY))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or_default(),
                        "Reconciled DataProtectionApplication"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                }
            }
        })
        .await;
    Ok(())
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<DataProtectionApplication>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

    let key = backoff_key(obj.as_ref());
    let namespace = obj.namespace().unwrap_or_default();
    let api: Api<DataProtectionApplication> = Api::namespaced(ctx.client.clone(), &namespace);

    let action = finalizer(&api, DPA_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(dpa) => {
                dpa_reconciler::reconcile(ctx.store.as_ref(), &ctx.env, &dpa, &ctx.cancel).await
            }
            FinalizerEvent::Cleanup(dpa) => dpa_reconciler::cleanup(ctx.store.as_ref(), &dpa).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))?;

    ctx.backoff.reset(&key);
    Ok(action)
}

/// Error policy for the controller
fn error_policy(obj: Arc<DataProtectionApplication>, error: &Error, ctx: Arc<Context>) -> Action {
    metrics::RECONCILIATION_ERRORS
        .with_label_values(&[KIND, error.kind().as_str()])
        .inc();
    let action = ctx.backoff.on_error(&backoff_key(obj.as_ref()), error);
    error!(
        name = %obj.name_any(),
        error = %error,
        kind = %error.kind(),
        "Reconciliation failed, scheduling retry"
    );
    action
}
