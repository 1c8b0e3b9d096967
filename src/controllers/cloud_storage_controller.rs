//! CloudStorage controller
//!
//! Watches CloudStorage resources and keeps their buckets in sync.

use std::sync::Arc;

use futures::StreamExt;
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
use crate::crd::CloudStorage;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::cloud_storage::{self as cloud_storage_reconciler, BUCKET_FINALIZER};

const KIND: &str = "CloudStorage";

/// Run the CloudStorage controller
pub async fn run(context: Arc<Context>) -> Result<()> {
    let namespace = context.env.require_watch_namespace()?.to_string();
    let api: Api<CloudStorage> = Api::namespaced(context.client.clone(), &namespace);

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("CloudStorage CRD not installed: {}", e);
        return Err(e.into());
    }

    info!(namespace = %namespace, "Starting CloudStorage controller");

    Controller::new(api, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(CONCURRENCY))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or_default(),
                        "Reconciled CloudStorage"
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
async fn reconcile(obj: Arc<CloudStorage>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

    let key = backoff_key(obj.as_ref());
    let namespace = obj.namespace().unwrap_or_default();
    let api: Api<CloudStorage> = Api::namespaced(ctx.client.clone(), &namespace);

    let action = finalizer(&api, BUCKET_FINALIZER, obj, |event| async {
        let store = ctx.store.as_ref();
        let storage = ctx.storage.as_ref();
        match event {
            FinalizerEvent::Apply(cs) => cloud_storage_reconciler::apply(store, storage, &cs).await,
            FinalizerEvent::Cleanup(cs) => {
                cloud_storage_reconciler::cleanup(store, storage, &cs).await
            }
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))?;

    ctx.backoff.reset(&key);
    Ok(action)
}

/// Error policy for the controller
fn error_policy(obj: Arc<CloudStorage>, error: &Error, ctx: Arc<Context>) -> Action {
    metrics::RECONCILIATION_ERRORS
        .with_label_values(&[KIND, error.kind().as_str()])
        .inc();
    error!(
        name = %obj.name_any(),
        error = %error,
        "Reconciliation failed, scheduling retry"
    );
    ctx.backoff.on_error(&backoff_key(obj.as_ref()), error)
}
