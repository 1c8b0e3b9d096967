//! DataProtectionTest controller
//!
//! Runs each test once; terminal tests are left alone.

use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        watcher::Config as WatcherConfig,
    },
    Api, ResourceExt,
};
use tracing::{error, info, instrument};

use super::{backoff_key, Context, CONCURRENCY};
use crate::crd::DataProtectionTest;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::data_protection_test as dpt_reconciler;

const KIND: &str = "DataProtectionTest";

/// Run the DataProtectionTest controller
pub async fn run(context: Arc<Context>) -> Result<()> {
    let namespace = context.env.require_watch_namespace()?.to_string();
    let api: Api<DataProtectionTest> = Api::namespaced(context.client.clone(), &namespace);

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("DataProtectionTest CRD not installed: {}", e);
        return Err(e.into());
    }

    info!(namespace = %namespace, "Starting DataProtectionTest controller");

    Controller::new(api, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(CONCURRENCY))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            if let Err(e) = result {
                error!(error = %e, "Reconciliation error");
            }
        })
        .await;
    Ok(())
}

#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<DataProtectionTest>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

    let action = dpt_reconciler::reconcile(
        ctx.store.as_ref(),
        ctx.storage.as_ref(),
        &obj,
        &ctx.probes,
        &ctx.cancel,
    )
    .await?;
    ctx.backoff.reset(&backoff_key(obj.as_ref()));
    Ok(action)
}

fn error_policy(obj: Arc<DataProtectionTest>, error: &Error, ctx: Arc<Context>) -> Action {
    metrics::RECONCILIATION_ERRORS
        .with_label_values(&[KIND, error.kind().as_str()])
        .inc();
    error!(name = %obj.name_any(), error = %error, "Probe run failed, scheduling retry");
    ctx.backoff.on_error(&backoff_key(obj.as_ref()), error)
}
