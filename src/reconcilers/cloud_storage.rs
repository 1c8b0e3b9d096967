//! CloudStorage reconciler
//!
//! Converges one remote bucket onto its CloudStorage. Buckets are tagged
//! with the CR's uid on creation and only tagged buckets are ever deleted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::status::{record_event, set_condition, EventTarget, EventType};
use super::validator::parse_bool;
use crate::adapters::credentials::parse_aws_credentials;
use crate::adapters::object_storage::{
    ObjectStorage, ObjectStorageFactory, StorageTarget, OWNER_TAG,
};
use crate::adapters::secrets::{get_secret, get_secret_string};
use crate::crd::{CloudStorage, CloudStorageStatus, DataProtectionApplication};
use crate::error::{Error, Result};
use crate::metrics;
use crate::store::{list_as, ClusterStore, ObjectKey, ResourceKind};

/// Finalizer holding the CR until the bucket is released
pub const BUCKET_FINALIZER: &str = "oadp.openshift.io/bucket-protection";

/// Annotation opting in to remote bucket deletion
pub const DELETE_ANNOTATION: &str = "oadp.openshift.io/cloudstorage-delete";

pub const CONDITION_READY: &str = "Ready";

const REQUEUE_EXISTENCE_CHECK: Duration = Duration::from_secs(60);
const REQUEUE_MUTATION: Duration = Duration::from_secs(30);
const RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// Creation secret profile read for bucket credentials
const CREATION_PROFILE: &str = "default";

/// Bucket operation with outcome accounting
async fn observed<T, F>(operation: &str, call: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let result = call.await;
    let outcome = if result.is_ok() { "success" } else { "error" };
    metrics::BUCKET_OPERATIONS
        .with_label_values(&[operation, outcome])
        .inc();
    result
}

async fn client_for(
    store: &dyn ClusterStore,
    factory: &dyn ObjectStorageFactory,
    cs: &CloudStorage,
) -> Result<Arc<dyn ObjectStorage>> {
    let namespace = cs.namespace().unwrap_or_default();
    let secret = get_secret(store, &cs.spec.creation_secret.name, &namespace).await?;
    let contents = get_secret_string(&secret, &cs.spec.creation_secret.key)?;
    let credentials = parse_aws_credentials(&contents, CREATION_PROFILE)?;
    factory.client(&StorageTarget {
        provider: cs.spec.provider.as_str().to_string(),
        region: cs.spec.region.clone(),
        endpoint: None,
        credentials: Some(credentials),
        skip_tls_verify: false,
    })
}

/// Converge the remote bucket and record the sync in status
#[instrument(skip_all, fields(name = %cs.name_any(), namespace = cs.namespace()))]
pub async fn apply(
    store: &dyn ClusterStore,
    factory: &dyn ObjectStorageFactory,
    cs: &CloudStorage,
) -> Result<Action> {
    let bucket = cs.spec.name.as_str();
    let target = EventTarget::of(cs);

    let client = match client_for(store, factory, cs).await {
        Ok(client) => client,
        Err(e @ Error::Provider(_)) => {
            return provider_failure(store, cs, e, REQUEUE_EXISTENCE_CHECK).await
        }
        Err(e) => return Err(e),
    };

    let exists = match observed("exists", client.bucket_exists(bucket)).await {
        Ok(exists) => exists,
        Err(e) => return provider_failure(store, cs, e, REQUEUE_EXISTENCE_CHECK).await,
    };

    let uid = cs.uid().unwrap_or_default();
    if exists {
        let tags = match observed("tags", client.bucket_tags(bucket)).await {
            Ok(tags) => tags,
            Err(e) => return provider_failure(store, cs, e, REQUEUE_EXISTENCE_CHECK).await,
        };
        if tags.get(OWNER_TAG) != Some(&uid) {
            let err = Error::OwnershipConflict(format!(
                "bucket {bucket} exists and is not owned by CloudStorage {}",
                cs.name_any()
            ));
            write_condition(store, cs, false, err.kind().as_str(), &err.to_string()).await?;
            return Err(err);
        }
    } else {
        let mut tags = cs.spec.tags.clone();
        tags.insert(OWNER_TAG.to_string(), uid);
        if let Err(e) = observed("create", client.create_bucket(bucket, &tags)).await {
            return provider_failure(store, cs, e, REQUEUE_MUTATION).await;
        }
        info!(bucket, "created bucket");
        record_event(
            store,
            &target,
            EventType::Normal,
            "BucketCreated",
            &format!("bucket {bucket} created"),
        )
        .await;
    }

    let mut status = cs.status.clone().unwrap_or_default();
    status.name = Some(bucket.to_string());
    status.last_sync_timestamp = Some(Utc::now());
    set_condition(
        &mut status.conditions,
        CONDITION_READY,
        true,
        "BucketReady",
        &format!("bucket {bucket} is available"),
        Utc::now(),
    );
    write_status(store, cs, &status).await?;
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Record a provider failure and schedule a retry
async fn provider_failure(
    store: &dyn ClusterStore,
    cs: &CloudStorage,
    err: Error,
    after: Duration,
) -> Result<Action> {
    warn!(error = %err, "bucket operation failed");
    write_condition(store, cs, false, err.kind().as_str(), &err.to_string()).await?;
    Ok(Action::requeue(after))
}

async fn write_condition(
    store: &dyn ClusterStore,
    cs: &CloudStorage,
    ready: bool,
    reason: &str,
    message: &str,
) -> Result<()> {
    let mut status = cs.status.clone().unwrap_or_default();
    set_condition(&mut status.conditions, CONDITION_READY, ready, reason, message, Utc::now());
    write_status(store, cs, &status).await
}

async fn write_status(
    store: &dyn ClusterStore,
    cs: &CloudStorage,
    status: &CloudStorageStatus,
) -> Result<()> {
    if cs.status.as_ref() == Some(status) {
        return Ok(());
    }
    let key = ObjectKey::namespaced(
        ResourceKind::CloudStorage,
        &cs.namespace().unwrap_or_default(),
        &cs.name_any(),
    );
    store.patch_status(&key, &json!({ "status": status })).await?;
    Ok(())
}

/// DataProtectionApplications in the namespace that use this CloudStorage
pub async fn referencing_dpas(store: &dyn ClusterStore, cs: &CloudStorage) -> Result<Vec<String>> {
    let name = cs.name_any();
    let namespace = cs.namespace().unwrap_or_default();
    let dpas: Vec<DataProtectionApplication> =
        list_as(store, ResourceKind::DataProtectionApplication, Some(&namespace)).await?;
    Ok(dpas
        .into_iter()
        .filter(|dpa| {
            dpa.spec.backup_locations.iter().any(|l| {
                l.bucket
                    .as_ref()
                    .map(|b| b.cloud_storage_ref.name == name)
                    .unwrap_or(false)
            })
        })
        .map(|dpa| dpa.name_any())
        .collect())
}

/// Release the bucket once nothing references it
#[instrument(skip_all, fields(name = %cs.name_any(), namespace = cs.namespace()))]
pub async fn cleanup(
    store: &dyn ClusterStore,
    factory: &dyn ObjectStorageFactory,
    cs: &CloudStorage,
) -> Result<Action> {
    let target = EventTarget::of(cs);

    let users = referencing_dpas(store, cs).await?;
    if !users.is_empty() {
        return Err(Error::Blocked(format!(
            "CloudStorage {} is referenced by DataProtectionApplication {}",
            cs.name_any(),
            users.join(", ")
        )));
    }

    let delete = match cs.annotations().get(DELETE_ANNOTATION) {
        None => false,
        Some(value) => match parse_bool(value) {
            Some(delete) => delete,
            None => {
                let message = format!("annotation {DELETE_ANNOTATION} has unparsable value {value:?}");
                record_event(store, &target, EventType::Warning, "InvalidAnnotation", &message).await;
                return Err(Error::Blocked(message));
            }
        },
    };
    if !delete {
        info!("keeping remote bucket");
        return Ok(Action::await_change());
    }

    let bucket = cs.spec.name.as_str();
    let client = client_for(store, factory, cs).await?;
    if !observed("exists", client.bucket_exists(bucket)).await? {
        return Ok(Action::await_change());
    }
    let tags = observed("tags", client.bucket_tags(bucket)).await?;
    if tags.get(OWNER_TAG).map(String::as_str) != cs.uid().as_deref() {
        warn!(bucket, "bucket is not tagged with this CloudStorage, leaving it");
        return Ok(Action::await_change());
    }
    observed("delete", client.delete_bucket(bucket)).await?;
    info!(bucket, "deleted bucket");
    record_event(
        store,
        &target,
        EventType::Normal,
        "BucketDeleted",
        &format!("bucket {bucket} deleted"),
    )
    .await;
    Ok(Action::await_change())
}
