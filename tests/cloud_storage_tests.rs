//! CloudStorage bucket lifecycle against in-memory cluster and bucket doubles

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::runtime::controller::Action;
use kube::ResourceExt;

use oadp_operator::adapters::object_storage::{MemoryObjectStorage, OWNER_TAG};
use oadp_operator::crd::{
    BackupLocation, CloudStorage, CloudStorageLocation, CloudStorageProvider, CloudStorageSpec,
    CredentialRef, DataProtectionApplication, DataProtectionApplicationSpec, LocalObjectRef,
};
use oadp_operator::error::ErrorKind;
use oadp_operator::reconcilers::cloud_storage::{
    self, referencing_dpas, CONDITION_READY, DELETE_ANNOTATION,
};
use oadp_operator::reconcilers::status::condition;
use oadp_operator::store::{get_as, to_dynamic, ClusterStore, MemoryStore, ObjectKey, ResourceKind};

const NS: &str = "openshift-adp";
const CS_NAME: &str = "bucket-cs";
const BUCKET: &str = "oadp-bucket";

const AWS_INI: &str = "[default]\naws_access_key_id = AKIDEXAMPLE\naws_secret_access_key = wJalrXUtnFEMI\n";

// ============================================================================
// Test Helpers
// ============================================================================

fn cloud_storage(provider: CloudStorageProvider, annotations: &[(&str, &str)]) -> CloudStorage {
    let mut cs = CloudStorage::new(
        CS_NAME,
        CloudStorageSpec {
            name: BUCKET.to_string(),
            provider,
            region: "us-east-1".to_string(),
            creation_secret: CredentialRef {
                name: "cloud-credentials".to_string(),
                key: "cloud".to_string(),
            },
            enable_shared_config: None,
            tags: BTreeMap::from([("team".to_string(), "storage".to_string())]),
        },
    );
    cs.metadata.namespace = Some(NS.to_string());
    cs.metadata.annotations = Some(
        annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    cs
}

/// Store holding the creation secret and `cs`; returns the stored copy
async fn setup(cs: CloudStorage) -> (MemoryStore, CloudStorage) {
    let store = MemoryStore::new();
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some("cloud-credentials".to_string()),
            namespace: Some(NS.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "cloud".to_string(),
            ByteString(AWS_INI.as_bytes().to_vec()),
        )])),
        ..Default::default()
    };
    store
        .create(ResourceKind::Secret, &to_dynamic(&secret).unwrap())
        .await
        .unwrap();
    store
        .create(ResourceKind::CloudStorage, &to_dynamic(&cs).unwrap())
        .await
        .unwrap();
    let stored = fetch(&store).await;
    (store, stored)
}

async fn fetch(store: &MemoryStore) -> CloudStorage {
    get_as(store, &ObjectKey::namespaced(ResourceKind::CloudStorage, NS, CS_NAME))
        .await
        .unwrap()
        .unwrap()
}

async fn ready_condition(store: &MemoryStore) -> (String, Option<String>, Option<String>) {
    let cs = fetch(store).await;
    let status = cs.status.unwrap_or_default();
    let ready = condition(&status.conditions, CONDITION_READY).expect("Ready condition");
    (ready.status.clone(), ready.reason.clone(), ready.message.clone())
}

async fn referencing_dpa(store: &MemoryStore, name: &str) {
    let mut dpa = DataProtectionApplication::new(
        name,
        DataProtectionApplicationSpec {
            backup_locations: vec![BackupLocation {
                bucket: Some(CloudStorageLocation {
                    cloud_storage_ref: LocalObjectRef {
                        name: CS_NAME.to_string(),
                    },
                    default: true,
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        },
    );
    dpa.metadata.namespace = Some(NS.to_string());
    store
        .create(ResourceKind::DataProtectionApplication, &to_dynamic(&dpa).unwrap())
        .await
        .unwrap();
}

// ============================================================================
// Bucket Convergence
// ============================================================================

#[tokio::test]
async fn missing_bucket_is_created_with_owner_tag() {
    let (store, cs) = setup(cloud_storage(CloudStorageProvider::Aws, &[])).await;
    let buckets = MemoryObjectStorage::new();

    let action = cloud_storage::apply(&store, &buckets, &cs).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(600)));
    assert!(buckets.has_bucket(BUCKET));

    let stored = fetch(&store).await;
    let status = stored.status.clone().unwrap();
    assert_eq!(status.name.as_deref(), Some(BUCKET));
    assert!(status.last_sync_timestamp.is_some());
    assert_eq!(ready_condition(&store).await.0, "True");
    assert!(store
        .events()
        .iter()
        .any(|(reason, message)| reason == "BucketCreated" && message.contains(BUCKET)));

    // tagged with this CR, so a later pass adopts it
    cloud_storage::apply(&store, &buckets, &stored).await.unwrap();
}

#[tokio::test]
async fn untagged_existing_bucket_is_an_ownership_conflict() {
    let (store, cs) = setup(cloud_storage(CloudStorageProvider::Aws, &[])).await;
    let buckets = MemoryObjectStorage::new();
    buckets.seed_bucket(BUCKET, &[(OWNER_TAG, "someone-else")]);

    let err = cloud_storage::apply(&store, &buckets, &cs).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OwnershipConflict);
    assert!(err.to_string().contains("is not owned by CloudStorage bucket-cs"));

    let (status, reason, _) = ready_condition(&store).await;
    assert_eq!(status, "False");
    assert_eq!(reason.as_deref(), Some("OwnershipConflict"));
}

#[tokio::test]
async fn provider_failure_is_recorded_and_retried() {
    let (store, cs) = setup(cloud_storage(CloudStorageProvider::Aws, &[])).await;
    let buckets = MemoryObjectStorage::new();
    buckets.fail_with("AccessDenied");

    let action = cloud_storage::apply(&store, &buckets, &cs).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(60)));

    let (status, reason, message) = ready_condition(&store).await;
    assert_eq!(status, "False");
    assert_eq!(reason.as_deref(), Some("ProviderError"));
    assert!(message.unwrap_or_default().contains("AccessDenied"));
}

#[tokio::test]
async fn unsupported_provider_client_is_a_provider_failure() {
    let (store, cs) = setup(cloud_storage(CloudStorageProvider::Gcp, &[])).await;
    let buckets = MemoryObjectStorage::new();

    let action = cloud_storage::apply(&store, &buckets, &cs).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    assert!(!buckets.has_bucket(BUCKET));
    assert_eq!(ready_condition(&store).await.1.as_deref(), Some("ProviderError"));
}

// ============================================================================
// Cleanup
// ============================================================================

#[tokio::test]
async fn cleanup_without_annotation_keeps_bucket() {
    let (store, cs) = setup(cloud_storage(CloudStorageProvider::Aws, &[])).await;
    let buckets = MemoryObjectStorage::new();
    cloud_storage::apply(&store, &buckets, &cs).await.unwrap();

    let action = cloud_storage::cleanup(&store, &buckets, &fetch(&store).await)
        .await
        .unwrap();
    assert_eq!(action, Action::await_change());
    assert!(buckets.has_bucket(BUCKET));
}

#[tokio::test]
async fn cleanup_with_annotation_deletes_owned_bucket() {
    let (store, cs) = setup(cloud_storage(CloudStorageProvider::Aws, &[(DELETE_ANNOTATION, "true")])).await;
    let buckets = MemoryObjectStorage::new();
    cloud_storage::apply(&store, &buckets, &cs).await.unwrap();
    assert!(buckets.has_bucket(BUCKET));

    cloud_storage::cleanup(&store, &buckets, &fetch(&store).await)
        .await
        .unwrap();
    assert!(!buckets.has_bucket(BUCKET));
    assert!(store.events().iter().any(|(reason, _)| reason == "BucketDeleted"));
}

#[tokio::test]
async fn cleanup_leaves_buckets_tagged_for_someone_else() {
    let (store, cs) = setup(cloud_storage(CloudStorageProvider::Aws, &[(DELETE_ANNOTATION, "1")])).await;
    let buckets = MemoryObjectStorage::new();
    buckets.seed_bucket(BUCKET, &[(OWNER_TAG, "another-uid")]);

    cloud_storage::cleanup(&store, &buckets, &cs).await.unwrap();
    assert!(buckets.has_bucket(BUCKET));
}

#[tokio::test]
async fn unparsable_delete_annotation_blocks_cleanup() {
    let (store, cs) = setup(cloud_storage(CloudStorageProvider::Aws, &[(DELETE_ANNOTATION, "maybe")])).await;
    let buckets = MemoryObjectStorage::new();
    buckets.seed_bucket(BUCKET, &[(OWNER_TAG, cs.uid().unwrap().as_str())]);

    let err = cloud_storage::cleanup(&store, &buckets, &cs).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DependencyMissing);
    assert!(err.to_string().contains("unparsable value \"maybe\""));
    assert!(buckets.has_bucket(BUCKET));
    assert!(store.events().iter().any(|(reason, _)| reason == "InvalidAnnotation"));
}

#[tokio::test]
async fn referenced_cloud_storage_blocks_cleanup() {
    let (store, cs) = setup(cloud_storage(CloudStorageProvider::Aws, &[(DELETE_ANNOTATION, "true")])).await;
    referencing_dpa(&store, "dpa-b").await;
    referencing_dpa(&store, "dpa-a").await;
    let buckets = MemoryObjectStorage::new();
    buckets.seed_bucket(BUCKET, &[(OWNER_TAG, cs.uid().unwrap().as_str())]);

    assert_eq!(referencing_dpas(&store, &cs).await.unwrap(), vec!["dpa-a", "dpa-b"]);
    let err = cloud_storage::cleanup(&store, &buckets, &cs).await.unwrap_err();
    assert!(err
        .to_string()
        .contains("referenced by DataProtectionApplication dpa-a, dpa-b"));
    assert!(buckets.has_bucket(BUCKET));
}
