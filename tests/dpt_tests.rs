//! DataProtectionTest probe runs against in-memory cluster and bucket doubles

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::runtime::controller::Action;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use oadp_operator::adapters::object_storage::MemoryObjectStorage;
use oadp_operator::crd::velero::{
    BackupStorageLocation, BackupStorageLocationSpec, ObjectStorageLocation,
};
use oadp_operator::crd::{
    CredentialRef, CsiVolumeSnapshotTestConfig, DataProtectionTest, DataProtectionTestPhase,
    DataProtectionTestSpec, DataProtectionTestStatus, UploadSpeedTestConfig, VolumeSnapshotSource,
};
use oadp_operator::reconcilers::data_protection_test::{self, ProbeSettings};
use oadp_operator::store::{get_as, to_dynamic, ClusterStore, MemoryStore, ObjectKey, ResourceKind};
use oadp_operator::Error;

const NS: &str = "openshift-adp";
const DPT_NAME: &str = "probe";
const BUCKET: &str = "mybkt";

const AWS_INI: &str = "[default]\naws_access_key_id = AKIDEXAMPLE\naws_secret_access_key = wJalrXUtnFEMI\n";

// ============================================================================
// Test Helpers
// ============================================================================

fn location(s3_url: Option<&str>) -> BackupStorageLocationSpec {
    let mut config = BTreeMap::from([("region".to_string(), "us-east-1".to_string())]);
    if let Some(url) = s3_url {
        config.insert("s3Url".to_string(), url.to_string());
    }
    BackupStorageLocationSpec {
        provider: "aws".to_string(),
        object_storage: ObjectStorageLocation {
            bucket: BUCKET.to_string(),
            prefix: Some("velero".to_string()),
            ca_cert: None,
        },
        config,
        credential: Some(CredentialRef {
            name: "cloud-credentials".to_string(),
            key: "cloud".to_string(),
        }),
        ..Default::default()
    }
}

fn upload(file_size: &str, timeout: &str) -> Option<UploadSpeedTestConfig> {
    Some(UploadSpeedTestConfig {
        file_size: file_size.to_string(),
        timeout: timeout.to_string(),
    })
}

fn snapshot_config(pvc: &str, timeout: &str) -> CsiVolumeSnapshotTestConfig {
    CsiVolumeSnapshotTestConfig {
        snapshot_class_name: "csi-snapclass".to_string(),
        timeout: timeout.to_string(),
        volume_snapshot_source: VolumeSnapshotSource {
            persistent_volume_claim_name: pvc.to_string(),
            persistent_volume_claim_namespace: "app".to_string(),
        },
    }
}

async fn setup(spec: DataProtectionTestSpec) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
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

    let mut dpt = DataProtectionTest::new(DPT_NAME, spec);
    dpt.metadata.namespace = Some(NS.to_string());
    store
        .create(ResourceKind::DataProtectionTest, &to_dynamic(&dpt).unwrap())
        .await
        .unwrap();
    store
}

fn buckets() -> MemoryObjectStorage {
    let buckets = MemoryObjectStorage::new();
    buckets.seed_bucket(BUCKET, &[]);
    buckets
}

fn dpt_key() -> ObjectKey {
    ObjectKey::namespaced(ResourceKind::DataProtectionTest, NS, DPT_NAME)
}

async fn fetch(store: &MemoryStore) -> DataProtectionTest {
    get_as(store, &dpt_key()).await.unwrap().unwrap()
}

fn fast_probes() -> ProbeSettings {
    ProbeSettings {
        snapshot_poll_interval: Duration::from_millis(10),
    }
}

async fn run(store: &MemoryStore, buckets: &MemoryObjectStorage) -> Result<DataProtectionTestStatus, Error> {
    let dpt = fetch(store).await;
    data_protection_test::reconcile(store, buckets, &dpt, &fast_probes(), &CancellationToken::new())
        .await?;
    Ok(fetch(store).await.status.unwrap_or_default())
}

// ============================================================================
// Bucket Probes
// ============================================================================

#[tokio::test]
async fn upload_and_accessibility_probes_complete() {
    let store = setup(DataProtectionTestSpec {
        backup_location_spec: Some(location(None)),
        upload_speed_test_config: upload("10KB", "30s"),
        bucket_accessibility_test: Some(true),
        ..Default::default()
    })
    .await;
    let buckets = buckets();

    let status = run(&store, &buckets).await.unwrap();
    assert_eq!(status.phase, DataProtectionTestPhase::Complete);
    assert!(status.errors.is_empty(), "{:?}", status.errors);
    assert!(status.last_tested.is_some());

    let upload = status.upload_test.unwrap();
    assert!(upload.success);
    assert!(upload.speed_bytes_per_sec > 0);
    assert!(upload.speed_mbps.parse::<f64>().is_ok());
    assert!(status.bucket_metadata.unwrap().error_message.is_none());
    // the payload is removed after timing
    assert_eq!(buckets.object_count(BUCKET), 0);
    // vendor detection only runs for custom endpoints
    assert_eq!(status.s3_vendor, None);
}

#[tokio::test]
async fn custom_endpoint_reports_vendor() {
    let store = setup(DataProtectionTestSpec {
        backup_location_spec: Some(location(Some("https://minio.example.com"))),
        bucket_accessibility_test: Some(true),
        ..Default::default()
    })
    .await;
    let buckets = buckets();
    buckets.set_server_header("MinIO");

    let status = run(&store, &buckets).await.unwrap();
    assert_eq!(status.s3_vendor.as_deref(), Some("MinIO"));
    assert_eq!(status.phase, DataProtectionTestPhase::Complete);
}

#[tokio::test]
async fn named_location_is_read_from_the_cluster() {
    let store = setup(DataProtectionTestSpec {
        backup_location_name: Some("velero-sample-1".to_string()),
        bucket_accessibility_test: Some(true),
        ..Default::default()
    })
    .await;
    let mut bsl = BackupStorageLocation::new("velero-sample-1", location(None));
    bsl.metadata.namespace = Some(NS.to_string());
    store
        .create(ResourceKind::BackupStorageLocation, &to_dynamic(&bsl).unwrap())
        .await
        .unwrap();

    let status = run(&store, &buckets()).await.unwrap();
    assert_eq!(status.phase, DataProtectionTestPhase::Complete);
}

#[tokio::test]
async fn missing_location_fails_the_test() {
    let store = setup(DataProtectionTestSpec {
        backup_location_name: Some("missing-bsl".to_string()),
        upload_speed_test_config: upload("1KB", "10s"),
        ..Default::default()
    })
    .await;

    let status = run(&store, &buckets()).await.unwrap();
    assert_eq!(status.phase, DataProtectionTestPhase::Failed);
    assert_eq!(status.errors.len(), 1);
    assert!(status.errors[0].starts_with("DependencyMissing"));
    assert!(status.errors[0].contains("BackupStorageLocation missing-bsl not found"));
}

#[tokio::test]
async fn unreachable_bucket_is_classified_as_provider_error() {
    let store = setup(DataProtectionTestSpec {
        backup_location_spec: Some(location(None)),
        bucket_accessibility_test: Some(true),
        ..Default::default()
    })
    .await;
    let buckets = MemoryObjectStorage::new();

    let status = run(&store, &buckets).await.unwrap();
    assert_eq!(status.phase, DataProtectionTestPhase::Failed);
    assert!(status.errors[0].starts_with("ProviderError"));
    assert!(status.errors[0].contains("NoSuchBucket"));
    assert!(status.bucket_metadata.unwrap().error_message.is_some());
}

#[tokio::test]
async fn oversized_upload_is_refused() {
    let store = setup(DataProtectionTestSpec {
        backup_location_spec: Some(location(None)),
        upload_speed_test_config: upload("300MB", "10s"),
        ..Default::default()
    })
    .await;
    let buckets = buckets();

    let status = run(&store, &buckets).await.unwrap();
    assert_eq!(status.phase, DataProtectionTestPhase::Failed);
    let upload = status.upload_test.unwrap();
    assert!(!upload.success);
    assert!(upload.error_message.unwrap().contains("exceeds the 200MiB limit"));
    assert_eq!(buckets.object_count(BUCKET), 0);
}

#[tokio::test]
async fn overflowing_timeout_fails_the_upload_test() {
    let store = setup(DataProtectionTestSpec {
        backup_location_spec: Some(location(None)),
        upload_speed_test_config: upload("1KB", "99999999999999999999999h"),
        ..Default::default()
    })
    .await;
    let buckets = buckets();

    let status = run(&store, &buckets).await.unwrap();
    assert_eq!(status.phase, DataProtectionTestPhase::Failed);
    let upload = status.upload_test.unwrap();
    assert!(!upload.success);
    assert!(upload.error_message.unwrap().contains("invalid duration"));
    assert_eq!(buckets.object_count(BUCKET), 0);
}

#[tokio::test]
async fn slow_upload_times_out() {
    let store = setup(DataProtectionTestSpec {
        backup_location_spec: Some(location(None)),
        upload_speed_test_config: upload("1KB", "20ms"),
        ..Default::default()
    })
    .await;
    let buckets = buckets();
    buckets.set_upload_delay(Duration::from_millis(500));

    let status = run(&store, &buckets).await.unwrap();
    assert_eq!(status.phase, DataProtectionTestPhase::Failed);
    assert!(status
        .upload_test
        .unwrap()
        .error_message
        .unwrap()
        .contains("did not finish within"));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn finished_test_is_not_run_again() {
    let store = setup(DataProtectionTestSpec {
        backup_location_spec: Some(location(None)),
        upload_speed_test_config: upload("1KB", "10s"),
        ..Default::default()
    })
    .await;
    let buckets = buckets();
    run(&store, &buckets).await.unwrap();
    let before = store.mutation_count();

    let dpt = fetch(&store).await;
    let action = data_protection_test::reconcile(
        store.as_ref(),
        &buckets,
        &dpt,
        &fast_probes(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(store.mutation_count(), before);
}

#[tokio::test]
async fn stale_cached_copy_does_not_rerun() {
    let store = setup(DataProtectionTestSpec {
        backup_location_spec: Some(location(None)),
        upload_speed_test_config: upload("1KB", "10s"),
        ..Default::default()
    })
    .await;
    let buckets = buckets();
    let stale = fetch(&store).await;
    run(&store, &buckets).await.unwrap();
    let tested = fetch(&store).await.status.unwrap().last_tested;

    data_protection_test::reconcile(
        store.as_ref(),
        &buckets,
        &stale,
        &fast_probes(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(fetch(&store).await.status.unwrap().last_tested, tested);
}

#[tokio::test]
async fn cancelled_upload_leaves_test_in_progress() {
    let store = setup(DataProtectionTestSpec {
        backup_location_spec: Some(location(None)),
        upload_speed_test_config: upload("1KB", "10s"),
        ..Default::default()
    })
    .await;
    let buckets = buckets();
    buckets.set_upload_delay(Duration::from_secs(5));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let dpt = fetch(&store).await;
    let err = data_protection_test::reconcile(store.as_ref(), &buckets, &dpt, &fast_probes(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(
        fetch(&store).await.status.unwrap().phase,
        DataProtectionTestPhase::InProgress
    );
}

// ============================================================================
// Snapshot Probes
// ============================================================================

#[tokio::test]
async fn ready_snapshot_is_reported_and_removed() {
    let store = setup(DataProtectionTestSpec {
        csi_volume_snapshot_test_configs: vec![snapshot_config("data", "5s")],
        ..Default::default()
    })
    .await;

    // stands in for the CSI snapshotter
    let snapshotter = {
        let store = store.clone();
        tokio::spawn(async move {
            let key = ObjectKey::namespaced(ResourceKind::VolumeSnapshot, "app", "probe-snapshot-0");
            loop {
                if store.get(&key).await.unwrap().is_some() {
                    store
                        .patch_status(&key, &json!({"status": {"readyToUse": true}}))
                        .await
                        .unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let status = run(&store, &MemoryObjectStorage::new()).await.unwrap();
    snapshotter.await.unwrap();
    assert_eq!(status.phase, DataProtectionTestPhase::Complete);
    let snapshot = &status.snapshot_tests[0];
    assert_eq!(snapshot.status, "Ready");
    assert_eq!(snapshot.namespace, "app");
    assert!(snapshot.ready_duration.as_deref().unwrap().ends_with('s'));
    assert!(store.all(ResourceKind::VolumeSnapshot).is_empty());
}

#[tokio::test]
async fn snapshot_not_ready_in_time_fails() {
    let store = setup(DataProtectionTestSpec {
        csi_volume_snapshot_test_configs: vec![snapshot_config("data", "30ms")],
        ..Default::default()
    })
    .await;

    let status = run(&store, &MemoryObjectStorage::new()).await.unwrap();
    assert_eq!(status.phase, DataProtectionTestPhase::Failed);
    assert_eq!(status.snapshot_tests[0].status, "Failed");
    assert!(status.errors[0].contains("snapshot of app/data"));
    assert!(status.errors[0].contains("not ready within"));
    assert!(store.all(ResourceKind::VolumeSnapshot).is_empty());
}
