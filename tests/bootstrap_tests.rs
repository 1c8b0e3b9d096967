//! Bootstrap integration tests: credential synthesis, namespace labels and
//! leader election against the in-memory store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{json, Value};

use oadp_operator::adapters::credentials::{parse_aws_credentials, parse_azure_credentials};
use oadp_operator::adapters::{get_secret_string, is_sts_secret};
use oadp_operator::bootstrap::leader::{HA_TIMINGS, SNO_TIMINGS};
use oadp_operator::bootstrap::psa::{label_namespace, PSA_LABELS};
use oadp_operator::bootstrap::sts::{self, WEB_IDENTITY_TOKEN_PATH};
use oadp_operator::bootstrap::{self, BootstrapSettings, LeaderElector, LeaderTimings};
use oadp_operator::config::OperatorEnv;
use oadp_operator::error::Error;
use oadp_operator::store::{get_as, to_dynamic, ClusterStore, MemoryStore, ObjectKey, ResourceKind};

const NS: &str = "openshift-adp";

// ============================================================================
// Test Helpers
// ============================================================================

async fn store_with_namespace(labels: &[(&str, &str)]) -> MemoryStore {
    let store = MemoryStore::new();
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(NS.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    };
    store
        .create(ResourceKind::Namespace, &to_dynamic(&ns).unwrap())
        .await
        .unwrap();
    store
}

fn env(vars: &[(&str, &str)]) -> OperatorEnv {
    let vars: BTreeMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .chain([("WATCH_NAMESPACE".to_string(), NS.to_string())])
        .collect();
    OperatorEnv::from_lookup(|k| vars.get(k).cloned())
}

fn fast_settings() -> BootstrapSettings {
    BootstrapSettings {
        secret_wait_timeout: Duration::from_millis(50),
        secret_wait_interval: Duration::from_millis(10),
    }
}

async fn secret(store: &MemoryStore, name: &str) -> Secret {
    get_as(store, &ObjectKey::namespaced(ResourceKind::Secret, NS, name))
        .await
        .unwrap()
        .expect("secret written")
}

fn namespace_labels(store: &MemoryStore) -> BTreeMap<String, String> {
    store
        .all(ResourceKind::Namespace)
        .into_iter()
        .next()
        .and_then(|ns| ns.metadata.labels)
        .unwrap_or_default()
}

fn fast_timings() -> LeaderTimings {
    LeaderTimings {
        lease_duration: Duration::from_secs(1),
        renew_deadline: Duration::from_millis(800),
        retry_period: Duration::from_millis(100),
    }
}

// ============================================================================
// Credential Synthesis
// ============================================================================

#[tokio::test]
async fn aws_role_becomes_cloud_credentials() {
    let store = store_with_namespace(&[]).await;
    let result = bootstrap::run(
        &store,
        &env(&[("ROLEARN", "arn:aws:iam::123:role/r")]),
        &fast_settings(),
    )
    .await
    .unwrap();
    assert_eq!(result.sts_secret, Some("cloud-credentials"));

    let secret = secret(&store, "cloud-credentials").await;
    let body = get_secret_string(&secret, "credentials").unwrap();
    assert_eq!(
        body.lines().collect::<Vec<_>>(),
        vec![
            "[default]",
            "sts_regional_endpoints = regional",
            "role_arn = arn:aws:iam::123:role/r",
            "web_identity_token_file = /var/run/secrets/openshift/serviceaccount/token",
        ]
    );

    let profile = parse_aws_credentials(&body, "default").unwrap();
    assert_eq!(profile.role_arn.as_deref(), Some("arn:aws:iam::123:role/r"));
    assert_eq!(profile.web_identity_token_file.as_deref(), Some(WEB_IDENTITY_TOKEN_PATH));
    assert!(profile.static_keys().is_none());
    assert!(is_sts_secret(&secret));
}

#[tokio::test]
async fn gcp_federation_becomes_external_account_json() {
    let store = store_with_namespace(&[]).await;
    bootstrap::run(
        &store,
        &env(&[
            ("SERVICE_ACCOUNT_EMAIL", "velero@proj.iam.gserviceaccount.com"),
            ("PROJECT_NUMBER", "4242"),
            ("POOL_ID", "pool"),
            ("PROVIDER_ID", "oidc"),
        ]),
        &fast_settings(),
    )
    .await
    .unwrap();

    let secret = secret(&store, "cloud-credentials-gcp").await;
    let body = get_secret_string(&secret, "service_account.json").unwrap();
    let parsed: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["type"], "external_account");
    assert_eq!(
        parsed["audience"],
        "//iam.googleapis.com/projects/4242/locations/global/workloadIdentityPools/pool/providers/oidc"
    );
    assert_eq!(parsed["subject_token_type"], "urn:ietf:params:oauth:token-type:jwt");
    assert_eq!(parsed["token_url"], "https://sts.googleapis.com/v1/token");
    assert_eq!(
        parsed["service_account_impersonation_url"],
        "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/velero@proj.iam.gserviceaccount.com:generateAccessToken"
    );
    assert_eq!(
        parsed["credential_source"],
        json!({"file": WEB_IDENTITY_TOKEN_PATH, "format": {"type": "text"}})
    );
}

#[tokio::test]
async fn azure_identity_becomes_env_block() {
    let store = store_with_namespace(&[]).await;
    bootstrap::run(
        &store,
        &env(&[("CLIENTID", "client"), ("TENANTID", "tenant"), ("SUBSCRIPTIONID", "sub")]),
        &fast_settings(),
    )
    .await
    .unwrap();

    let secret = secret(&store, "cloud-credentials-azure").await;
    let parsed = parse_azure_credentials(&get_secret_string(&secret, "azurekey").unwrap());
    assert_eq!(
        parsed,
        BTreeMap::from([
            ("AZURE_CLIENT_ID".to_string(), "client".to_string()),
            ("AZURE_CLOUD_NAME".to_string(), "AzurePublicCloud".to_string()),
            ("AZURE_SUBSCRIPTION_ID".to_string(), "sub".to_string()),
            ("AZURE_TENANT_ID".to_string(), "tenant".to_string()),
        ])
    );
    assert!(is_sts_secret(&secret));
}

#[tokio::test]
async fn existing_secret_is_rewritten() {
    let store = store_with_namespace(&[]).await;
    let stale = Secret {
        metadata: ObjectMeta {
            name: Some("cloud-credentials".to_string()),
            namespace: Some(NS.to_string()),
            labels: Some(BTreeMap::from([("owner".to_string(), "admin".to_string())])),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([
            ("credentials".to_string(), "[default]\nrole_arn = old".to_string()),
            ("extra".to_string(), "x".to_string()),
        ])),
        ..Default::default()
    };
    store
        .create(ResourceKind::Secret, &to_dynamic(&stale).unwrap())
        .await
        .unwrap();

    let credential = sts::detect(&env(&[("ROLEARN", "arn:aws:iam::123:role/new")]))
        .unwrap()
        .unwrap();
    sts::write_secret(&store, NS, &credential).await.unwrap();

    let secret = secret(&store, "cloud-credentials").await;
    assert!(get_secret_string(&secret, "credentials")
        .unwrap()
        .contains("role_arn = arn:aws:iam::123:role/new"));
    assert!(get_secret_string(&secret, "extra").is_err());
    let labels = secret.metadata.labels.unwrap();
    assert_eq!(labels.get("owner").map(String::as_str), Some("admin"));
    assert!(is_sts_secret(&get_as::<Secret>(
        &store,
        &ObjectKey::namespaced(ResourceKind::Secret, NS, "cloud-credentials")
    )
    .await
    .unwrap()
    .unwrap()));
}

#[tokio::test]
async fn without_identity_env_no_secret_is_written() {
    let store = store_with_namespace(&[]).await;
    let result = bootstrap::run(&store, &env(&[("ROLEARN", "")]), &fast_settings())
        .await
        .unwrap();
    assert_eq!(result.sts_secret, None);
    assert!(store.all(ResourceKind::Secret).is_empty());
}

#[tokio::test]
async fn two_providers_fail_bootstrap() {
    let store = store_with_namespace(&[]).await;
    let err = bootstrap::run(
        &store,
        &env(&[
            ("ROLEARN", "arn:aws:iam::123:role/r"),
            ("CLIENTID", "client"),
            ("TENANTID", "tenant"),
            ("SUBSCRIPTIONID", "sub"),
        ]),
        &fast_settings(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Bootstrap(_)));
    assert!(err.to_string().contains("aws, azure"));
}

#[tokio::test]
async fn missing_watch_namespace_fails_bootstrap() {
    let store = MemoryStore::new();
    let err = bootstrap::run(&store, &OperatorEnv::default(), &fast_settings())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Bootstrap(_)));
    assert!(err.to_string().contains("WATCH_NAMESPACE"));
}

#[tokio::test]
async fn waiting_for_absent_secret_times_out() {
    let store = MemoryStore::new();
    let err = sts::wait_for_secret(
        &store,
        NS,
        "cloud-credentials",
        Duration::from_millis(30),
        Duration::from_millis(10),
    )
    .await
    .unwrap_err();
    assert!(err
        .to_string()
        .contains("timed out waiting for secret cloud-credentials in namespace openshift-adp"));
}

// ============================================================================
// Pod Security Admission
// ============================================================================

#[tokio::test]
async fn psa_labels_merge_with_existing_labels() {
    let store = store_with_namespace(&[
        ("team", "storage"),
        ("pod-security.kubernetes.io/enforce", "restricted"),
    ])
    .await;
    bootstrap::run(&store, &env(&[]), &fast_settings()).await.unwrap();

    let mut expected = BTreeMap::from([("team".to_string(), "storage".to_string())]);
    for label in PSA_LABELS {
        expected.insert(label.to_string(), "privileged".to_string());
    }
    assert_eq!(namespace_labels(&store), expected);
}

#[tokio::test]
async fn psa_labelling_is_idempotent() {
    let store = store_with_namespace(&[]).await;
    label_namespace(&store, NS).await.unwrap();
    let before = store.mutation_count();
    label_namespace(&store, NS).await.unwrap();
    assert_eq!(store.mutation_count(), before);
}

#[tokio::test]
async fn missing_namespace_fails_labelling() {
    let store = MemoryStore::new();
    let err = label_namespace(&store, NS).await.unwrap_err();
    assert!(matches!(err, Error::Bootstrap(_)));
}

// ============================================================================
// Leader Election
// ============================================================================

#[tokio::test]
async fn single_replica_topology_relaxes_timings() {
    let store = store_with_namespace(&[]).await;
    assert_eq!(
        bootstrap::run(&store, &env(&[]), &fast_settings()).await.unwrap().timings,
        HA_TIMINGS
    );

    let infra: kube::api::DynamicObject = serde_json::from_value(json!({
        "apiVersion": "config.openshift.io/v1",
        "kind": "Infrastructure",
        "metadata": {"name": "cluster"},
        "status": {"controlPlaneTopology": "SingleReplica"},
    }))
    .unwrap();
    store.create(ResourceKind::Infrastructure, &infra).await.unwrap();
    assert_eq!(
        bootstrap::run(&store, &env(&[]), &fast_settings()).await.unwrap().timings,
        SNO_TIMINGS
    );
}

#[tokio::test]
async fn only_one_replica_holds_the_lease() {
    let store: Arc<dyn ClusterStore> = Arc::new(MemoryStore::new());
    let a = LeaderElector::new(store.clone(), NS, "replica-a", HA_TIMINGS);
    let b = LeaderElector::new(store.clone(), NS, "replica-b", HA_TIMINGS);

    assert!(a.try_acquire_or_renew().await.unwrap());
    assert!(!b.try_acquire_or_renew().await.unwrap());
    assert!(a.try_acquire_or_renew().await.unwrap());
    assert!(!b.try_acquire_or_renew().await.unwrap());
}

#[tokio::test]
async fn racing_replicas_elect_exactly_one() {
    let store: Arc<dyn ClusterStore> = Arc::new(MemoryStore::new());
    let electors: Vec<Arc<LeaderElector>> = (0..4)
        .map(|i| {
            Arc::new(LeaderElector::new(
                store.clone(),
                NS,
                &format!("replica-{i}"),
                HA_TIMINGS,
            ))
        })
        .collect();

    let attempts = electors.iter().cloned().map(|e| {
        tokio::spawn(async move { e.try_acquire_or_renew().await.unwrap() })
    });
    let mut winners = 0;
    for attempt in attempts.collect::<Vec<_>>() {
        if attempt.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn expired_lease_is_taken_over() {
    let store: Arc<dyn ClusterStore> = Arc::new(MemoryStore::new());
    let a = LeaderElector::new(store.clone(), NS, "replica-a", fast_timings());
    let b = LeaderElector::new(store.clone(), NS, "replica-b", fast_timings());

    assert!(a.try_acquire_or_renew().await.unwrap());
    assert!(!b.try_acquire_or_renew().await.unwrap());
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(b.try_acquire_or_renew().await.unwrap());
    assert!(!a.try_acquire_or_renew().await.unwrap());
}

#[tokio::test]
async fn released_leadership_hands_over_immediately() {
    let store: Arc<dyn ClusterStore> = Arc::new(MemoryStore::new());
    let a = Arc::new(LeaderElector::new(store.clone(), NS, "replica-a", HA_TIMINGS));
    let b = LeaderElector::new(store.clone(), NS, "replica-b", HA_TIMINGS);

    let guard = a.clone().acquire().await;
    assert!(a.is_leader());
    assert!(!b.try_acquire_or_renew().await.unwrap());

    guard.release_leadership().await.unwrap();
    drop(guard);
    assert!(!a.is_leader());
    assert!(b.try_acquire_or_renew().await.unwrap());
}

#[tokio::test]
async fn leader_notices_takeover() {
    let store: Arc<dyn ClusterStore> = Arc::new(MemoryStore::new());
    let a = Arc::new(LeaderElector::new(store.clone(), NS, "replica-a", fast_timings()));
    let mut guard = a.clone().acquire().await;

    // another replica forcibly rewrites the lease
    let key = ObjectKey::namespaced(ResourceKind::Lease, NS, "oadp.openshift.io");
    let mut lease = store.get(&key).await.unwrap().unwrap();
    lease.data["spec"]["holderIdentity"] = json!("replica-b");
    lease.data["spec"]["renewTime"] = json!(chrono::Utc::now()
        .checked_add_signed(chrono::Duration::hours(1))
        .unwrap()
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true));
    store.replace(ResourceKind::Lease, &lease).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), guard.lost())
        .await
        .expect("leadership loss observed");
    assert!(!a.is_leader());
}
