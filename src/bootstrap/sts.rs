//! Short-term token credential secrets
//!
//! When the operator is installed with a cloud identity (AWS STS role, GCP
//! workload identity federation or Azure federated identity) the console
//! hands it a handful of environment variables. They are turned into the
//! credentials secret Velero expects, in the provider's native format.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use tracing::{debug, info};

use crate::adapters::secrets::{find_secret, secret_key, STS_SECRET_LABEL, STS_SECRET_LABEL_VALUE};
use crate::config::OperatorEnv;
use crate::error::{Error, Result};
use crate::store::{get_as, to_dynamic, ClusterStore, ResourceKind};

/// Projected service account token mounted into the operator pod
pub const WEB_IDENTITY_TOKEN_PATH: &str = "/var/run/secrets/openshift/serviceaccount/token";

pub const AWS_SECRET_NAME: &str = "cloud-credentials";
pub const AWS_SECRET_KEY: &str = "credentials";
pub const GCP_SECRET_NAME: &str = "cloud-credentials-gcp";
pub const GCP_SECRET_KEY: &str = "service_account.json";
pub const AZURE_SECRET_NAME: &str = "cloud-credentials-azure";
pub const AZURE_SECRET_KEY: &str = "azurekey";

pub const SECRET_WAIT_TIMEOUT: Duration = Duration::from_secs(600);
pub const SECRET_WAIT_INTERVAL: Duration = Duration::from_secs(10);

/// A synthesized credentials secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StsCredential {
    pub provider: &'static str,
    pub secret_name: &'static str,
    pub key: &'static str,
    pub body: String,
}

pub fn aws_credentials(role_arn: &str) -> String {
    format!(
        "[default]\nsts_regional_endpoints = regional\nrole_arn = {role_arn}\nweb_identity_token_file = {WEB_IDENTITY_TOKEN_PATH}"
    )
}

pub fn gcp_credentials(
    service_account_email: &str,
    project_number: &str,
    pool_id: &str,
    provider_id: &str,
) -> String {
    let audience = format!(
        "//iam.googleapis.com/projects/{project_number}/locations/global/workloadIdentityPools/{pool_id}/providers/{provider_id}"
    );
    format!(
        r#"{{
	"type": "external_account",
	"audience": "{audience}",
	"subject_token_type": "urn:ietf:params:oauth:token-type:jwt",
	"token_url": "https://sts.googleapis.com/v1/token",
	"service_account_impersonation_url": "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{service_account_email}:generateAccessToken",
	"credential_source": {{
		"file": "{WEB_IDENTITY_TOKEN_PATH}",
		"format": {{
			"type": "text"
		}}
	}}
}}"#
    )
}

pub fn azure_credentials(client_id: &str, tenant_id: &str, subscription_id: &str) -> String {
    format!(
        "\nAZURE_SUBSCRIPTION_ID={subscription_id}\nAZURE_TENANT_ID={tenant_id}\nAZURE_CLIENT_ID={client_id}\nAZURE_CLOUD_NAME=AzurePublicCloud\n"
    )
}

/// The credential implied by the environment, if exactly one provider is configured
pub fn detect(env: &OperatorEnv) -> Result<Option<StsCredential>> {
    let mut found = Vec::new();

    if let Some(role_arn) = &env.role_arn {
        found.push(StsCredential {
            provider: "aws",
            secret_name: AWS_SECRET_NAME,
            key: AWS_SECRET_KEY,
            body: aws_credentials(role_arn),
        });
    }
    if let (Some(email), Some(project), Some(pool), Some(provider)) = (
        &env.service_account_email,
        &env.project_number,
        &env.pool_id,
        &env.provider_id,
    ) {
        found.push(StsCredential {
            provider: "gcp",
            secret_name: GCP_SECRET_NAME,
            key: GCP_SECRET_KEY,
            body: gcp_credentials(email, project, pool, provider),
        });
    }
    if let (Some(client), Some(tenant), Some(subscription)) =
        (&env.client_id, &env.tenant_id, &env.subscription_id)
    {
        found.push(StsCredential {
            provider: "azure",
            secret_name: AZURE_SECRET_NAME,
            key: AZURE_SECRET_KEY,
            body: azure_credentials(client, tenant, subscription),
        });
    }

    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        _ => {
            let providers: Vec<&str> = found.iter().map(|c| c.provider).collect();
            Err(Error::Bootstrap(format!(
                "short-term credentials configured for more than one provider: {}",
                providers.join(", ")
            )))
        }
    }
}

fn sts_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(STS_SECRET_LABEL.to_string(), STS_SECRET_LABEL_VALUE.to_string())])
}

/// Create the secret, or replace its contents when it already exists
pub async fn write_secret(
    store: &dyn ClusterStore,
    namespace: &str,
    credential: &StsCredential,
) -> Result<()> {
    let key = secret_key(credential.secret_name, namespace);
    let string_data = BTreeMap::from([(credential.key.to_string(), credential.body.clone())]);

    if let Some(existing) = get_as::<Secret>(store, &key).await? {
        // data is dropped so keys no longer written disappear
        let mut updated = existing;
        updated
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(sts_labels());
        updated.data = None;
        updated.string_data = Some(string_data);
        store.replace(ResourceKind::Secret, &to_dynamic(&updated)?).await?;
        info!(secret = credential.secret_name, namespace, "updated credentials secret");
        return Ok(());
    }

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(credential.secret_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(sts_labels()),
            ..Default::default()
        },
        string_data: Some(string_data),
        ..Default::default()
    };
    store.create(ResourceKind::Secret, &to_dynamic(&secret)?).await?;
    info!(secret = credential.secret_name, namespace, "created credentials secret");
    Ok(())
}

/// Poll until the secret is readable
pub async fn wait_for_secret(
    store: &dyn ClusterStore,
    namespace: &str,
    name: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<Secret> {
    let start = Instant::now();
    loop {
        if let Some(secret) = find_secret(store, name, namespace).await? {
            return Ok(secret);
        }
        if start.elapsed() >= timeout {
            return Err(Error::Bootstrap(format!(
                "timed out waiting for secret {name} in namespace {namespace}. Please follow the manual path to create a Secret"
            )));
        }
        debug!(secret = name, "waiting for credentials secret");
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aws_body_has_no_trailing_newline() {
        let body = aws_credentials("arn:aws:iam::123:role/velero");
        assert!(body.starts_with("[default]\nsts_regional_endpoints = regional\n"));
        assert!(body.ends_with("web_identity_token_file = /var/run/secrets/openshift/serviceaccount/token"));
    }

    #[test]
    fn gcp_body_is_external_account_json() {
        let body = gcp_credentials("velero@p.iam.gserviceaccount.com", "42", "pool", "prov");
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["type"], "external_account");
        assert_eq!(
            parsed["audience"],
            "//iam.googleapis.com/projects/42/locations/global/workloadIdentityPools/pool/providers/prov"
        );
        assert_eq!(parsed["credential_source"]["format"]["type"], "text");
        assert!(body.contains("\n\t\"type\""));
    }

    #[test]
    fn incomplete_sets_are_ignored() {
        let env = OperatorEnv {
            client_id: Some("c".into()),
            tenant_id: Some("t".into()),
            ..OperatorEnv::for_namespace("openshift-adp")
        };
        assert_eq!(detect(&env).unwrap(), None);
    }

    #[test]
    fn two_complete_sets_fail() {
        let env = OperatorEnv {
            role_arn: Some("arn".into()),
            client_id: Some("c".into()),
            tenant_id: Some("t".into()),
            subscription_id: Some("s".into()),
            ..OperatorEnv::for_namespace("openshift-adp")
        };
        let err = detect(&env).unwrap_err();
        assert!(err.to_string().contains("aws, azure"));
    }
}
