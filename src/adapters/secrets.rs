//! Secret fetching utilities on top of the ClusterStore

use k8s_openapi::api::core::v1::Secret;

use crate::error::{Error, Result};
use crate::store::{get_as, ClusterStore, ObjectKey, ResourceKind};

/// Label marking secrets synthesized from short-term-token environment
pub const STS_SECRET_LABEL: &str = "oadp.openshift.io/secret-type";
pub const STS_SECRET_LABEL_VALUE: &str = "sts-credentials";

pub fn secret_key(name: &str, namespace: &str) -> ObjectKey {
    ObjectKey::namespaced(ResourceKind::Secret, namespace, name)
}

/// Fetch a secret, returning `None` when absent
pub async fn find_secret(
    store: &dyn ClusterStore,
    name: &str,
    namespace: &str,
) -> Result<Option<Secret>> {
    get_as(store, &secret_key(name, namespace)).await
}

/// Fetch a secret that must exist
pub async fn get_secret(store: &dyn ClusterStore, name: &str, namespace: &str) -> Result<Secret> {
    find_secret(store, name, namespace)
        .await?
        .ok_or_else(|| Error::SecretNotFound(format!("{}/{}", namespace, name)))
}

/// Get a string value from a secret.
///
/// `stringData` is consulted as well so secrets written by this process are
/// readable before the API server folds them into `data`.
pub fn get_secret_string(secret: &Secret, key: &str) -> Result<String> {
    let missing = || Error::SecretKeyNotFound {
        secret: secret.metadata.name.clone().unwrap_or_default(),
        key: key.to_string(),
    };

    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(bytes.0.clone())
            .map_err(|e| Error::Config(format!("Invalid UTF-8 in secret key '{}': {}", key, e)));
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
        .ok_or_else(missing)
}

/// Whether the secret holds a value under `key`
pub fn secret_has_key(secret: &Secret, key: &str) -> bool {
    get_secret_string(secret, key).is_ok()
}

/// Whether the secret was synthesized for a short-term-token flow
pub fn is_sts_secret(secret: &Secret) -> bool {
    let labelled = secret
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(STS_SECRET_LABEL))
        .map(|v| v == STS_SECRET_LABEL_VALUE)
        .unwrap_or(false);
    if labelled {
        return true;
    }
    let mut values: Vec<String> = Vec::new();
    if let Some(data) = &secret.data {
        values.extend(data.values().filter_map(|b| String::from_utf8(b.0.clone()).ok()));
    }
    if let Some(data) = &secret.string_data {
        values.extend(data.values().cloned());
    }
    values.iter().any(|v| super::credentials::is_sts_content(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn secret(data: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("cloud-credentials".into()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn missing_key_names_secret_and_key() {
        let err = get_secret_string(&secret(&[("cloud", "x")]), "credentials").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Secret key 'credentials' not found in secret 'cloud-credentials'"
        );
    }

    #[test]
    fn string_data_is_readable() {
        let mut s = secret(&[]);
        s.string_data = Some(BTreeMap::from([("azurekey".to_string(), "x".to_string())]));
        assert_eq!(get_secret_string(&s, "azurekey").unwrap(), "x");
    }

    #[test]
    fn sts_detected_by_content() {
        let s = secret(&[(
            "credentials",
            "[default]\nrole_arn = r\nweb_identity_token_file = /var/run/token",
        )]);
        assert!(is_sts_secret(&s));
        assert!(!is_sts_secret(&secret(&[("cloud", "[default]\naws_access_key_id = a")])));
    }

    #[tokio::test]
    async fn absent_secret_is_not_found() {
        let store = crate::store::MemoryStore::new();
        let err = get_secret(&store, "cloud-credentials", "openshift-adp")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SecretNotFound(_)));
    }
}
