//! ClusterStore backed by the Kubernetes API server

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::Value;
use tracing::debug;

use super::{ClusterStore, ObjectKey, ResourceKind};
use crate::{Error, Result};

const FIELD_MANAGER: &str = "oadp-operator";

/// Dynamic API access through a shared `kube::Client`
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = kind.api_resource();
        match namespace {
            Some(ns) if kind.is_namespaced() => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }
}

/// Map an API failure onto the operator's error taxonomy
fn map_error(err: kube::Error, what: &str) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(what.to_string()),
        kube::Error::Api(resp) if resp.code == 409 => {
            Error::Conflict(format!("{what}: {}", resp.message))
        }
        kube::Error::Api(resp) if resp.code == 429 || resp.code >= 500 => {
            Error::Transient(format!("{what}: {}", resp.message))
        }
        kube::Error::Api(_) => Error::Kube(err),
        _ => Error::Transient(format!("{what}: {err}")),
    }
}

fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        self.api(key.kind, key.namespace.as_deref())
            .get_opt(&key.name)
            .await
            .map_err(|e| map_error(e, &key.to_string()))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        let mut params = ListParams::default();
        if !labels.is_empty() {
            params = params.labels(&selector(labels));
        }
        match self.api(kind, namespace).list(&params).await {
            Ok(list) => Ok(list.items),
            // The kind is not installed on this cluster (e.g. no ServiceMonitor CRD)
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!(kind = %kind, "kind not served, treating list as empty");
                Ok(Vec::new())
            }
            Err(e) => Err(map_error(e, kind.kind_name())),
        }
    }

    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(kind, obj);
        self.api(kind, key.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_error(e, &key.to_string()))
    }

    async fn replace(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(kind, obj);
        self.api(kind, key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_error(e, &key.to_string()))
    }

    async fn patch_merge(&self, key: &ObjectKey, patch: &Value) -> Result<DynamicObject> {
        self.api(key.kind, key.namespace.as_deref())
            .patch(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(|e| map_error(e, &key.to_string()))
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<DynamicObject> {
        self.api(key.kind, key.namespace.as_deref())
            .patch_status(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map_err(|e| map_error(e, &key.to_string()))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        match self
            .api(key.kind, key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(map_error(e, &key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn api_errors_map_to_taxonomy() {
        assert!(matches!(map_error(api_error(404), "x"), Error::NotFound(_)));
        assert!(map_error(api_error(409), "x").is_conflict());
        assert!(matches!(map_error(api_error(503), "x"), Error::Transient(_)));
        assert!(matches!(map_error(api_error(429), "x"), Error::Transient(_)));
        assert!(matches!(map_error(api_error(403), "x"), Error::Kube(_)));
    }

    #[test]
    fn label_selector_is_comma_joined() {
        let labels: BTreeMap<String, String> = [
            ("app.kubernetes.io/managed-by".to_string(), "oadp-operator".to_string()),
            ("component".to_string(), "bsl".to_string()),
        ]
        .into();
        assert_eq!(
            selector(&labels),
            "app.kubernetes.io/managed-by=oadp-operator,component=bsl"
        );
    }
}
