use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;

use super::{BuildContext, DesiredObject};
use crate::error::Result;
use crate::store::ResourceKind;

pub const CA_BUNDLE_CONFIGMAP: &str = "velero-ca-bundle";
pub const CA_BUNDLE_KEY: &str = "ca-bundle.pem";

/// ConfigMap with every location CA; absent when no location carries one
pub(super) fn build(ctx: &BuildContext<'_>) -> Result<Option<DesiredObject>> {
    let Some(bundle) = &ctx.resolved.ca_bundle else {
        return Ok(None);
    };
    let cm = ConfigMap {
        metadata: ctx.metadata(
            CA_BUNDLE_CONFIGMAP,
            ctx.labels("velero", ctx.dpa_name(), "ca-bundle"),
        ),
        data: Some(BTreeMap::from([(CA_BUNDLE_KEY.to_string(), bundle.clone())])),
        ..Default::default()
    };
    DesiredObject::new(ResourceKind::ConfigMap, &cm).map(Some)
}
