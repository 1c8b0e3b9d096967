use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;

use super::{BuildContext, DesiredObject};
use crate::error::Result;
use crate::store::ResourceKind;

/// ConfigMap Velero reads when EnableAPIGroupVersions is on
pub const API_GROUP_VERSIONS_CONFIGMAP: &str = "enableapigroupversions";
pub const VERSION_PRIORITY_KEY: &str = "restoreResourcesVersionPriority";

/// Restore version priorities; absent unless the DPA sets them
pub(super) fn build(ctx: &BuildContext<'_>) -> Result<Option<DesiredObject>> {
    let Some(priority) = &ctx.resolved.restore_version_priority else {
        return Ok(None);
    };
    let cm = ConfigMap {
        metadata: ctx.metadata(
            API_GROUP_VERSIONS_CONFIGMAP,
            ctx.labels("velero", ctx.dpa_name(), "api-group-versions"),
        ),
        data: Some(BTreeMap::from([(VERSION_PRIORITY_KEY.to_string(), priority.clone())])),
        ..Default::default()
    };
    DesiredObject::new(ResourceKind::ConfigMap, &cm).map(Some)
}
