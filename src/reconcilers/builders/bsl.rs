use crate::crd::velero::BackupStorageLocation;
use crate::error::Result;
use crate::reconcilers::resolver::ResolvedLocation;
use crate::store::ResourceKind;

use super::{BuildContext, DesiredObject};

pub(super) fn build(ctx: &BuildContext<'_>, location: &ResolvedLocation) -> Result<DesiredObject> {
    let mut bsl = BackupStorageLocation::new(&location.name, location.spec.clone());
    bsl.metadata = ctx.metadata(
        &location.name,
        ctx.labels("oadp-operator-velero", &location.name, "bsl"),
    );
    DesiredObject::new(ResourceKind::BackupStorageLocation, &bsl)
}
