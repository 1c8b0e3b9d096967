use crate::crd::velero::VolumeSnapshotLocation;
use crate::error::Result;
use crate::reconcilers::resolver::ResolvedSnapshotLocation;
use crate::store::ResourceKind;

use super::{BuildContext, DesiredObject};

pub(super) fn build(
    ctx: &BuildContext<'_>,
    location: &ResolvedSnapshotLocation,
) -> Result<DesiredObject> {
    let mut vsl = VolumeSnapshotLocation::new(&location.name, location.spec.clone());
    vsl.metadata = ctx.metadata(
        &location.name,
        ctx.labels("oadp-operator-velero", &location.name, "vsl"),
    );
    DesiredObject::new(ResourceKind::VolumeSnapshotLocation, &vsl)
}
