use ipnet::IpNet;

use crate::{
    ip::{SnapshotError, Snapshottable},
    resources::crd::v1alpha1::rangeallocation::RangeAllocation,
};

/// Rebuilds allocator state from a persisted record.
///
/// A range that doesn't parse is an error rather than an empty pool, treating it as
/// empty would hand out addresses that are still in use.
pub fn restore_range<A: Snapshottable + ?Sized>(
    dst: &mut A,
    src: &RangeAllocation,
) -> Result<(), SnapshotError> {
    let network = src
        .spec
        .range
        .parse::<IpNet>()
        .map_err(|_| SnapshotError::MalformedRange(src.spec.range.to_owned()))?;

    dst.restore(network, &src.spec.data)
}

/// Writes the allocator state into a record, metadata is left as is.
pub fn snapshot_range<A: Snapshottable + ?Sized>(dst: &mut RangeAllocation, src: &A) {
    let (network, data) = src.snapshot();

    dst.spec.range = network.to_string();
    dst.spec.data = data;
}
