use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info};
use svc_ipam_core::{
    allocation::{range_store::RangeStore, repair::Repair},
    ip::{Allocator, Snapshottable},
    resources::crd::v1alpha1::virtualservice::VirtualService,
    storage::ObjectStore,
};
use tokio::time::interval;
use tokio_stream::wrappers::IntervalStream;

/// Runs the repair pass every `period`, starting right away. Never returns.
pub async fn run_repair_loop<S, A, R>(repair: &Repair<S, A, R>, period: Duration)
where
    S: ObjectStore<VirtualService>,
    A: Allocator + Snapshottable + Clone + Send + Sync,
    R: RangeStore,
{
    info!("Repairing the pool every {}s...", period.as_secs());

    let mut ticks = IntervalStream::new(interval(period));

    while ticks.next().await.is_some() {
        match repair.run_once().await {
            Ok(report) if report.updated => info!("Pool snapshot repaired: {report:?}"),
            Ok(report) => debug!("Pool snapshot is consistent: {report:?}"),
            Err(error) => error!("Pool repair failed! {error}"),
        }
    }
}
