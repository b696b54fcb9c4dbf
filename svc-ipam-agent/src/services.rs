use std::time::Duration;

use futures::StreamExt;
use kube::ResourceExt;
use log::{info, warn};
use svc_ipam_core::{
    allocation::range_store::RangeStore,
    helpers::object_ref,
    ip::{Allocator, Snapshottable},
    registry::{RequestContext, ServiceRegistry},
    resources::crd::v1alpha1::virtualservice::VirtualService,
    storage::{ObjectStore, StorageError, WatchEvent},
};
use tokio::time::sleep;

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Logs every service change, resuming from the last seen version whenever the watch
/// drops. Never returns.
pub async fn log_service_changes<S, A, R>(registry: &ServiceRegistry<S, A, R>)
where
    S: ObjectStore<VirtualService>,
    A: Allocator + Snapshottable + Send,
    R: RangeStore,
{
    let context = RequestContext::all();
    let mut last_seen: Option<String> = None;

    loop {
        let mut changes = match registry.watch(&context, "", "", last_seen.as_deref()).await {
            Ok(changes) => changes,
            Err(error) => {
                warn!("Couldn't watch services, retrying! {error}");
                last_seen = None;
                sleep(WATCH_RETRY_DELAY).await;
                continue;
            }
        };

        while let Some(change) = changes.next().await {
            let change = match change {
                Ok(change) => change,
                Err(StorageError::Expired) => {
                    warn!("Service watch fell too far behind, starting over from now!");
                    last_seen = None;
                    break;
                }
                Err(error) => {
                    warn!("Service watch failed, resuming! {error}");
                    break;
                }
            };

            last_seen = change.object().resource_version();
            log_change(&change);
        }

        sleep(WATCH_RETRY_DELAY).await;
    }
}

fn log_change(change: &WatchEvent<VirtualService>) {
    let (verb, service) = match change {
        WatchEvent::Added(service) => ("added", service),
        WatchEvent::Modified(service) => ("modified", service),
        WatchEvent::Deleted(service) => ("deleted", service),
    };

    info!(
        "Service {} {verb} (cluster IP: {})",
        object_ref(service),
        service.spec.cluster_ip.as_deref().unwrap_or("---")
    );
}
