use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Mutex, PoisonError},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    helpers::object_ref,
    ip::{Allocator, AllocatorError, Snapshottable},
    resources::crd::v1alpha1::virtualservice::{Addressing, VirtualService},
    storage::{ObjectStore, StorageError},
};

use super::{
    range_store::RangeStore,
    snapshot::{restore_range, snapshot_range},
    AllocationError,
};

/// Consecutive runs an address has to look leaked before it's released, a service
/// being created right now has its address persisted before its record.
pub const DEFAULT_LEAK_GRACE_RUNS: usize = 3;

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("Couldn't list services! Reason: {}", .0)]
    ListServices(StorageError),
    #[error("Couldn't repair the pool snapshot! Details: {}", .0)]
    Allocation(AllocationError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// addresses held by services and marked in the snapshot
    pub held: usize,
    /// held by a service but missing from the snapshot, marked again
    pub missing: Vec<IpAddr>,
    /// looked leaked, kept for now
    pub pending_leaks: Vec<IpAddr>,
    /// leaked for long enough, released
    pub released_leaks: Vec<IpAddr>,
    /// services sharing an address with another service
    pub conflicting: Vec<String>,
    /// services holding an address outside of the pool
    pub out_of_range: Vec<String>,
    /// services whose address doesn't parse
    pub invalid: Vec<String>,
    /// whether the snapshot had to be rewritten
    pub updated: bool,
}

/// Reconciles the pool snapshot with the services that actually exist.
///
/// Creating or deleting a service writes the snapshot and the service record
/// separately, a failure in between leaves an address marked in the snapshot that
/// no service holds, or the other way around. This pass rebuilds the usage map
/// from the live services and fixes both.
pub struct Repair<S, A, R> {
    services: S,
    ranges: R,
    template: A,
    max_retries: usize,
    leak_grace_runs: usize,
    leaks: Mutex<HashMap<IpAddr, usize>>,
}

impl<S, A, R> Repair<S, A, R>
where
    S: ObjectStore<VirtualService>,
    A: Allocator + Snapshottable + Clone + Send + Sync,
    R: RangeStore,
{
    pub fn new(services: S, ranges: R, mut template: A, max_retries: usize) -> Self {
        template.reset();

        Self {
            services,
            ranges,
            template,
            max_retries: max_retries.max(1),
            leak_grace_runs: DEFAULT_LEAK_GRACE_RUNS,
            leaks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_leak_grace_runs(mut self, runs: usize) -> Self {
        self.leak_grace_runs = runs.max(1);
        self
    }

    pub async fn run_once(&self) -> Result<RepairReport, RepairError> {
        for attempt in 1..=self.max_retries {
            let mut record = self
                .ranges
                .get()
                .await
                .map_err(|error| RepairError::Allocation(AllocationError::Storage(error)))?;

            let mut stored = self.template.clone();
            if !record.is_empty() {
                restore_range(&mut stored, &record)
                    .map_err(|error| RepairError::Allocation(error.into()))?;
            }

            let services = self
                .services
                .list(None)
                .await
                .map_err(RepairError::ListServices)?
                .items;

            let (rebuilt, report, leaks) = self.rebuild(&stored, &services);

            if rebuilt.snapshot() == stored.snapshot() {
                debug!("Pool snapshot is consistent with {} services", services.len());
                self.remember_leaks(leaks);
                return Ok(report);
            }

            snapshot_range(&mut record, &rebuilt);

            match self.ranges.create_or_update(&record).await {
                Ok(_) => {
                    info!(
                        "Repaired pool snapshot ({} held, {} re-marked, {} released)",
                        report.held,
                        report.missing.len(),
                        report.released_leaks.len()
                    );
                    self.remember_leaks(leaks);
                    return Ok(RepairReport {
                        updated: true,
                        ..report
                    });
                }
                Err(StorageError::Conflict) => {
                    debug!(
                        "Pool snapshot changed during repair, retrying ({attempt}/{})",
                        self.max_retries
                    );
                }
                Err(error) => {
                    return Err(RepairError::Allocation(AllocationError::Storage(error)))
                }
            }
        }

        Err(RepairError::Allocation(AllocationError::RetriesExhausted(
            self.max_retries,
        )))
    }

    fn rebuild(
        &self,
        stored: &A,
        services: &[VirtualService],
    ) -> (A, RepairReport, HashMap<IpAddr, usize>) {
        let mut rebuilt = self.template.clone();
        let mut report = RepairReport::default();

        for service in services {
            let ip = match service.spec.addressing() {
                Ok(Addressing::Static(ip)) => ip,
                Ok(_) => continue,
                Err(_) => {
                    warn!("Service {} has an unparsable cluster IP!", object_ref(service));
                    report.invalid.push(object_ref(service));
                    continue;
                }
            };

            match rebuilt.allocate(ip) {
                Ok(()) => {
                    report.held += 1;

                    if !stored.has(ip) {
                        warn!(
                            "Address {ip} of {} wasn't marked as allocated, repairing!",
                            object_ref(service)
                        );
                        report.missing.push(ip);
                    }
                }
                Err(AllocatorError::AddressInUse(_)) => {
                    warn!(
                        "Address {ip} of {} is also held by another service! Someone was naughty!",
                        object_ref(service)
                    );
                    report.conflicting.push(object_ref(service));
                }
                Err(_) => {
                    warn!(
                        "Address {ip} of {} is outside of the {} pool!",
                        object_ref(service),
                        rebuilt.network()
                    );
                    report.out_of_range.push(object_ref(service));
                }
            }
        }

        let previous_leaks = self
            .leaks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut leaks = HashMap::new();

        for ip in stored.allocated() {
            if rebuilt.has(ip) {
                continue;
            }

            let seen = previous_leaks.get(&ip).copied().unwrap_or(0) + 1;

            if seen < self.leak_grace_runs {
                debug!(
                    "Address {ip} isn't held by any service, releasing it in {} runs",
                    self.leak_grace_runs - seen
                );
                // freshly taken from the stored state, can't collide
                let _ = rebuilt.allocate(ip);
                leaks.insert(ip, seen);
                report.pending_leaks.push(ip);
            } else {
                warn!("Address {ip} isn't held by any service, releasing it!");
                report.released_leaks.push(ip);
            }
        }

        (rebuilt, report, leaks)
    }

    fn remember_leaks(&self, leaks: HashMap<IpAddr, usize>) {
        *self.leaks.lock().unwrap_or_else(PoisonError::into_inner) = leaks;
    }
}

#[cfg(test)]
mod tests {
    use std::{net::IpAddr, sync::Arc};

    use crate::{
        allocation::{
            range_store::{RangeStore, StoredRangeStore},
            snapshot::{restore_range, snapshot_range},
            AllocationError,
        },
        ip::{bitmap::BitmapAllocator, AllocationStrategy, Allocator, SnapshotError},
        resources::crd::v1alpha1::{
            rangeallocation::RangeAllocation,
            virtualservice::{VirtualService, VirtualServiceSpec},
        },
        storage::{memory::MemoryStore, ObjectStore},
    };

    use super::{Repair, RepairError};

    type Ranges = StoredRangeStore<Arc<MemoryStore<RangeAllocation>>>;
    type Services = Arc<MemoryStore<VirtualService>>;

    fn ip(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    fn bitmap() -> BitmapAllocator {
        BitmapAllocator::new("10.0.0.0/28".parse().unwrap(), AllocationStrategy::Sequential)
    }

    async fn setup(marked: &[&str], held: &[(&str, &str)]) -> (Services, Ranges) {
        let services: Services = Arc::new(MemoryStore::new());
        let ranges = StoredRangeStore::new(Arc::new(MemoryStore::new()), "svc-ipam", "service-cidr");

        let mut allocator = bitmap();
        for raw in marked {
            allocator.allocate(ip(raw)).unwrap();
        }
        let mut record = ranges.get().await.unwrap();
        snapshot_range(&mut record, &allocator);
        ranges.create_or_update(&record).await.unwrap();

        for (name, cluster_ip) in held {
            let spec = VirtualServiceSpec {
                cluster_ip: Some(cluster_ip.to_string()),
                ..Default::default()
            };
            services
                .create("default", &VirtualService::new(name, spec))
                .await
                .unwrap();
        }

        (services, ranges)
    }

    async fn marked(ranges: &Ranges) -> Vec<IpAddr> {
        let mut allocator = bitmap();
        restore_range(&mut allocator, &ranges.get().await.unwrap()).unwrap();
        allocator.allocated()
    }

    #[tokio::test]
    async fn repair_releases_leaks_and_marks_missing_addresses() {
        let (services, ranges) = setup(
            &["10.0.0.1", "10.0.0.2", "10.0.0.3"],
            &[("web", "10.0.0.1"), ("db", "10.0.0.5"), ("headless", "None")],
        )
        .await;
        let repair = Repair::new(services, ranges.clone(), bitmap(), 5).with_leak_grace_runs(1);

        let report = repair.run_once().await.unwrap();

        assert!(report.updated);
        assert_eq!(report.held, 2);
        assert_eq!(report.missing, vec![ip("10.0.0.5")]);
        assert_eq!(report.released_leaks, vec![ip("10.0.0.2"), ip("10.0.0.3")]);
        assert_eq!(marked(&ranges).await, vec![ip("10.0.0.1"), ip("10.0.0.5")]);

        let second = repair.run_once().await.unwrap();
        assert!(!second.updated);
    }

    #[tokio::test]
    async fn leaked_addresses_get_a_grace_period() {
        let (services, ranges) = setup(&["10.0.0.1", "10.0.0.2"], &[("web", "10.0.0.1")]).await;
        let repair = Repair::new(services, ranges.clone(), bitmap(), 5).with_leak_grace_runs(3);

        for _ in 0..2 {
            let report = repair.run_once().await.unwrap();
            assert_eq!(report.pending_leaks, vec![ip("10.0.0.2")]);
            assert_eq!(marked(&ranges).await, vec![ip("10.0.0.1"), ip("10.0.0.2")]);
        }

        let report = repair.run_once().await.unwrap();

        assert_eq!(report.released_leaks, vec![ip("10.0.0.2")]);
        assert_eq!(marked(&ranges).await, vec![ip("10.0.0.1")]);
    }

    #[tokio::test]
    async fn repair_reports_conflicting_and_foreign_addresses() {
        let (services, ranges) = setup(
            &["10.0.0.1"],
            &[("a", "10.0.0.1"), ("b", "10.0.0.1"), ("c", "192.168.0.1"), ("d", "10.0.0.x")],
        )
        .await;
        let repair = Repair::new(services, ranges, bitmap(), 5);

        let report = repair.run_once().await.unwrap();

        assert_eq!(report.held, 1);
        assert_eq!(report.conflicting, vec!["default/b".to_owned()]);
        assert_eq!(report.out_of_range, vec!["default/c".to_owned()]);
        assert_eq!(report.invalid, vec!["default/d".to_owned()]);
        assert!(!report.updated);
    }

    #[tokio::test]
    async fn repair_stops_at_a_malformed_snapshot() {
        let (services, ranges) = setup(&[], &[]).await;
        let mut record = ranges.get().await.unwrap();
        record.spec.range = "not-a-cidr".to_owned();
        ranges.create_or_update(&record).await.unwrap();

        let repair = Repair::new(services, ranges, bitmap(), 5);

        assert!(matches!(
            repair.run_once().await,
            Err(RepairError::Allocation(AllocationError::Snapshot(
                SnapshotError::MalformedRange(_)
            )))
        ));
    }
}
