use std::net::IpAddr;

use ipnet::IpNet;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::{
    ip::{Allocator, Snapshottable},
    resources::crd::v1alpha1::rangeallocation::RangeAllocation,
    storage::StorageError,
};

use super::{
    range_store::RangeStore,
    snapshot::{restore_range, snapshot_range},
    AllocationError,
};

/// Result of an operation applied to the allocator.
enum Change<T> {
    /// the allocator was modified, the snapshot must be written
    Modified(T),
    /// nothing to persist
    Unchanged(T),
}

/// An allocator whose every change is persisted through a [`RangeStore`].
///
/// Each operation re-reads the stored snapshot, applies itself to that state and
/// writes the result back with compare-and-swap. Losing the race to another
/// process simply starts over from the fresher snapshot, up to `max_retries`
/// attempts.
pub struct PersistedAllocator<A, R> {
    allocator: Mutex<A>,
    store: R,
    max_retries: usize,
}

impl<A, R> PersistedAllocator<A, R>
where
    A: Allocator + Snapshottable + Send,
    R: RangeStore,
{
    pub fn new(allocator: A, store: R, max_retries: usize) -> Self {
        Self {
            allocator: Mutex::new(allocator),
            store,
            max_retries: max_retries.max(1),
        }
    }

    pub fn store(&self) -> &R {
        &self.store
    }

    pub async fn network(&self) -> IpNet {
        self.allocator.lock().await.network()
    }

    /// Loads the stored snapshot into the local allocator.
    ///
    /// Malformed or incompatible snapshots are returned as errors, the local state is
    /// left untouched in that case.
    pub async fn refresh(&self) -> Result<(), AllocationError> {
        let mut allocator = self.allocator.lock().await;
        let record = self.store.get().await.map_err(AllocationError::Storage)?;

        sync_allocator(&mut *allocator, &record)?;

        info!(
            "Restored pool {} ({} used, {} free)",
            allocator.network(),
            allocator.used(),
            allocator.free()
        );

        Ok(())
    }

    pub async fn allocate(&self, ip: IpAddr) -> Result<(), AllocationError> {
        self.try_update(|allocator| {
            allocator
                .allocate(ip)
                .map(Change::Modified)
                .map_err(AllocationError::Allocator)
        })
        .await?;

        info!("Allocated {ip} address!");

        Ok(())
    }

    pub async fn allocate_next(&self) -> Result<IpAddr, AllocationError> {
        let ip = self
            .try_update(|allocator| {
                allocator
                    .allocate_next()
                    .map(Change::Modified)
                    .map_err(AllocationError::Allocator)
            })
            .await?;

        info!("Allocated {ip} address!");

        Ok(ip)
    }

    /// Frees the address, releasing an address that isn't allocated is a no-op.
    pub async fn release(&self, ip: IpAddr) -> Result<(), AllocationError> {
        let network = self.network().await;
        if !network.contains(&ip) {
            warn!("Address {ip} is outside of the {network} pool, nothing to release!");
            return Ok(());
        }

        let released = self
            .try_update(|allocator| {
                Ok(match allocator.release(ip) {
                    true => Change::Modified(true),
                    false => Change::Unchanged(false),
                })
            })
            .await?;

        match released {
            true => info!("Released {ip} address!"),
            false => debug!("Address {ip} wasn't allocated, nothing to release"),
        }

        Ok(())
    }

    /// Whether the address is allocated, as of the last read of the snapshot.
    pub async fn has(&self, ip: IpAddr) -> bool {
        self.allocator.lock().await.has(ip)
    }

    /// Number of free addresses, as of the last read of the snapshot.
    pub async fn free(&self) -> usize {
        self.allocator.lock().await.free()
    }

    async fn try_update<T, F>(&self, mut operation: F) -> Result<T, AllocationError>
    where
        F: FnMut(&mut A) -> Result<Change<T>, AllocationError> + Send,
        T: Send,
    {
        let mut allocator = self.allocator.lock().await;

        for attempt in 1..=self.max_retries {
            let mut record = self.store.get().await.map_err(AllocationError::Storage)?;

            sync_allocator(&mut *allocator, &record)?;

            let (network, committed) = allocator.snapshot();
            let value = match operation(&mut *allocator)? {
                Change::Unchanged(value) => return Ok(value),
                Change::Modified(value) => value,
            };

            snapshot_range(&mut record, &*allocator);

            let error = match self.store.create_or_update(&record).await {
                Ok(_) => return Ok(value),
                Err(error) => error,
            };

            // whatever was tentatively taken goes back before anything else happens
            if let Err(rollback_error) = allocator.restore(network, &committed) {
                warn!("Couldn't roll back the local allocator state! {rollback_error}");
            }

            match error {
                StorageError::Conflict => {
                    debug!(
                        "Pool snapshot changed underneath us, retrying ({attempt}/{})",
                        self.max_retries
                    );
                }
                error => return Err(AllocationError::Storage(error)),
            }
        }

        warn!(
            "Pool {} is too contended, giving up after {} attempts!",
            allocator.network(),
            self.max_retries
        );

        Err(AllocationError::RetriesExhausted(self.max_retries))
    }
}

/// Brings the local allocator in line with a stored record, an empty record means
/// a pool that was never used.
fn sync_allocator<A>(allocator: &mut A, record: &RangeAllocation) -> Result<(), AllocationError>
where
    A: Allocator + Snapshottable + ?Sized,
{
    match record.is_empty() {
        true => allocator.reset(),
        false => restore_range(allocator, record)?,
    }

    Ok(())
}
