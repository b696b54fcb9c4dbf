use derive_builder::Builder;
use ipnet::IpNet;
use thiserror::Error;

use crate::{
    ip::{bitmap::BitmapAllocator, AllocationStrategy, AllocatorError, SnapshotError},
    resources::crd::v1alpha1::rangeallocation::RangeAllocation,
    storage::{ObjectStore, StorageError},
};

use self::range_store::StoredRangeStore;

pub mod persisted;
pub mod range_store;
pub mod repair;
pub mod snapshot;

pub const DEFAULT_POOL_NAME: &str = "service-cidr";
pub const DEFAULT_MAX_RETRIES: usize = 10;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Couldn't allocate an address! Details: {}", .0)]
    Allocator(AllocatorError),
    #[error("Gave up persisting the pool snapshot after {} conflicting attempts!", .0)]
    RetriesExhausted(usize),
    #[error("Couldn't restore the pool snapshot! Details: {}", .0)]
    Snapshot(SnapshotError),
    #[error("Couldn't access the pool snapshot! Reason: {}", .0)]
    Storage(StorageError),
}

impl AllocationError {
    /// The pool can't hand out an address right now, either because it's full or
    /// because it's too contended to make progress.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            AllocationError::Allocator(AllocatorError::RangeExhausted)
                | AllocationError::RetriesExhausted(_)
        )
    }
}

impl From<SnapshotError> for AllocationError {
    fn from(error: SnapshotError) -> Self {
        AllocationError::Snapshot(error)
    }
}

/// Everything needed to manage one address pool.
#[derive(Debug, Clone, Builder)]
pub struct Pool {
    #[builder(setter(into), default = "DEFAULT_POOL_NAME.to_owned()")]
    pub name: String,
    #[builder(setter(into))]
    pub namespace: String,
    pub network: IpNet,
    #[builder(default)]
    pub strategy: AllocationStrategy,
    #[builder(default = "DEFAULT_MAX_RETRIES")]
    pub max_retries: usize,
}

#[derive(Debug, Error)]
pub enum PoolValidationError {
    #[error("Range {} has host bits set, did you mean {}?", .0, .0.trunc())]
    HostBitsSet(IpNet),
    #[error("At least one allocation attempt must be allowed!")]
    NoAttempts,
}

impl Pool {
    pub fn validated(self) -> Result<Self, PoolValidationError> {
        if self.network.trunc() != self.network {
            return Err(PoolValidationError::HostBitsSet(self.network));
        }

        if self.max_retries == 0 {
            return Err(PoolValidationError::NoAttempts);
        }

        Ok(self)
    }

    /// A fresh allocator for this pool, with nothing allocated.
    pub fn allocator(&self) -> BitmapAllocator {
        BitmapAllocator::new(self.network, self.strategy)
    }

    pub fn range_store<S>(&self, store: S) -> StoredRangeStore<S>
    where
        S: ObjectStore<RangeAllocation>,
    {
        StoredRangeStore::new(store, &self.namespace, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use crate::ip::AllocationStrategy;

    use super::{PoolBuilder, PoolValidationError, DEFAULT_MAX_RETRIES, DEFAULT_POOL_NAME};

    #[test]
    fn pool_builder_fills_defaults() {
        let pool = PoolBuilder::default()
            .namespace("svc-ipam")
            .network("10.96.0.0/16".parse().unwrap())
            .build()
            .unwrap()
            .validated()
            .unwrap();

        assert_eq!(pool.name, DEFAULT_POOL_NAME);
        assert_eq!(pool.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(pool.strategy, AllocationStrategy::Random);
    }

    #[test]
    fn pool_without_attempts_is_invalid() {
        let pool = PoolBuilder::default()
            .namespace("svc-ipam")
            .network("10.96.0.0/16".parse().unwrap())
            .max_retries(0)
            .build()
            .unwrap();

        assert!(matches!(pool.validated(), Err(PoolValidationError::NoAttempts)));
    }

    #[test]
    fn pool_range_must_be_a_network_address() {
        let pool = PoolBuilder::default()
            .namespace("svc-ipam")
            .network("10.96.0.1/16".parse().unwrap())
            .build()
            .unwrap();

        assert!(matches!(pool.validated(), Err(PoolValidationError::HostBitsSet(_))));
    }
}
