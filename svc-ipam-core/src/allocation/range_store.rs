use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;

use crate::{
    resources::crd::v1alpha1::rangeallocation::RangeAllocation,
    storage::{ObjectStore, StorageError},
};

/// Holds the one current snapshot record of a pool.
#[async_trait]
pub trait RangeStore: Send + Sync {
    /// The latest record, or an empty one if nothing was ever allocated.
    async fn get(&self) -> Result<RangeAllocation, StorageError>;

    /// Creates or updates the record unless it was modified since it was read,
    /// a lost race is reported as [`StorageError::Conflict`] and nothing is written.
    async fn create_or_update(
        &self,
        allocation: &RangeAllocation,
    ) -> Result<RangeAllocation, StorageError>;
}

#[async_trait]
impl<R: RangeStore + ?Sized> RangeStore for Arc<R> {
    async fn get(&self) -> Result<RangeAllocation, StorageError> {
        (**self).get().await
    }

    async fn create_or_update(
        &self,
        allocation: &RangeAllocation,
    ) -> Result<RangeAllocation, StorageError> {
        (**self).create_or_update(allocation).await
    }
}

/// [`RangeStore`] keeping the record as a `RangeAllocation` object in any [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct StoredRangeStore<S> {
    store: S,
    namespace: String,
    name: String,
}

impl<S> StoredRangeStore<S>
where
    S: ObjectStore<RangeAllocation>,
{
    pub fn new(store: S, namespace: &str, name: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<S> RangeStore for StoredRangeStore<S>
where
    S: ObjectStore<RangeAllocation>,
{
    async fn get(&self) -> Result<RangeAllocation, StorageError> {
        Ok(self
            .store
            .get(&self.namespace, &self.name)
            .await?
            .unwrap_or_else(|| RangeAllocation::empty(&self.name, &self.namespace)))
    }

    async fn create_or_update(
        &self,
        allocation: &RangeAllocation,
    ) -> Result<RangeAllocation, StorageError> {
        let mut allocation = allocation.clone();
        allocation.metadata.name = Some(self.name.to_owned());
        allocation.metadata.namespace = Some(self.namespace.to_owned());

        match allocation.resource_version() {
            Some(_) => self.store.update(&self.namespace, &allocation).await,
            // someone else created the record first
            None => match self.store.create(&self.namespace, &allocation).await {
                Err(StorageError::AlreadyExists) => Err(StorageError::Conflict),
                result => result,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        resources::crd::v1alpha1::rangeallocation::RangeAllocation,
        storage::{memory::MemoryStore, StorageError},
    };

    use super::{RangeStore, StoredRangeStore};

    #[tokio::test]
    async fn missing_record_reads_as_empty() {
        let ranges = StoredRangeStore::new(
            MemoryStore::<RangeAllocation>::new(),
            "svc-ipam",
            "service-cidr",
        );

        let record = ranges.get().await.unwrap();

        assert!(record.is_empty());
        assert!(record.metadata.resource_version.is_none());
        assert_eq!(record.metadata.name.as_deref(), Some("service-cidr"));
    }

    #[tokio::test]
    async fn only_one_writer_wins_per_version() {
        let store = Arc::new(MemoryStore::<RangeAllocation>::new());
        let first = StoredRangeStore::new(store.clone(), "svc-ipam", "service-cidr");
        let second = StoredRangeStore::new(store.clone(), "svc-ipam", "service-cidr");

        let mut first_record = first.get().await.unwrap();
        let mut second_record = second.get().await.unwrap();
        first_record.spec.range = "10.0.0.0/30".to_owned();
        first_record.spec.data = vec![0b01];
        second_record.spec.range = "10.0.0.0/30".to_owned();
        second_record.spec.data = vec![0b10];

        let created = first.create_or_update(&first_record).await.unwrap();
        assert!(matches!(
            second.create_or_update(&second_record).await,
            Err(StorageError::Conflict)
        ));

        let mut fresh = second.get().await.unwrap();
        assert_eq!(fresh, created);

        fresh.spec.data = vec![0b11];
        second.create_or_update(&fresh).await.unwrap();

        assert!(matches!(
            first.create_or_update(&created).await,
            Err(StorageError::Conflict)
        ));
        assert_eq!(first.get().await.unwrap().spec.data, vec![0b11]);
    }
}
