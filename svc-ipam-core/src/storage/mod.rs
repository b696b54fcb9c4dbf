use std::{borrow::Cow, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub mod kube_store;
pub mod memory;
pub mod selector;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object doesn't exist!")]
    NotFound,
    #[error("Object already exists!")]
    AlreadyExists,
    #[error("Object was modified since it was last read!")]
    Conflict,
    #[error("Requested resource version is no longer available!")]
    Expired,
    #[error("'{}' is not a valid resource version!", .0)]
    InvalidVersion(String),
    #[error("Object is missing metadata ({})!", .0)]
    MissingMetadata(Cow<'static, str>),
    #[error("Kubernetes API call failed! Reason: {}", .0)]
    Kube(kube::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(object) => object,
            WatchEvent::Modified(object) => object,
            WatchEvent::Deleted(object) => object,
        }
    }

    pub fn into_object(self) -> K {
        match self {
            WatchEvent::Added(object) => object,
            WatchEvent::Modified(object) => object,
            WatchEvent::Deleted(object) => object,
        }
    }
}

/// Objects returned by a list call together with the version the list was read at,
/// watching from that version continues without gaps.
#[derive(Debug, Clone)]
pub struct Listing<K> {
    pub items: Vec<K>,
    pub resource_version: Option<String>,
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, StorageError>>;

/// Keyed object storage with optimistic concurrency.
///
/// Every stored object carries its version in `metadata.resourceVersion`. Writes
/// of a stale version fail with [`StorageError::Conflict`] and leave the stored
/// object untouched.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StorageError>;

    async fn create(&self, namespace: &str, object: &K) -> Result<K, StorageError>;

    /// Compare-and-swap on the object's resource version.
    async fn update(&self, namespace: &str, object: &K) -> Result<K, StorageError>;

    /// Removes the object, when a resource version is given only if it still matches.
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), StorageError>;

    /// `None` lists every namespace.
    async fn list(&self, namespace: Option<&str>) -> Result<Listing<K>, StorageError>;

    /// Changes made after `resource_version` in order, or only future changes when
    /// no version is given. Dropping the stream ends the subscription.
    async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<WatchStream<K>, StorageError>;
}

#[async_trait]
impl<K, S> ObjectStore<K> for Arc<S>
where
    K: Send + Sync + 'static,
    S: ObjectStore<K> + ?Sized,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StorageError> {
        (**self).get(namespace, name).await
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, StorageError> {
        (**self).create(namespace, object).await
    }

    async fn update(&self, namespace: &str, object: &K) -> Result<K, StorageError> {
        (**self).update(namespace, object).await
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), StorageError> {
        (**self).delete(namespace, name, resource_version).await
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Listing<K>, StorageError> {
        (**self).list(namespace).await
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<WatchStream<K>, StorageError> {
        (**self).watch(namespace, resource_version).await
    }
}
