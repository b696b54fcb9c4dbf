use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::Utc;
use futures::{future::ready, stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use log::trace;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::helpers::RequireMetadata;

use super::{Listing, ObjectStore, StorageError, WatchEvent, WatchStream};

pub const DEFAULT_CHANGE_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Change<K> {
    revision: u64,
    namespace: String,
    event: WatchEvent<K>,
}

#[derive(Debug)]
struct State<K> {
    revision: u64,
    objects: BTreeMap<(String, String), K>,
    changes: VecDeque<Change<K>>,
}

/// Process-local [`ObjectStore`] with a single revision counter shared by all objects.
///
/// The last `capacity` changes are kept around so watches can resume from an older
/// revision, anything older than that is reported as [`StorageError::Expired`].
#[derive(Debug)]
pub struct MemoryStore<K> {
    state: Mutex<State<K>>,
    feed: broadcast::Sender<Change<K>>,
    capacity: usize,
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANGE_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (feed, _) = broadcast::channel(capacity);

        Self {
            state: Mutex::new(State {
                revision: 0,
                objects: BTreeMap::new(),
                changes: VecDeque::with_capacity(capacity),
            }),
            feed,
            capacity,
        }
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bumps the revision, stamps it onto the object and records the change.
    fn commit(
        &self,
        state: &mut State<K>,
        namespace: &str,
        mut object: K,
        event: fn(K) -> WatchEvent<K>,
    ) -> K {
        state.revision += 1;
        object.meta_mut().resource_version = Some(state.revision.to_string());

        let change = Change {
            revision: state.revision,
            namespace: namespace.to_owned(),
            event: event(object.clone()),
        };

        if state.changes.len() == self.capacity {
            state.changes.pop_front();
        }
        state.changes.push_back(change.clone());

        // nobody listening is fine
        let _ = self.feed.send(change);

        object
    }
}

impl<K> Default for MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_owned(), name.to_owned())
}

fn parse_revision(raw: &str) -> Result<u64, StorageError> {
    raw.parse()
        .map_err(|_| StorageError::InvalidVersion(raw.to_owned()))
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StorageError> {
        Ok(self.lock().objects.get(&key(namespace, name)).cloned())
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, StorageError> {
        let name = object.require_name_or(StorageError::MissingMetadata("name".into()))?;
        let mut state = self.lock();
        let key = key(namespace, name);

        if state.objects.contains_key(&key) {
            return Err(StorageError::AlreadyExists);
        }

        let mut object = object.clone();
        let meta = object.meta_mut();
        meta.namespace = Some(namespace.to_owned());
        meta.uid = Some(format!("{:032x}", rand::random::<u128>()));
        meta.creation_timestamp = Some(Time(Utc::now()));

        let object = self.commit(&mut state, namespace, object, WatchEvent::Added);
        state.objects.insert(key, object.clone());

        Ok(object)
    }

    async fn update(&self, namespace: &str, object: &K) -> Result<K, StorageError> {
        let name = object.require_name_or(StorageError::MissingMetadata("name".into()))?;
        let expected = object
            .meta()
            .resource_version
            .as_deref()
            .ok_or(StorageError::MissingMetadata("resourceVersion".into()))?;
        let mut state = self.lock();
        let key = key(namespace, name);
        let current = state.objects.get(&key).ok_or(StorageError::NotFound)?;

        if current.meta().resource_version.as_deref() != Some(expected) {
            trace!("Rejecting {namespace}/{name} update, version {expected} is stale");
            return Err(StorageError::Conflict);
        }

        let mut object = object.clone();
        let meta = object.meta_mut();
        meta.namespace = Some(namespace.to_owned());
        meta.uid = current.meta().uid.clone();
        meta.creation_timestamp = current.meta().creation_timestamp.clone();

        let object = self.commit(&mut state, namespace, object, WatchEvent::Modified);
        state.objects.insert(key, object.clone());

        Ok(object)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        let key = key(namespace, name);
        let current = state.objects.get(&key).ok_or(StorageError::NotFound)?;

        if let Some(expected) = resource_version {
            if current.meta().resource_version.as_deref() != Some(expected) {
                return Err(StorageError::Conflict);
            }
        }

        if let Some(object) = state.objects.remove(&key) {
            self.commit(&mut state, namespace, object, WatchEvent::Deleted);
        }

        Ok(())
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Listing<K>, StorageError> {
        let state = self.lock();
        let items = state
            .objects
            .iter()
            .filter(|((object_namespace, _), _)| {
                namespace.map_or(true, |namespace| namespace == object_namespace)
            })
            .map(|(_, object)| object.clone())
            .collect();

        Ok(Listing {
            items,
            resource_version: Some(state.revision.to_string()),
        })
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<WatchStream<K>, StorageError> {
        let since = resource_version.map(parse_revision).transpose()?;
        let state = self.lock();
        let since = since.unwrap_or(state.revision);

        if since > state.revision {
            return Err(StorageError::InvalidVersion(since.to_string()));
        }

        if let Some(oldest) = state.changes.front() {
            if oldest.revision > since.saturating_add(1) {
                return Err(StorageError::Expired);
            }
        }

        let backlog = state
            .changes
            .iter()
            .filter(|change| change.revision > since)
            .cloned()
            .collect::<Vec<_>>();
        // subscribing while still holding the lock, no commit can slip in between
        let receiver = self.feed.subscribe();
        drop(state);

        let replayed_up_to = backlog.last().map_or(since, |change| change.revision);
        let live = stream::unfold(Some(receiver), |receiver| async move {
            let mut receiver = receiver?;

            match receiver.recv().await {
                Ok(change) => Some((Ok(change), Some(receiver))),
                Err(RecvError::Lagged(_)) => Some((Err(StorageError::Expired), None)),
                Err(RecvError::Closed) => None,
            }
        })
        .filter(move |change| {
            ready(!matches!(change, Ok(change) if change.revision <= replayed_up_to))
        });

        let namespace = namespace.map(str::to_owned);
        let stream = stream::iter(backlog.into_iter().map(Ok))
            .chain(live)
            .filter_map(move |change| {
                ready(match change {
                    Ok(change) => match &namespace {
                        Some(namespace) if namespace != &change.namespace => None,
                        _ => Some(Ok(change.event)),
                    },
                    Err(error) => Some(Err(error)),
                })
            });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use futures::{FutureExt, StreamExt};
    use kube::ResourceExt;

    use crate::{
        resources::crd::v1alpha1::virtualservice::{VirtualService, VirtualServiceSpec},
        storage::{ObjectStore, StorageError, WatchEvent},
    };

    use super::MemoryStore;

    fn service(name: &str) -> VirtualService {
        VirtualService::new(name, VirtualServiceSpec::default())
    }

    #[tokio::test]
    async fn memory_store_rejects_stale_updates() {
        let store: MemoryStore<VirtualService> = MemoryStore::new();
        let created = store.create("default", &service("web")).await.unwrap();

        let mut first = created.clone();
        first.spec.cluster_ip = Some("10.0.0.1".to_owned());
        let updated = store.update("default", &first).await.unwrap();

        let mut second = created.clone();
        second.spec.cluster_ip = Some("10.0.0.2".to_owned());

        assert!(matches!(
            store.update("default", &second).await,
            Err(StorageError::Conflict)
        ));

        let stored = store.get("default", "web").await.unwrap().unwrap();

        assert_eq!(stored, updated);
        assert_eq!(stored.uid(), created.uid());
        assert_ne!(stored.resource_version(), created.resource_version());
    }

    #[tokio::test]
    async fn memory_store_honors_delete_preconditions() {
        let store: MemoryStore<VirtualService> = MemoryStore::new();
        let created = store.create("default", &service("web")).await.unwrap();

        assert!(matches!(
            store.create("default", &service("web")).await,
            Err(StorageError::AlreadyExists)
        ));
        assert!(matches!(
            store.delete("default", "web", Some("1234")).await,
            Err(StorageError::Conflict)
        ));

        store
            .delete("default", "web", created.resource_version().as_deref())
            .await
            .unwrap();

        assert!(store.get("default", "web").await.unwrap().is_none());
        assert!(matches!(
            store.delete("default", "web", None).await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn memory_store_lists_per_namespace() {
        let store: MemoryStore<VirtualService> = MemoryStore::new();
        store.create("default", &service("web")).await.unwrap();
        store.create("default", &service("db")).await.unwrap();
        store.create("other", &service("web")).await.unwrap();

        assert_eq!(store.list(Some("default")).await.unwrap().items.len(), 2);

        let everything = store.list(None).await.unwrap();

        assert_eq!(everything.items.len(), 3);
        assert_eq!(everything.resource_version.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn watch_replays_missed_changes_then_follows_live_ones() {
        let store: MemoryStore<VirtualService> = MemoryStore::new();
        let first = store.create("default", &service("a")).await.unwrap();
        store.create("default", &service("b")).await.unwrap();

        let mut watch = store
            .watch(Some("default"), first.resource_version().as_deref())
            .await
            .unwrap();

        store.create("other", &service("ignored")).await.unwrap();
        store.delete("default", "a", None).await.unwrap();

        let replayed = watch.next().await.unwrap().unwrap();
        assert!(matches!(replayed, WatchEvent::Added(ref object) if object.name_any() == "b"));

        let live = watch.next().await.unwrap().unwrap();
        assert!(matches!(live, WatchEvent::Deleted(ref object) if object.name_any() == "a"));

        assert!(watch.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn watch_from_compacted_version_is_expired() {
        let store: MemoryStore<VirtualService> = MemoryStore::with_capacity(2);

        for name in ["a", "b", "c", "d"] {
            store.create("default", &service(name)).await.unwrap();
        }

        assert!(matches!(
            store.watch(None, Some("1")).await,
            Err(StorageError::Expired)
        ));
        assert!(store.watch(None, Some("2")).await.is_ok());
        assert!(matches!(
            store.watch(None, Some("yesterday")).await,
            Err(StorageError::InvalidVersion(_))
        ));
        // versions the store hasn't reached yet
        assert!(matches!(
            store.watch(None, Some("5")).await,
            Err(StorageError::InvalidVersion(_))
        ));
        assert!(matches!(
            store.watch(None, Some("18446744073709551615")).await,
            Err(StorageError::InvalidVersion(_))
        ));
        assert!(store.watch(None, Some("4")).await.is_ok());
    }
}
