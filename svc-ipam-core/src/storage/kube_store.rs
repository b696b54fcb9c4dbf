use std::{fmt::Debug, marker::PhantomData};

use async_trait::async_trait;
use futures::{future::ready, StreamExt};
use k8s_openapi::{
    serde::{de::DeserializeOwned, Serialize},
    NamespaceResourceScope,
};
use kube::{
    api::{DeleteParams, ListParams, PostParams, Preconditions, WatchEvent as KubeWatchEvent, WatchParams},
    Api, Client, Resource,
};
use log::{debug, warn};

use crate::helpers::{pretty_type_name, RequireMetadata};

use super::{Listing, ObjectStore, StorageError, WatchEvent, WatchStream};

impl From<kube::Error> for StorageError {
    fn from(error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(response) => match response.code {
                404 => StorageError::NotFound,
                409 if response.reason == "AlreadyExists" => StorageError::AlreadyExists,
                409 => StorageError::Conflict,
                410 => StorageError::Expired,
                _ => StorageError::Kube(error),
            },
            _ => StorageError::Kube(error),
        }
    }
}

/// [`ObjectStore`] backed by the Kubernetes API, `resourceVersion` handling is left
/// entirely to the API server.
#[derive(Clone)]
pub struct KubeStore<K> {
    client: Client,
    _resource: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _resource: PhantomData,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    fn api(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StorageError> {
        Ok(self.api(Some(namespace)).get_opt(name).await?)
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, StorageError> {
        let mut object = object.clone();
        object.meta_mut().resource_version = None;

        debug!(
            "Creating {}/{} {}...",
            namespace,
            object.require_name_or(StorageError::MissingMetadata("name".into()))?,
            pretty_type_name::<K>()
        );

        Ok(self
            .api(Some(namespace))
            .create(&PostParams::default(), &object)
            .await?)
    }

    async fn update(&self, namespace: &str, object: &K) -> Result<K, StorageError> {
        let name = object.require_name_or(StorageError::MissingMetadata("name".into()))?;

        // the API server treats a replace without a version as unconditional
        if object.meta().resource_version.is_none() {
            return Err(StorageError::MissingMetadata("resourceVersion".into()));
        }

        Ok(self
            .api(Some(namespace))
            .replace(name, &PostParams::default(), object)
            .await?)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), StorageError> {
        let delete_params = DeleteParams {
            preconditions: resource_version.map(|resource_version| Preconditions {
                resource_version: Some(resource_version.to_owned()),
                uid: None,
            }),
            ..Default::default()
        };

        self.api(Some(namespace))
            .delete(name, &delete_params)
            .await?;

        Ok(())
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Listing<K>, StorageError> {
        let list = self.api(namespace).list(&ListParams::default()).await?;

        Ok(Listing {
            items: list.items,
            resource_version: list.metadata.resource_version,
        })
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<WatchStream<K>, StorageError> {
        let api = self.api(namespace);
        let resource_version = match resource_version {
            Some(resource_version) => resource_version.to_owned(),
            None => api
                .list_metadata(&ListParams::default().limit(1))
                .await?
                .metadata
                .resource_version
                .unwrap_or_else(|| "0".to_owned()),
        };

        let stream = api
            .watch(&WatchParams::default(), &resource_version)
            .await?
            .filter_map(|event| {
                ready(match event {
                    Ok(KubeWatchEvent::Added(object)) => Some(Ok(WatchEvent::Added(object))),
                    Ok(KubeWatchEvent::Modified(object)) => Some(Ok(WatchEvent::Modified(object))),
                    Ok(KubeWatchEvent::Deleted(object)) => Some(Ok(WatchEvent::Deleted(object))),
                    Ok(KubeWatchEvent::Bookmark(_)) => None,
                    Ok(KubeWatchEvent::Error(response)) => {
                        warn!("Watch of {} failed: {}", pretty_type_name::<K>(), response.message);
                        Some(Err(StorageError::from(kube::Error::Api(response))))
                    }
                    Err(error) => Some(Err(StorageError::from(error))),
                })
            });

        Ok(stream.boxed())
    }
}
