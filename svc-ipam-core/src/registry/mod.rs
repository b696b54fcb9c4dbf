use std::net::IpAddr;

use futures::{future::ready, StreamExt};
use kube::ResourceExt;
use log::{info, warn};

use crate::{
    allocation::{persisted::PersistedAllocator, range_store::RangeStore},
    helpers::{object_ref, RequireMetadata},
    ip::{Allocator, Snapshottable},
    resources::crd::v1alpha1::virtualservice::{Addressing, VirtualService},
    storage::{
        selector::{FieldSelector, LabelSelector},
        ObjectStore, StorageError, WatchStream,
    },
};

pub use self::{context::RequestContext, error::RegistryError};

pub mod context;
pub mod error;


/// Services with their cluster addresses handed out from a single persisted pool.
///
/// The pool snapshot and the service records are separate objects, every operation
/// touching both writes the snapshot first and undoes its allocation when the service
/// write fails afterwards. Whatever still slips through is picked up by
/// [`crate::allocation::repair::Repair`].
pub struct ServiceRegistry<S, A, R> {
    services: S,
    allocator: PersistedAllocator<A, R>,
}

impl<S, A, R> ServiceRegistry<S, A, R>
where
    S: ObjectStore<VirtualService>,
    A: Allocator + Snapshottable + Send,
    R: RangeStore,
{
    pub fn new(services: S, allocator: PersistedAllocator<A, R>) -> Self {
        Self {
            services,
            allocator,
        }
    }

    pub fn services(&self) -> &S {
        &self.services
    }

    pub fn allocator(&self) -> &PersistedAllocator<A, R> {
        &self.allocator
    }

    pub async fn list(&self, context: &RequestContext) -> Result<Vec<VirtualService>, RegistryError> {
        Ok(self
            .services
            .list(context.namespace())
            .await
            .map_err(RegistryError::ObjectRead)?
            .items)
    }

    pub async fn get(
        &self,
        context: &RequestContext,
        name: &str,
    ) -> Result<VirtualService, RegistryError> {
        let namespace = context.require_namespace()?;

        self.services
            .get(namespace, name)
            .await
            .map_err(RegistryError::ObjectRead)?
            .ok_or_else(|| RegistryError::NotFound(format!("{namespace}/{name}")))
    }

    pub async fn create(
        &self,
        context: &RequestContext,
        service: &VirtualService,
    ) -> Result<VirtualService, RegistryError> {
        let namespace = context.resolve_namespace(service.metadata.namespace.as_deref())?;
        service.require_name_or(RegistryError::MissingObjectMetadata("name"))?;

        let mut service = service.clone();
        service.metadata.namespace = Some(namespace.to_owned());
        service.metadata.resource_version = None;

        let address = match addressing(&service)? {
            Addressing::Headless => None,
            Addressing::Allocate => Some(self.allocator.allocate_next().await?),
            Addressing::Static(ip) => {
                self.allocator.allocate(ip).await?;
                Some(ip)
            }
        };
        service.spec.set_address(address);

        match self.services.create(&namespace, &service).await {
            Ok(created) => {
                info!("Created service {}", object_ref(&created));
                Ok(created)
            }
            Err(error) => {
                if let Some(ip) = address {
                    self.release_quietly(ip, &service).await;
                }

                Err(match error {
                    StorageError::AlreadyExists => RegistryError::AlreadyExists(object_ref(&service)),
                    error => RegistryError::ObjectWrite(error),
                })
            }
        }
    }

    /// Removes the service, its address is released and persisted before the record
    /// disappears.
    pub async fn delete(
        &self,
        context: &RequestContext,
        name: &str,
    ) -> Result<VirtualService, RegistryError> {
        let service = self.get(context, name).await?;
        let namespace = context.require_namespace()?;
        let address = service.held_address();

        if let Some(ip) = address {
            self.allocator.release(ip).await?;
        }

        if let Err(error) = self
            .services
            .delete(namespace, name, service.resource_version().as_deref())
            .await
        {
            return Err(match error {
                // a concurrent delete won, the address went with its record
                StorageError::NotFound => RegistryError::NotFound(object_ref(&service)),
                error => {
                    self.reclaim(address, &service).await;
                    RegistryError::ObjectWrite(error)
                }
            });
        }

        info!("Deleted service {}", object_ref(&service));

        Ok(service)
    }

    /// Updates the service, moving it to another address when its addressing changed.
    ///
    /// An empty `clusterIp` keeps the current address, or allocates one for a service
    /// that has none. The write is conditional on the given resource version, or on the
    /// one just read when none is given.
    pub async fn update(
        &self,
        context: &RequestContext,
        service: &VirtualService,
    ) -> Result<VirtualService, RegistryError> {
        let namespace = context.resolve_namespace(service.metadata.namespace.as_deref())?;
        let name = service.require_name_or(RegistryError::MissingObjectMetadata("name"))?;
        let current = self
            .get(&RequestContext::namespaced(namespace.to_owned()), name)
            .await?;

        let mut service = service.clone();
        service.metadata.namespace = Some(namespace.to_owned());
        if service.metadata.resource_version.is_none() {
            service.metadata.resource_version = current.metadata.resource_version.clone();
        }

        let old = current.held_address();
        let requested = match (addressing(&service)?, old) {
            (Addressing::Allocate, Some(ip)) => Addressing::Static(ip),
            (requested, _) => requested,
        };

        let unchanged = match requested {
            Addressing::Static(ip) => old == Some(ip),
            Addressing::Headless => old.is_none(),
            Addressing::Allocate => false,
        };

        if unchanged {
            service.spec.set_address(old);
            return self.write_update(&namespace, &service).await;
        }

        if let Some(ip) = old {
            self.allocator.release(ip).await?;
        }

        let allocated = match requested {
            Addressing::Headless => Ok(None),
            Addressing::Allocate => self.allocator.allocate_next().await.map(Some),
            Addressing::Static(ip) => self.allocator.allocate(ip).await.map(|()| Some(ip)),
        };

        let new = match allocated {
            Ok(new) => new,
            Err(error) => {
                self.reclaim(old, &current).await;
                return Err(error.into());
            }
        };

        service.spec.set_address(new);

        match self.write_update(&namespace, &service).await {
            Ok(updated) => Ok(updated),
            Err(error) => {
                if let Some(ip) = new {
                    self.release_quietly(ip, &service).await;
                }
                self.reclaim(old, &current).await;

                Err(error)
            }
        }
    }

    /// Service changes matching both selectors, resumed after `resource_version` when
    /// one is given.
    pub async fn watch(
        &self,
        context: &RequestContext,
        label_selector: &str,
        field_selector: &str,
        resource_version: Option<&str>,
    ) -> Result<WatchStream<VirtualService>, RegistryError> {
        let labels = label_selector
            .parse::<LabelSelector>()
            .map_err(RegistryError::InvalidSelector)?;
        let fields = field_selector
            .parse::<FieldSelector>()
            .map_err(RegistryError::InvalidSelector)?;

        let events = self
            .services
            .watch(context.namespace(), resource_version)
            .await
            .map_err(RegistryError::Watch)?;

        Ok(events
            .filter(move |event| {
                ready(match event {
                    Ok(event) => {
                        labels.matches(event.object().labels()) && fields.matches(event.object())
                    }
                    Err(_) => true,
                })
            })
            .boxed())
    }

    async fn write_update(
        &self,
        namespace: &str,
        service: &VirtualService,
    ) -> Result<VirtualService, RegistryError> {
        let updated = self
            .services
            .update(namespace, service)
            .await
            .map_err(|error| match error {
                StorageError::NotFound => RegistryError::NotFound(object_ref(service)),
                error => RegistryError::ObjectWrite(error),
            })?;

        info!("Updated service {}", object_ref(&updated));

        Ok(updated)
    }

    async fn release_quietly(&self, ip: IpAddr, service: &VirtualService) {
        if let Err(error) = self.allocator.release(ip).await {
            warn!(
                "Couldn't release {ip} of {} after a failed write, it stays allocated until repaired! {error}",
                object_ref(service)
            );
        }
    }

    async fn reclaim(&self, ip: Option<IpAddr>, service: &VirtualService) {
        let Some(ip) = ip else {
            return;
        };

        if let Err(error) = self.allocator.allocate(ip).await {
            warn!(
                "Couldn't re-claim {ip} for {}, the service now holds an unallocated address! {error}",
                object_ref(service)
            );
        }
    }
}

fn addressing(service: &VirtualService) -> Result<Addressing, RegistryError> {
    service.spec.addressing().map_err(|error| {
        RegistryError::InvalidObjectData(format!(
            "clusterIp '{}' is not an address ({error})",
            service.spec.cluster_ip.as_deref().unwrap_or_default()
        ))
    })
}
