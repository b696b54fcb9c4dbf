use thiserror::Error;

use crate::{
    allocation::AllocationError,
    storage::{selector::SelectorError, StorageError},
};

/// Registry failures, named after the step that failed.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Service {} doesn't exist!", .0)]
    NotFound(String),
    #[error("Service {} already exists!", .0)]
    AlreadyExists(String),
    #[error("Service is missing its {}!", .0)]
    MissingObjectMetadata(&'static str),
    #[error("No namespace was given!")]
    MissingNamespace,
    #[error("Service belongs to namespace {}, but the request was made in {}!", .object, .context)]
    NamespaceMismatch { context: String, object: String },
    #[error("Service data is invalid! Details: {}", .0)]
    InvalidObjectData(String),
    #[error("Invalid selector! Details: {}", .0)]
    InvalidSelector(SelectorError),
    #[error("Couldn't allocate the service address! Details: {}", .0)]
    Allocation(AllocationError),
    #[error("Couldn't read the service! Reason: {}", .0)]
    ObjectRead(StorageError),
    #[error("Couldn't write the service! Reason: {}", .0)]
    ObjectWrite(StorageError),
    #[error("Couldn't watch services! Reason: {}", .0)]
    Watch(StorageError),
}

impl RegistryError {
    /// The pool has no address to give right now, see [`AllocationError::is_unavailable`].
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RegistryError::Allocation(error) if error.is_unavailable())
    }
}

impl From<AllocationError> for RegistryError {
    fn from(error: AllocationError) -> Self {
        RegistryError::Allocation(error)
    }
}
