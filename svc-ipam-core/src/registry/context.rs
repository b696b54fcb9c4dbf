use super::RegistryError;

/// Who a registry call is made on behalf of, reduced to the namespace it's scoped to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    namespace: Option<String>,
}

impl RequestContext {
    pub fn namespaced(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
        }
    }

    /// Spans every namespace, only valid for list and watch.
    pub fn all() -> Self {
        Self { namespace: None }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn require_namespace(&self) -> Result<&str, RegistryError> {
        self.namespace().ok_or(RegistryError::MissingNamespace)
    }

    /// Namespace the object belongs to, an object naming another namespace than the
    /// context is refused.
    pub fn resolve_namespace(&self, object_namespace: Option<&str>) -> Result<String, RegistryError> {
        match (self.namespace(), object_namespace) {
            (Some(context), Some(object)) if context != object => {
                Err(RegistryError::NamespaceMismatch {
                    context: context.to_owned(),
                    object: object.to_owned(),
                })
            }
            (Some(namespace), _) | (None, Some(namespace)) => Ok(namespace.to_owned()),
            (None, None) => Err(RegistryError::MissingNamespace),
        }
    }
}
