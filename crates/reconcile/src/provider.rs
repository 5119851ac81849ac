//! Provider adapter interface and registry
//!
//! A provider performs the actual create/read/update/delete calls for one or
//! more resource types. Per-type behavior (force-replace attributes,
//! create-before-destroy, timeouts, retries) is declared in a
//! [`ResourceTypeSchema`] next to the provider rather than in engine code.

use crate::error::{ProviderError, ValidationError};
use crate::model::{Attributes, ResourceKey, ResourceSet};
use crate::retry::RetryPolicy;
use crate::state::StateDocument;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default timeout for a single provider call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// A resource whose references have all been substituted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResource {
    pub key: ResourceKey,
    pub attributes: Attributes,
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    /// Identifier the provider assigned to the new object
    pub provider_id: String,
    /// Attributes as reported by the provider, including computed ones
    pub attributes: Attributes,
}

/// Adapter for one or more resource types.
///
/// Calls may run concurrently from several worker threads.
pub trait Provider: Send + Sync {
    /// Create the remote object.
    fn create(&self, resource: &ResolvedResource) -> Result<Created, ProviderError>;

    /// Update the remote object in place and return its new attributes.
    ///
    /// `old` holds the inputs that were last applied.
    fn update(
        &self,
        resource: &ResolvedResource,
        provider_id: &str,
        old: &Attributes,
    ) -> Result<Attributes, ProviderError>;

    /// Delete the remote object. `NotFound` is treated as already deleted.
    fn delete(&self, key: &ResourceKey, provider_id: &str) -> Result<(), ProviderError>;

    /// Read the remote object. `None` means it no longer exists.
    fn read(&self, key: &ResourceKey, provider_id: &str) -> Result<Option<Attributes>, ProviderError>;
}

/// Per-type behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceTypeSchema {
    /// Attributes whose change requires delete + create
    pub force_replace: BTreeSet<String>,
    /// Create the replacement before deleting the old object
    pub create_before_destroy: bool,
    /// Timeout for each provider call
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ResourceTypeSchema {
    fn default() -> Self {
        Self {
            force_replace: BTreeSet::new(),
            create_before_destroy: false,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl ResourceTypeSchema {
    pub fn force_replace<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.force_replace = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn create_before_destroy(mut self, enabled: bool) -> Self {
        self.create_before_destroy = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The subset of `changed` that forces a replacement.
    pub fn forces_replace(&self, changed: &[String]) -> Vec<String> {
        changed
            .iter()
            .filter(|name| self.force_replace.contains(*name))
            .cloned()
            .collect()
    }
}

struct Registration {
    provider: Arc<dyn Provider>,
    schema: ResourceTypeSchema,
}

/// Closed mapping of resource type to provider and schema.
///
/// Built once up front; the engine never adds types at runtime.
#[derive(Default)]
pub struct ProviderRegistry {
    types: BTreeMap<String, Registration>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` for `resource_type`.
    pub fn with_type(
        mut self,
        resource_type: impl Into<String>,
        provider: Arc<dyn Provider>,
        schema: ResourceTypeSchema,
    ) -> Self {
        self.types
            .insert(resource_type.into(), Registration { provider, schema });
        self
    }

    pub fn provider(&self, resource_type: &str) -> Option<&Arc<dyn Provider>> {
        self.types.get(resource_type).map(|r| &r.provider)
    }

    pub fn schema(&self, resource_type: &str) -> Option<&ResourceTypeSchema> {
        self.types.get(resource_type).map(|r| &r.schema)
    }

    /// Schema for `key`'s type, or the defaults for an unknown type.
    pub fn schema_or_default(&self, key: &ResourceKey) -> ResourceTypeSchema {
        self.schema(key.resource_type()).cloned().unwrap_or_default()
    }

    pub fn contains(&self, resource_type: &str) -> bool {
        self.types.contains_key(resource_type)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Provider for `key`, failing on an unregistered type.
    pub fn provider_for(&self, key: &ResourceKey) -> Result<&Arc<dyn Provider>, ValidationError> {
        self.provider(key.resource_type())
            .ok_or_else(|| ValidationError::UnknownResourceType {
                key: key.clone(),
                resource_type: key.resource_type().to_string(),
            })
    }

    /// Every resource in the model and in state must have a provider.
    pub fn validate(&self, model: &ResourceSet, state: &StateDocument) -> Result<(), ValidationError> {
        for key in model.keys().chain(state.resources.keys()) {
            self.provider_for(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;
    use crate::model::Resource;

    #[test]
    fn test_registry_lookup() {
        let registry = ProviderRegistry::new().with_type(
            "network",
            Arc::new(MemoryProvider::new()),
            ResourceTypeSchema::default().force_replace(["cidr"]),
        );

        assert!(registry.contains("network"));
        assert!(registry.provider("subnet").is_none());
        assert_eq!(
            registry.schema("network").unwrap().forces_replace(&["cidr".to_string(), "name".to_string()]),
            vec!["cidr".to_string()]
        );
        assert_eq!(registry.schema_or_default(&ResourceKey::new("subnet", "a")).timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_validate_rejects_unknown_type() {
        let registry = ProviderRegistry::new().with_type(
            "network",
            Arc::new(MemoryProvider::new()),
            ResourceTypeSchema::default(),
        );
        let model = ResourceSet::from_resources([
            Resource::new(ResourceKey::new("network", "vpc1")),
            Resource::new(ResourceKey::new("dns", "zone")),
        ])
        .unwrap();

        let err = registry.validate(&model, &StateDocument::new()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownResourceType {
                key: ResourceKey::new("dns", "zone"),
                resource_type: "dns".to_string(),
            }
        );
    }
}
