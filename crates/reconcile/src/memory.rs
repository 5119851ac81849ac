//! In-process provider
//!
//! Keeps remote objects in memory. Used by the test suite and by anything
//! that wants to exercise the engine without real infrastructure. Failures
//! and drift can be injected per resource.

use crate::error::ProviderError;
use crate::model::{Attributes, ResourceKey};
use crate::provider::{Created, Provider, ResolvedResource};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Provider operations, for failure injection and call inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Read,
}

/// A call recorded by the provider, in the order it was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub key: ResourceKey,
    pub operation: Operation,
}

/// A stored remote object.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    pub key: ResourceKey,
    pub attributes: Attributes,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, RemoteObject>,
    counters: BTreeMap<String, u64>,
    failures: BTreeMap<(ResourceKey, Operation), VecDeque<ProviderError>>,
    delays: BTreeMap<ResourceKey, Duration>,
    calls: Vec<Call>,
}

/// Provider backed by an in-memory map of `provider_id -> object`.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every mutating call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep this long inside every mutating call for `key`.
    pub fn delay_for(&self, key: &ResourceKey, delay: Duration) {
        self.lock().delays.insert(key.clone(), delay);
    }

    /// Fail the next `operation` on `key` with `error`.
    ///
    /// Several injected failures for the same call are returned in order.
    pub fn fail_next(&self, key: &ResourceKey, operation: Operation, error: ProviderError) {
        self.lock()
            .failures
            .entry((key.clone(), operation))
            .or_default()
            .push_back(error);
    }

    /// Change a remote object's attributes behind the engine's back.
    pub fn set_remote(&self, provider_id: &str, attribute: &str, value: serde_json::Value) -> bool {
        let mut inner = self.lock();
        match inner.objects.get_mut(provider_id) {
            Some(object) => {
                object.attributes.insert(attribute.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Delete a remote object behind the engine's back.
    pub fn remove_remote(&self, provider_id: &str) -> Option<RemoteObject> {
        self.lock().objects.remove(provider_id)
    }

    pub fn object(&self, provider_id: &str) -> Option<RemoteObject> {
        self.lock().objects.get(provider_id).cloned()
    }

    /// Provider id of the live object for `key`, if exactly one exists.
    pub fn id_of(&self, key: &ResourceKey) -> Option<String> {
        let inner = self.lock();
        let mut ids = inner
            .objects
            .iter()
            .filter(|(_, object)| &object.key == key)
            .map(|(id, _)| id.clone());
        let id = ids.next()?;
        ids.next().is_none().then_some(id)
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Mutating calls only (create, update, delete).
    pub fn mutations(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation != Operation::Read)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Highest number of concurrent mutating calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the call and return an injected failure, if any.
    fn begin(&self, key: &ResourceKey, operation: Operation) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        inner.calls.push(Call {
            key: key.clone(),
            operation,
        });
        match inner
            .failures
            .get_mut(&(key.clone(), operation))
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Run a mutating call while tracking concurrency and applying delays.
    fn mutate<T>(
        &self,
        key: &ResourceKey,
        operation: Operation,
        apply: impl FnOnce(&mut Inner) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = self.lock().delays.get(key).copied().or(self.delay);
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let result = self
            .begin(key, operation)
            .and_then(|()| apply(&mut self.lock()));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn not_found(key: &ResourceKey, provider_id: &str) -> ProviderError {
    ProviderError::NotFound {
        message: format!("{key} ({provider_id})"),
    }
}

impl Provider for MemoryProvider {
    fn create(&self, resource: &ResolvedResource) -> Result<Created, ProviderError> {
        self.mutate(&resource.key, Operation::Create, |inner| {
            let resource_type = resource.key.resource_type().to_string();
            let counter = inner.counters.entry(resource_type.clone()).or_insert(0);
            *counter += 1;
            let provider_id = format!("{resource_type}-{counter}");

            let mut attributes = resource.attributes.clone();
            attributes.insert("id".to_string(), serde_json::Value::String(provider_id.clone()));
            inner.objects.insert(
                provider_id.clone(),
                RemoteObject {
                    key: resource.key.clone(),
                    attributes: attributes.clone(),
                },
            );
            Ok(Created {
                provider_id,
                attributes,
            })
        })
    }

    fn update(
        &self,
        resource: &ResolvedResource,
        provider_id: &str,
        _old: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        self.mutate(&resource.key, Operation::Update, |inner| {
            let object = inner
                .objects
                .get_mut(provider_id)
                .ok_or_else(|| not_found(&resource.key, provider_id))?;
            let mut attributes = resource.attributes.clone();
            attributes.insert("id".to_string(), serde_json::Value::String(provider_id.to_string()));
            object.attributes = attributes.clone();
            Ok(attributes)
        })
    }

    fn delete(&self, key: &ResourceKey, provider_id: &str) -> Result<(), ProviderError> {
        self.mutate(key, Operation::Delete, |inner| {
            inner
                .objects
                .remove(provider_id)
                .map(|_| ())
                .ok_or_else(|| not_found(key, provider_id))
        })
    }

    fn read(&self, key: &ResourceKey, provider_id: &str) -> Result<Option<Attributes>, ProviderError> {
        self.begin(key, Operation::Read)?;
        Ok(self
            .lock()
            .objects
            .get(provider_id)
            .map(|object| object.attributes.clone()))
    }
}
