#![allow(dead_code)]

use reconcile::{
    Engine, EngineOptions, LockManager, MemoryProvider, ProviderRegistry, Resource, ResourceKey,
    ResourceSet, ResourceTypeSchema, StateStore,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub provider: Arc<MemoryProvider>,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(MemoryProvider::new(), &[], EngineOptions::default())
    }

    pub fn with_schemas(schemas: &[(&str, ResourceTypeSchema)]) -> Self {
        Self::with(MemoryProvider::new(), schemas, EngineOptions::default())
    }

    /// Registers `network`, `subnet` and `app`, overriding the schema of any
    /// type listed in `schemas`.
    pub fn with(
        provider: MemoryProvider,
        schemas: &[(&str, ResourceTypeSchema)],
        options: EngineOptions,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(provider);

        let mut registry = ProviderRegistry::new();
        for resource_type in ["network", "subnet", "app"] {
            let schema = schemas
                .iter()
                .find(|(t, _)| *t == resource_type)
                .map(|(_, s)| s.clone())
                .unwrap_or_default();
            registry = registry.with_type(resource_type, provider.clone(), schema);
        }

        let state_path = dir.path().join("state.json");
        let state = StateStore::open(&state_path).unwrap();
        let locks = LockManager::for_state(&state_path, Duration::from_secs(60));
        let options = EngineOptions {
            owner_id: "test-runner".to_string(),
            ..options
        };
        let engine = Engine::new(registry, state, locks).with_options(options);

        Self {
            dir,
            provider,
            engine,
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.path().join("state.json")
    }

    pub fn locks(&self) -> LockManager {
        LockManager::for_state(&self.state_path(), Duration::from_secs(60))
    }
}

pub fn key(s: &str) -> ResourceKey {
    s.parse().unwrap()
}

/// `network.vpc1` plus `subnet.sub1` referencing the vpc's id.
pub fn vpc_and_subnet() -> ResourceSet {
    ResourceSet::from_resources([
        Resource::new(key("network.vpc1")).with("cidr", json!("10.0.0.0/16")),
        Resource::new(key("subnet.sub1"))
            .with("vpc_id", key("network.vpc1").attr("id"))
            .with("cidr", json!("10.0.1.0/24")),
    ])
    .unwrap()
}

pub fn with_vpc_cidr(cidr: &str) -> ResourceSet {
    ResourceSet::from_resources([
        Resource::new(key("network.vpc1")).with("cidr", json!(cidr)),
        Resource::new(key("subnet.sub1"))
            .with("vpc_id", key("network.vpc1").attr("id"))
            .with("cidr", json!("10.0.1.0/24")),
    ])
    .unwrap()
}
