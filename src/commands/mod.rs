pub mod apply;
pub mod lock;
pub mod plan;
pub mod refresh;
pub mod state;

use anyhow::{Context as AnyhowContext, Result};
use reconcile::{Engine, LockManager, MemoryProvider, Provider, ProviderRegistry, ResourceSet, StateStore};
use std::path::Path;
use std::sync::Arc;

use crate::Context;
use crate::config::ProviderKind;
use crate::local::LocalProvider;

/// Registry with the configured provider for every type listed in the config.
pub fn registry(ctx: &Context) -> ProviderRegistry {
    let provider: Arc<dyn Provider> = match ctx.config.provider {
        ProviderKind::Local => Arc::new(LocalProvider::new(ctx.config.sandbox_dir())),
        ProviderKind::Memory => {
            log::warn!("Using the in-memory provider; created objects do not outlive this command");
            Arc::new(MemoryProvider::new())
        }
    };
    let mut registry = ProviderRegistry::new();
    for (resource_type, type_config) in &ctx.config.types {
        registry = registry.with_type(resource_type.clone(), provider.clone(), type_config.schema());
    }
    if ctx.config.types.is_empty() {
        log::warn!("No resource types are configured; add [types.<name>] sections to converge.toml");
    }
    registry
}

pub fn lock_manager(ctx: &Context) -> LockManager {
    LockManager::for_state(&ctx.config.state_path(), ctx.config.lock_staleness())
}

pub fn open_state(ctx: &Context) -> Result<StateStore> {
    let path = ctx.config.state_path();
    StateStore::open(&path).with_context(|| format!("Could not open state {}", path.display()))
}

pub fn open_engine(ctx: &Context) -> Result<Engine> {
    let engine = Engine::new(registry(ctx), open_state(ctx)?, lock_manager(ctx))
        .with_options(ctx.config.engine_options());
    Ok(engine)
}

pub fn load_definitions(dir: &Path) -> Result<ResourceSet> {
    let model = reconcile::load_path(dir)
        .with_context(|| format!("Could not load definitions from {}", dir.display()))?;
    log::info!("Loaded {} resources from {}", model.len(), dir.display());
    Ok(model)
}

pub fn validate(ctx: &Context, dir: &Path) -> Result<()> {
    let model = load_definitions(dir)?;
    let engine = open_engine(ctx)?;
    engine.validate(&model)?;
    if !ctx.quiet {
        crate::ui::success(&format!("{} resources are valid", model.len()));
    }
    Ok(())
}
