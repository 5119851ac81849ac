//! Engine facade - lock, validate, plan and apply in one place

use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::lock::{LockGuard, LockManager, default_owner_id};
use crate::model::ResourceSet;
use crate::plan::{Plan, PlanMode};
use crate::progress::{NoProgress, ProgressCallback};
use crate::provider::ProviderRegistry;
use crate::refresh::{RefreshReport, refresh};
use crate::scheduler::{ApplyReport, CancelToken, FailurePolicy, Scheduler, SchedulerOptions};
use crate::state::StateStore;
use std::time::Duration;

/// Options for plan and apply runs.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum concurrent provider calls
    pub workers: usize,
    pub failure_policy: FailurePolicy,
    pub heartbeat_interval: Duration,
    /// Identity written to lock files
    pub owner_id: String,
    /// Check for drift before planning
    pub refresh: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let scheduler = SchedulerOptions::default();
        Self {
            workers: scheduler.workers,
            failure_policy: scheduler.failure_policy,
            heartbeat_interval: scheduler.heartbeat_interval,
            owner_id: default_owner_id(),
            refresh: false,
        }
    }
}

impl EngineOptions {
    fn scheduler(&self) -> SchedulerOptions {
        SchedulerOptions {
            workers: self.workers,
            failure_policy: self.failure_policy,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

/// Ties a provider registry, a state store and its locks together.
pub struct Engine {
    registry: ProviderRegistry,
    state: StateStore,
    locks: LockManager,
    options: EngineOptions,
    cancel: CancelToken,
}

impl Engine {
    pub fn new(registry: ProviderRegistry, state: StateStore, locks: LockManager) -> Self {
        Self {
            registry,
            state,
            locks,
            options: EngineOptions::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Token that stops an in-progress apply from scheduling new actions.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Check the model without planning: references, cycles, provider
    /// coverage.
    pub fn validate(&self, model: &ResourceSet) -> Result<()> {
        DependencyGraph::build(model)?;
        self.registry.validate(model, &self.state.snapshot())?;
        Ok(())
    }

    /// Compute a plan under a shared lock.
    pub fn plan(&self, model: &ResourceSet, mode: PlanMode) -> Result<Plan> {
        if self.options.refresh {
            self.refresh()?;
        }

        let guard = self.locks.acquire_shared(&self.options.owner_id)?;
        let result = self.plan_locked(model, mode);
        release(&guard);
        result
    }

    /// Plan and apply while holding the exclusive lock throughout.
    pub fn apply(&self, model: &ResourceSet, mode: PlanMode) -> Result<ApplyReport> {
        self.apply_with_progress(model, mode, &mut NoProgress)
    }

    pub fn apply_with_progress(
        &self,
        model: &ResourceSet,
        mode: PlanMode,
        progress: &mut dyn ProgressCallback,
    ) -> Result<ApplyReport> {
        let guard = self.locks.acquire(&self.options.owner_id)?;
        let result = self.state.reload().and_then(|()| {
            if self.options.refresh {
                refresh(&self.state, &self.registry, &guard)?;
            }
            let plan = self.plan_locked(model, mode)?;
            self.execute(plan, &guard, progress)
        });
        release(&guard);
        result
    }

    /// Apply a previously saved plan.
    ///
    /// Fails with a conflict if the state changed since the plan was made.
    pub fn apply_plan(&self, plan: Plan, progress: &mut dyn ProgressCallback) -> Result<ApplyReport> {
        let guard = self.locks.acquire(&self.options.owner_id)?;
        let result = self.state.reload().and_then(|()| {
            plan.verify_against(&self.state.snapshot())?;
            self.execute(plan, &guard, progress)
        });
        release(&guard);
        result
    }

    /// Detect drift under the exclusive lock.
    pub fn refresh(&self) -> Result<RefreshReport> {
        let guard = self.locks.acquire(&self.options.owner_id)?;
        let result = self
            .state
            .reload()
            .and_then(|()| refresh(&self.state, &self.registry, &guard));
        release(&guard);
        result
    }

    fn plan_locked(&self, model: &ResourceSet, mode: PlanMode) -> Result<Plan> {
        self.state.reload()?;
        let plan = Plan::generate(model, &self.state.snapshot(), &self.registry, mode)?;
        Ok(plan)
    }

    fn execute(
        &self,
        plan: Plan,
        guard: &LockGuard,
        progress: &mut dyn ProgressCallback,
    ) -> Result<ApplyReport> {
        Scheduler::new(&self.registry, &self.state, guard)
            .with_options(self.options.scheduler())
            .with_cancel_token(self.cancel.clone())
            .execute(plan, progress)
    }
}

fn release(guard: &LockGuard) {
    if let Err(e) = guard.release() {
        log::warn!("Failed to release state lock: {e}");
    }
}
