//! Execution scheduler - runs a plan on a bounded worker pool
//!
//! Each action tracks how many of its prerequisites are still unmet. When
//! the count reaches zero the action becomes ready, and ready actions are
//! handed to a fixed rayon pool in plan-index order. Workers report back
//! over a channel; the driving thread owns all bookkeeping, heartbeats the
//! lock while it waits, and reports progress.

use crate::error::{ErrorCategory, ProviderError, Result};
use crate::hash::attribute_hash;
use crate::lock::LockGuard;
use crate::model::{Attributes, ResourceKey};
use crate::plan::{ActionKind, Plan, PlanAction};
use crate::progress::ProgressCallback;
use crate::provider::{Provider, ProviderRegistry, ResolvedResource, ResourceTypeSchema};
use crate::resolve::{complete, known};
use crate::retry::with_retry;
use crate::state::{StateRecord, StateStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// What to do with independent work once an action has failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Start nothing new; let running actions finish
    #[default]
    FailFast,
    /// Keep running actions that do not depend on a failure
    ContinueIndependent,
}

/// Cooperative cancellation flag shared with the scheduler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop scheduling new actions. In-flight actions still finish.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum concurrent provider calls
    pub workers: usize,
    pub failure_policy: FailurePolicy,
    /// How often to refresh the lock while actions run
    pub heartbeat_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            failure_policy: FailurePolicy::FailFast,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Why an action never ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A prerequisite (directly or transitively) failed
    DependencyFailed { key: ResourceKey },
    /// Another action failed under the fail-fast policy
    Halted,
    Cancelled,
    /// The state lock could no longer be refreshed
    LockLost,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyFailed { key } => write!(f, "dependency {key} failed"),
            Self::Halted => write!(f, "halted after an earlier failure"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::LockLost => write!(f, "state lock lost"),
        }
    }
}

/// Terminal state of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded {
        /// False when the action turned out to be a no-op at execution
        provider_called: bool,
    },
    Failed {
        error: String,
        category: ErrorCategory,
        /// The resource was marked tainted in state
        tainted: bool,
    },
    Skipped {
        reason: SkipReason,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

/// Result of one plan action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    pub index: usize,
    pub key: ResourceKey,
    pub kind: ActionKind,
    pub replacement: bool,
    pub outcome: Outcome,
    /// Provider attempts made, including retries
    pub attempts: u32,
    pub duration: Duration,
}

/// Counts by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// NoOp actions
    pub unchanged: usize,
}

impl fmt::Display for ApplySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded, self.failed, self.skipped
        )
    }
}

/// Outcome of an apply, one report per plan action in index order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub actions: Vec<ActionReport>,
    pub duration: Duration,
}

impl ApplyReport {
    pub fn summary(&self) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for report in &self.actions {
            match &report.outcome {
                Outcome::Succeeded { .. } if report.kind == ActionKind::NoOp => {
                    summary.unchanged += 1;
                }
                Outcome::Succeeded { .. } => summary.succeeded += 1,
                Outcome::Failed { .. } => summary.failed += 1,
                Outcome::Skipped { .. } => summary.skipped += 1,
            }
        }
        summary
    }

    /// Every action succeeded.
    pub fn is_success(&self) -> bool {
        self.actions.iter().all(|r| r.outcome.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ActionReport> {
        self.actions.iter().filter(|r| r.outcome.is_failure())
    }

    pub fn get(&self, key: &ResourceKey, kind: ActionKind) -> Option<&ActionReport> {
        self.actions.iter().find(|r| &r.key == key && r.kind == kind)
    }
}

/// Executes plans against the providers of a registry.
pub struct Scheduler<'a> {
    registry: &'a ProviderRegistry,
    state: &'a StateStore,
    guard: &'a LockGuard,
    options: SchedulerOptions,
    cancel: CancelToken,
}

impl<'a> Scheduler<'a> {
    /// `guard` must be the exclusive lock for `state`.
    pub fn new(registry: &'a ProviderRegistry, state: &'a StateStore, guard: &'a LockGuard) -> Self {
        Self {
            registry,
            state,
            guard,
            options: SchedulerOptions::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every action of `plan`.
    ///
    /// Provider failures are reported per action; an `Err` means the run
    /// could not start at all (lock not held, worker pool unavailable).
    pub fn execute(&self, plan: Plan, progress: &mut dyn ProgressCallback) -> Result<ApplyReport> {
        self.guard.ensure_exclusive()?;

        let workers = self.options.workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("converge-worker-{i}"))
            .build()?;

        let started = Instant::now();
        let actions = plan.actions;
        progress.on_apply_start(actions.len());
        log::info!(
            "Applying {} actions with {workers} workers",
            actions.iter().filter(|a| a.kind.is_change()).count()
        );

        let mut run = Run::new(&actions);
        let (tx, rx) = mpsc::channel::<ActionReport>();
        let mut last_heartbeat = Instant::now();

        pool.in_place_scope(|scope| {
            loop {
                if run.halt.is_none() && self.cancel.is_cancelled() {
                    log::warn!("Apply cancelled; waiting for {} running actions", run.running);
                    run.halt = Some(SkipReason::Cancelled);
                }

                while run.halt.is_none() {
                    let next = run
                        .ready
                        .iter()
                        .copied()
                        .find(|&i| actions[i].kind == ActionKind::NoOp || run.running < workers);
                    let Some(i) = next else { break };
                    run.ready.remove(&i);

                    let action = &actions[i];
                    if action.kind == ActionKind::NoOp {
                        let report = report(action, Outcome::Succeeded { provider_called: false }, 0, Duration::ZERO);
                        run.complete(report, &actions, self.options.failure_policy, progress);
                        continue;
                    }

                    progress.on_action_start(action);
                    run.running += 1;
                    let tx = tx.clone();
                    scope.spawn(move |_| {
                        let report = self.run_action(action);
                        let _ = tx.send(report);
                    });
                }

                if run.running == 0 {
                    break;
                }

                match rx.recv_timeout(self.options.heartbeat_interval) {
                    Ok(report) => {
                        run.running -= 1;
                        run.complete(report, &actions, self.options.failure_policy, progress);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                if last_heartbeat.elapsed() >= self.options.heartbeat_interval {
                    last_heartbeat = Instant::now();
                    if let Err(e) = self.guard.heartbeat() {
                        log::error!("Failed to refresh state lock: {e}");
                        run.halt = Some(SkipReason::LockLost);
                    }
                }
            }
        });

        let leftover = run.halt.clone().unwrap_or(SkipReason::Halted);
        for action in &actions {
            if run.reports[action.index].is_none() {
                let skipped = report(action, Outcome::Skipped { reason: leftover.clone() }, 0, Duration::ZERO);
                run.record(skipped, progress);
            }
        }

        let report = ApplyReport {
            actions: run.reports.into_iter().flatten().collect(),
            duration: started.elapsed(),
        };
        progress.on_apply_complete(&report);
        log::info!("Apply finished: {}", report.summary());
        Ok(report)
    }

    /// Perform one action on a worker thread.
    fn run_action(&self, action: &PlanAction) -> ActionReport {
        let started = Instant::now();
        log::info!("{} {}", verb(action.kind), action.key);

        let (outcome, attempts) = match action.kind {
            ActionKind::Create => self.create(action),
            ActionKind::Update => self.update(action),
            ActionKind::Delete => self.delete(action),
            ActionKind::NoOp => (Outcome::Succeeded { provider_called: false }, 0),
        };

        match &outcome {
            Outcome::Succeeded { provider_called: true } => {
                log::info!("{} {} finished", verb(action.kind), action.key);
            }
            Outcome::Succeeded { provider_called: false } => {
                log::info!("{} is already up to date", action.key);
            }
            Outcome::Failed { error, .. } => {
                log::error!("{} {} failed: {error}", verb(action.kind), action.key);
            }
            Outcome::Skipped { .. } => {}
        }
        report(action, outcome, attempts, started.elapsed())
    }

    fn create(&self, action: &PlanAction) -> (Outcome, u32) {
        let key = &action.key;
        let (provider, schema) = match self.provider(key) {
            Ok(found) => found,
            Err(outcome) => return (outcome, 0),
        };
        let inputs = match self.resolve(action) {
            Ok(inputs) => inputs,
            Err(outcome) => return (outcome, 0),
        };
        let hash = attribute_hash(&known(&inputs));

        let resource = ResolvedResource {
            key: key.clone(),
            attributes: inputs.clone(),
        };
        let attempted = with_retry(&schema.retry, key, || {
            let resource = resource.clone();
            call_with_timeout(key, schema.timeout, provider.clone(), move |p| p.create(&resource))
        });

        let outcome = match attempted.result {
            Ok(created) => {
                let record = StateRecord {
                    provider_id: created.provider_id,
                    attribute_hash: hash,
                    attributes: created.attributes,
                    inputs,
                    dependencies: action.dependencies.clone(),
                    tainted: false,
                    drift: None,
                    deposed: Vec::new(),
                    updated_at: Utc::now(),
                };
                self.commit(key, |state, guard| state.record_applied(guard, key, record))
            }
            Err(error) => {
                let tainted = if let ProviderError::Indeterminate {
                    provider_id: Some(provider_id),
                    ..
                } = &error
                {
                    self.record_partial_create(action, provider_id, &hash, &inputs)
                } else {
                    if error.taints() {
                        log::warn!(
                            "{key}: create {}; a remote object may exist that is not tracked in state",
                            error.category()
                        );
                    }
                    false
                };
                failed(&error, tainted)
            }
        };
        (outcome, attempted.attempts)
    }

    fn update(&self, action: &PlanAction) -> (Outcome, u32) {
        let key = &action.key;
        let inputs = match self.resolve(action) {
            Ok(inputs) => inputs,
            Err(outcome) => return (outcome, 0),
        };
        let hash = attribute_hash(&known(&inputs));

        let current = self.state.record(key);
        if let Some(record) = &current
            && record.attribute_hash == hash
            && !record.tainted
            && record.drift.is_none()
        {
            // Unknown inputs resolved to what was already applied.
            return (Outcome::Succeeded { provider_called: false }, 0);
        }

        let Some(provider_id) = action
            .provider_id
            .clone()
            .or_else(|| current.as_ref().map(|r| r.provider_id.clone()))
        else {
            return (
                failed(
                    &ProviderError::NotFound {
                        message: format!("{key} has no recorded remote object to update"),
                    },
                    false,
                ),
                0,
            );
        };
        let (provider, schema) = match self.provider(key) {
            Ok(found) => found,
            Err(outcome) => return (outcome, 0),
        };

        let resource = ResolvedResource {
            key: key.clone(),
            attributes: inputs.clone(),
        };
        let old = action.old.clone().unwrap_or_default();
        let attempted = with_retry(&schema.retry, key, || {
            let resource = resource.clone();
            let provider_id = provider_id.clone();
            let old = old.clone();
            call_with_timeout(key, schema.timeout, provider.clone(), move |p| {
                p.update(&resource, &provider_id, &old)
            })
        });

        let outcome = match attempted.result {
            Ok(attributes) => {
                let record = StateRecord {
                    provider_id: provider_id.clone(),
                    attribute_hash: hash,
                    attributes,
                    inputs,
                    dependencies: action.dependencies.clone(),
                    tainted: false,
                    drift: None,
                    deposed: Vec::new(),
                    updated_at: Utc::now(),
                };
                self.commit(key, |state, guard| state.record_applied(guard, key, record))
            }
            Err(error) => {
                let tainted = error.taints() && self.taint(key, &provider_id);
                failed(&error, tainted)
            }
        };
        (outcome, attempted.attempts)
    }

    fn delete(&self, action: &PlanAction) -> (Outcome, u32) {
        let key = &action.key;
        let Some(provider_id) = action.provider_id.clone() else {
            let outcome = self.commit(key, |state, guard| state.record_deleted(guard, key, None));
            return (outcome, 0);
        };
        let (provider, schema) = match self.provider(key) {
            Ok(found) => found,
            Err(outcome) => return (outcome, 0),
        };

        let attempted = with_retry(&schema.retry, key, || {
            let target = key.clone();
            let provider_id = provider_id.clone();
            call_with_timeout(key, schema.timeout, provider.clone(), move |p| {
                p.delete(&target, &provider_id)
            })
        });

        let outcome = match attempted.result {
            Ok(()) => self.commit(key, |state, guard| {
                state.record_deleted(guard, key, Some(&provider_id))
            }),
            Err(ProviderError::NotFound { .. }) => {
                log::debug!("{key} ({provider_id}) was already gone");
                self.commit(key, |state, guard| {
                    state.record_deleted(guard, key, Some(&provider_id))
                })
            }
            Err(error) => {
                let tainted = error.taints() && self.taint(key, &provider_id);
                failed(&error, tainted)
            }
        };
        (outcome, attempted.attempts)
    }

    fn provider(&self, key: &ResourceKey) -> std::result::Result<(Arc<dyn Provider>, ResourceTypeSchema), Outcome> {
        let provider = self.registry.provider_for(key).map_err(|e| Outcome::Failed {
            error: e.to_string(),
            category: ErrorCategory::Rejected,
            tainted: false,
        })?;
        Ok((provider.clone(), self.registry.schema_or_default(key)))
    }

    /// Fill in values that were unknown at plan time from the live state.
    fn resolve(&self, action: &PlanAction) -> std::result::Result<Attributes, Outcome> {
        let Some(new) = &action.new else {
            return Ok(Attributes::new());
        };
        complete(new, |reference| self.state.attribute(reference)).map_err(|reference| {
            Outcome::Failed {
                error: format!("unresolved reference to {reference}"),
                category: ErrorCategory::Rejected,
                tainted: false,
            }
        })
    }

    fn commit<F>(&self, key: &ResourceKey, write: F) -> Outcome
    where
        F: FnOnce(&StateStore, &LockGuard) -> Result<()>,
    {
        match write(self.state, self.guard) {
            Ok(()) => Outcome::Succeeded {
                provider_called: true,
            },
            Err(e) => {
                log::error!("{key}: provider call succeeded but state could not be saved: {e}");
                Outcome::Failed {
                    error: format!("failed to record state: {e}"),
                    category: ErrorCategory::Other,
                    tainted: false,
                }
            }
        }
    }

    /// Returns whether the taint was stored.
    fn taint(&self, key: &ResourceKey, provider_id: &str) -> bool {
        match self.state.mark_tainted(self.guard, key, Some(provider_id)) {
            Ok(true) => {
                log::warn!("{key}: remote state is indeterminate, marked as tainted");
                true
            }
            Ok(false) => {
                log::warn!("{key}: {provider_id} is in an indeterminate state but is not the recorded object");
                false
            }
            Err(e) => {
                log::error!("{key}: failed to mark as tainted: {e}");
                false
            }
        }
    }

    /// A create failed part way but the provider knows the object's id.
    ///
    /// Returns whether a tainted record was stored.
    fn record_partial_create(&self, action: &PlanAction, provider_id: &str, hash: &str, inputs: &Attributes) -> bool {
        let key = &action.key;
        if self.state.record(key).is_some() {
            log::warn!(
                "{key}: create left {provider_id} in an indeterminate state; it is not tracked because {key} already has a record"
            );
            return false;
        }

        log::warn!("{key}: create left {provider_id} in an indeterminate state, recording it as tainted");
        let record = StateRecord {
            provider_id: provider_id.to_string(),
            attribute_hash: hash.to_string(),
            attributes: inputs.clone(),
            inputs: inputs.clone(),
            dependencies: action.dependencies.clone(),
            tainted: true,
            drift: None,
            deposed: Vec::new(),
            updated_at: Utc::now(),
        };
        match self.state.record_applied(self.guard, key, record) {
            Ok(()) => true,
            Err(e) => {
                log::error!("{key}: failed to record tainted object: {e}");
                false
            }
        }
    }
}

/// Scheduler bookkeeping owned by the driving thread.
struct Run {
    remaining: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    reports: Vec<Option<ActionReport>>,
    ready: BTreeSet<usize>,
    running: usize,
    halt: Option<SkipReason>,
}

impl Run {
    fn new(actions: &[PlanAction]) -> Self {
        let mut dependents = vec![Vec::new(); actions.len()];
        for action in actions {
            for &dep in &action.depends_on {
                dependents[dep].push(action.index);
            }
        }
        let remaining: Vec<usize> = actions.iter().map(|a| a.depends_on.len()).collect();
        let ready = (0..actions.len()).filter(|&i| remaining[i] == 0).collect();
        Self {
            remaining,
            dependents,
            reports: vec![None; actions.len()],
            ready,
            running: 0,
            halt: None,
        }
    }

    fn record(&mut self, report: ActionReport, progress: &mut dyn ProgressCallback) {
        progress.on_action_complete(&report);
        let index = report.index;
        self.reports[index] = Some(report);
    }

    fn complete(
        &mut self,
        report: ActionReport,
        actions: &[PlanAction],
        policy: FailurePolicy,
        progress: &mut dyn ProgressCallback,
    ) {
        let index = report.index;
        let succeeded = report.outcome.is_success();
        self.record(report, progress);

        if succeeded {
            for &dependent in &self.dependents[index] {
                self.remaining[dependent] -= 1;
                if self.remaining[dependent] == 0 && self.reports[dependent].is_none() {
                    self.ready.insert(dependent);
                }
            }
            return;
        }

        let failed_key = actions[index].key.clone();
        let mut stack = self.dependents[index].clone();
        while let Some(dependent) = stack.pop() {
            if self.reports[dependent].is_some() {
                continue;
            }
            self.ready.remove(&dependent);
            let skipped = report_for(
                &actions[dependent],
                Outcome::Skipped {
                    reason: SkipReason::DependencyFailed {
                        key: failed_key.clone(),
                    },
                },
            );
            self.record(skipped, progress);
            stack.extend(self.dependents[dependent].iter().copied());
        }

        if policy == FailurePolicy::FailFast && self.halt.is_none() {
            log::warn!("{failed_key} failed; not starting any further actions");
            self.halt = Some(SkipReason::Halted);
        }
    }
}

fn report(action: &PlanAction, outcome: Outcome, attempts: u32, duration: Duration) -> ActionReport {
    ActionReport {
        index: action.index,
        key: action.key.clone(),
        kind: action.kind,
        replacement: action.replacement,
        outcome,
        attempts,
        duration,
    }
}

fn report_for(action: &PlanAction, outcome: Outcome) -> ActionReport {
    report(action, outcome, 0, Duration::ZERO)
}

/// `tainted` reports whether a taint flag was actually written to state.
fn failed(error: &ProviderError, tainted: bool) -> Outcome {
    Outcome::Failed {
        error: error.to_string(),
        category: error.category(),
        tainted,
    }
}

fn verb(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Create => "Creating",
        ActionKind::Update => "Updating",
        ActionKind::Delete => "Deleting",
        ActionKind::NoOp => "Checking",
    }
}

/// Run a provider call on its own thread and give up after `timeout`.
///
/// A call that times out keeps running detached; its result is discarded.
pub(crate) fn call_with_timeout<T, F>(
    key: &ResourceKey,
    timeout: Duration,
    provider: Arc<dyn Provider>,
    call: F,
) -> std::result::Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Provider) -> std::result::Result<T, ProviderError> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name(format!("provider-{key}"))
        .spawn(move || {
            let _ = tx.send(call(provider.as_ref()));
        })
        .map_err(|e| ProviderError::Other(format!("failed to start provider call: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(ProviderError::Timeout { timeout }),
        Err(RecvTimeoutError::Disconnected) => Err(ProviderError::Indeterminate {
            message: "provider call panicked".to_string(),
            provider_id: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockManager;
    use crate::memory::{MemoryProvider, Operation};
    use crate::model::{Resource, ResourceSet};
    use crate::plan::PlanMode;
    use crate::progress::NoProgress;
    use crate::provider::ResourceTypeSchema;
    use serde_json::json;

    fn key(s: &str) -> ResourceKey {
        s.parse().unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        provider: Arc<MemoryProvider>,
        registry: ProviderRegistry,
        state: StateStore,
        guard: LockGuard,
    }

    fn fixture(provider: MemoryProvider, schema: ResourceTypeSchema) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let provider = Arc::new(provider);
        let registry = ProviderRegistry::new()
            .with_type("network", provider.clone(), schema.clone())
            .with_type("subnet", provider.clone(), schema);
        let state = StateStore::open(&path).unwrap();
        let guard = LockManager::for_state(&path, Duration::from_secs(60))
            .acquire("scheduler-test")
            .unwrap();
        Fixture {
            _dir: dir,
            provider,
            registry,
            state,
            guard,
        }
    }

    fn model() -> ResourceSet {
        ResourceSet::from_resources([
            Resource::new(key("network.vpc1")).with("cidr", json!("10.0.0.0/16")),
            Resource::new(key("subnet.sub1"))
                .with("vpc_id", key("network.vpc1").attr("id"))
                .with("cidr", json!("10.0.1.0/24")),
        ])
        .unwrap()
    }

    fn apply(f: &Fixture, model: &ResourceSet, options: SchedulerOptions) -> ApplyReport {
        let plan = Plan::generate(model, &f.state.snapshot(), &f.registry, PlanMode::Normal).unwrap();
        Scheduler::new(&f.registry, &f.state, &f.guard)
            .with_options(options)
            .execute(plan, &mut NoProgress)
            .unwrap()
    }

    #[test]
    fn test_unknown_reference_is_filled_at_execution() {
        let f = fixture(MemoryProvider::new(), ResourceTypeSchema::default());
        let report = apply(&f, &model(), SchedulerOptions::default());

        assert!(report.is_success());
        assert_eq!(report.summary().succeeded, 2);
        let sub = f.state.record(&key("subnet.sub1")).unwrap();
        assert_eq!(sub.inputs["vpc_id"], json!("network-1"));
        assert_eq!(sub.dependencies, vec![key("network.vpc1")]);
        assert_eq!(f.state.serial(), 2);
    }

    #[test]
    fn test_failure_skips_dependents() {
        let f = fixture(MemoryProvider::new(), ResourceTypeSchema::default());
        f.provider.fail_next(
            &key("network.vpc1"),
            Operation::Create,
            ProviderError::Rejected {
                message: "quota exceeded".to_string(),
            },
        );

        let report = apply(&f, &model(), SchedulerOptions::default());
        let vpc = report.get(&key("network.vpc1"), ActionKind::Create).unwrap();
        assert!(matches!(
            vpc.outcome,
            Outcome::Failed {
                category: ErrorCategory::Rejected,
                tainted: false,
                ..
            }
        ));
        let sub = report.get(&key("subnet.sub1"), ActionKind::Create).unwrap();
        assert_eq!(
            sub.outcome,
            Outcome::Skipped {
                reason: SkipReason::DependencyFailed {
                    key: key("network.vpc1")
                }
            }
        );
        assert!(f.state.record(&key("network.vpc1")).is_none());
        assert_eq!(f.provider.call_count(Operation::Create), 1);
    }

    #[test]
    fn test_cancelled_before_start_skips_everything() {
        let f = fixture(MemoryProvider::new(), ResourceTypeSchema::default());
        let plan = Plan::generate(&model(), &f.state.snapshot(), &f.registry, PlanMode::Normal).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = Scheduler::new(&f.registry, &f.state, &f.guard)
            .with_cancel_token(cancel)
            .execute(plan, &mut NoProgress)
            .unwrap();

        assert!(report.actions.iter().all(|r| r.outcome
            == Outcome::Skipped {
                reason: SkipReason::Cancelled
            }));
        assert_eq!(f.provider.object_count(), 0);
    }

    #[test]
    fn test_create_timeout_is_not_reported_as_tainted() {
        let f = fixture(
            MemoryProvider::new().with_delay(Duration::from_millis(300)),
            ResourceTypeSchema::default().timeout(Duration::from_millis(20)),
        );
        let vpc_only = ResourceSet::from_resources([
            Resource::new(key("network.vpc1")).with("cidr", json!("10.0.0.0/16")),
        ])
        .unwrap();

        let report = apply(&f, &vpc_only, SchedulerOptions::default());
        assert!(matches!(
            report.actions[0].outcome,
            Outcome::Failed {
                category: ErrorCategory::Timeout,
                tainted: false,
                ..
            }
        ));
        assert!(f.state.record(&key("network.vpc1")).is_none());
    }

    #[test]
    fn test_indeterminate_create_without_id_is_not_tainted() {
        let f = fixture(MemoryProvider::new(), ResourceTypeSchema::default());
        f.provider.fail_next(
            &key("network.vpc1"),
            Operation::Create,
            ProviderError::Indeterminate {
                message: "connection reset".to_string(),
                provider_id: None,
            },
        );

        let report = apply(&f, &model(), SchedulerOptions::default());
        let vpc = report.get(&key("network.vpc1"), ActionKind::Create).unwrap();
        assert!(matches!(
            vpc.outcome,
            Outcome::Failed {
                category: ErrorCategory::Indeterminate,
                tainted: false,
                ..
            }
        ));
        assert!(f.state.record(&key("network.vpc1")).is_none());
    }

    #[test]
    fn test_requires_exclusive_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = StateStore::open(&path).unwrap();
        let registry = ProviderRegistry::new();
        let shared = LockManager::for_state(&path, Duration::from_secs(60))
            .acquire_shared("planner")
            .unwrap();
        let plan = Plan::from_changes(Vec::new()).unwrap();

        let result = Scheduler::new(&registry, &state, &shared).execute(plan, &mut NoProgress);
        assert!(result.is_err());
    }
}
