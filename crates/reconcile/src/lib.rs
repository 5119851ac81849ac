//! # Reconcile
//!
//! An engine that converges remote infrastructure on a declared model.
//!
//! Given a set of declared resources and the last known state, the engine
//! builds a dependency graph, diffs desired against stored state, produces an
//! ordered plan of create/update/delete actions, and executes it on a bounded
//! worker pool while holding an exclusive lock on the state.
//!
//! ## Core Concepts
//!
//! - **Resource**: A `type.name` keyed set of attributes, some of which may
//!   reference attributes of other resources (`${network.vpc1.id}`)
//! - **State**: The last applied snapshot per resource, with its provider id
//! - **Plan**: An immutable, ordered list of actions with explicit
//!   prerequisites
//! - **Provider**: The adapter that performs create/read/update/delete calls
//!
//! ## Example
//!
//! ```ignore
//! use reconcile::{
//!     Engine, LockManager, MemoryProvider, PlanMode, ProviderRegistry, Resource,
//!     ResourceKey, ResourceSet, ResourceTypeSchema, StateStore,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let provider = Arc::new(MemoryProvider::new());
//! let registry = ProviderRegistry::new()
//!     .with_type("network", provider.clone(), ResourceTypeSchema::default())
//!     .with_type("subnet", provider, ResourceTypeSchema::default());
//!
//! let vpc = ResourceKey::new("network", "vpc1");
//! let model = ResourceSet::from_resources([
//!     Resource::new(vpc.clone()).with("cidr", serde_json::json!("10.0.0.0/16")),
//!     Resource::new(ResourceKey::new("subnet", "sub1")).with("vpc_id", vpc.attr("id")),
//! ])?;
//!
//! let state = StateStore::open("state.json")?;
//! let locks = LockManager::for_state("state.json".as_ref(), Duration::from_secs(300));
//! let engine = Engine::new(registry, state, locks);
//!
//! let plan = engine.plan(&model, PlanMode::Normal)?;
//! println!("{plan}");
//! let report = engine.apply(&model, PlanMode::Normal)?;
//! ```

pub mod diff;
pub mod document;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hash;
pub mod lock;
pub mod memory;
pub mod model;
pub mod plan;
pub mod progress;
pub mod provider;
pub mod refresh;
pub mod resolve;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types at crate root
pub use diff::{ChangeKind, ChangeReason, ResourceChange, diff};
pub use document::{Format, load_path, parse_str};
pub use engine::{Engine, EngineOptions};
pub use error::{
    ConflictError, ErrorCategory, ProviderError, ReconcileError, Result, StateError,
    ValidationError,
};
pub use graph::DependencyGraph;
pub use hash::{UNKNOWN_TOKEN, attribute_hash};
pub use lock::{LockGuard, LockManager, LockMode, LockRecord, LockStatus, default_owner_id};
pub use memory::{MemoryProvider, Operation};
pub use model::{AttrRef, Attributes, Resource, ResourceKey, ResourceSet, Value};
pub use plan::{ActionKind, Plan, PlanAction, PlanMode, PlanSummary};
pub use progress::{NoProgress, ProgressCallback};
pub use provider::{
    Created, DEFAULT_TIMEOUT, Provider, ProviderRegistry, ResolvedResource, ResourceTypeSchema,
};
pub use refresh::{DriftWarning, RefreshReport, refresh};
pub use resolve::{Resolved, ResolvedAttributes};
pub use retry::RetryPolicy;
pub use scheduler::{
    ActionReport, ApplyReport, ApplySummary, CancelToken, FailurePolicy, Outcome, Scheduler,
    SchedulerOptions, SkipReason,
};
pub use state::{DeposedObject, DriftKind, STATE_VERSION, StateDocument, StateRecord, StateStore};
