//! Diff engine - desired model vs stored state
//!
//! Produces one [`ResourceChange`] per resource in the union of model and
//! state keys. References are resolved in topological order: a reference to
//! an unchanged resource takes its stored attribute, a reference to a
//! resource that is about to change takes the planned input if it is known
//! and is otherwise left [`Resolved::Unknown`].

use crate::graph::DependencyGraph;
use crate::hash::attribute_hash;
use crate::model::{AttrRef, Attributes, ResourceKey, ResourceSet};
use crate::provider::ProviderRegistry;
use crate::resolve::{Resolved, ResolvedAttributes, changed_attributes, resolve_attributes};
use crate::state::{DriftKind, StateDocument, StateRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// What has to happen to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    /// Delete and create under the same key
    Replace,
    NoOp,
}

impl ChangeKind {
    pub fn is_change(&self) -> bool {
        *self != Self::NoOp
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Replace => write!(f, "replace"),
            Self::NoOp => write!(f, "no-op"),
        }
    }
}

/// Why a change was chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ChangeReason {
    /// Declared but not in state
    New,
    /// In state but no longer declared
    Removed,
    AttributesChanged { attributes: Vec<String> },
    /// A changed attribute cannot be updated in place
    ForceReplace { attributes: Vec<String> },
    /// A previous apply left the remote object indeterminate
    Tainted,
    Drifted { kind: DriftKind },
    /// Superseded by a create-before-destroy replacement, not yet deleted
    Deposed,
    Unchanged,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "not yet created"),
            Self::Removed => write!(f, "no longer declared"),
            Self::AttributesChanged { attributes } => {
                write!(f, "changed: {}", attributes.join(", "))
            }
            Self::ForceReplace { attributes } => {
                write!(f, "{} forces replacement", attributes.join(", "))
            }
            Self::Tainted => write!(f, "tainted by a failed apply"),
            Self::Drifted { kind } => write!(f, "remote object {kind}"),
            Self::Deposed => write!(f, "left over from an earlier replacement"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Planned change for a single resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceChange {
    pub key: ResourceKey,
    pub kind: ChangeKind,
    pub reason: ChangeReason,
    /// Inputs that were last applied
    pub old: Option<Attributes>,
    /// Desired inputs, possibly with unknown values
    pub new: Option<ResolvedAttributes>,
    pub new_hash: Option<String>,
    /// Identifier of the existing remote object
    pub provider_id: Option<String>,
    pub create_before_destroy: bool,
    /// Dependencies in the desired model
    pub dependencies: Vec<ResourceKey>,
    /// Dependencies recorded when the resource was last applied
    pub prior_dependencies: Vec<ResourceKey>,
}

/// Compute the change for every resource in `model` and `state`.
///
/// The result is sorted by key, followed by one delete per deposed object.
/// `graph` must have been built from `model`.
pub fn diff(
    model: &ResourceSet,
    graph: &DependencyGraph,
    state: &StateDocument,
    registry: &ProviderRegistry,
) -> Vec<ResourceChange> {
    let mut changes: BTreeMap<ResourceKey, ResourceChange> = BTreeMap::new();

    for key in graph.topological_order() {
        let Some(resource) = model.get(&key) else {
            continue;
        };

        let resolved = resolve_attributes(resource, |reference| {
            resolve_reference(reference, &changes, state)
        });
        let change = diff_resource(
            &key,
            resolved,
            graph.dependencies(&key).into_iter().collect(),
            state.get(&key),
            registry,
        );
        changes.insert(key, change);
    }

    for (key, record) in &state.resources {
        if model.contains(key) {
            continue;
        }
        changes.insert(
            key.clone(),
            ResourceChange {
                key: key.clone(),
                kind: ChangeKind::Delete,
                reason: ChangeReason::Removed,
                old: Some(record.inputs.clone()),
                new: None,
                new_hash: None,
                provider_id: Some(record.provider_id.clone()),
                create_before_destroy: false,
                dependencies: Vec::new(),
                prior_dependencies: record.dependencies.clone(),
            },
        );
    }

    let mut changes: Vec<ResourceChange> = changes.into_values().collect();
    changes.extend(deposed_changes(state));
    log::debug!(
        "Diffed {} resources: {} with changes",
        changes.len(),
        changes.iter().filter(|c| c.kind.is_change()).count()
    );
    changes
}

/// One delete per deposed object, whatever the model says about its key.
fn deposed_changes(state: &StateDocument) -> Vec<ResourceChange> {
    state
        .resources
        .iter()
        .flat_map(|(key, record)| {
            record.deposed.iter().map(|deposed| ResourceChange {
                key: key.clone(),
                kind: ChangeKind::Delete,
                reason: ChangeReason::Deposed,
                old: None,
                new: None,
                new_hash: None,
                provider_id: Some(deposed.provider_id.clone()),
                create_before_destroy: false,
                dependencies: Vec::new(),
                prior_dependencies: Vec::new(),
            })
        })
        .collect()
}

fn resolve_reference(
    reference: &AttrRef,
    changes: &BTreeMap<ResourceKey, ResourceChange>,
    state: &StateDocument,
) -> Resolved {
    let unknown = || Resolved::Unknown(reference.clone());
    match changes.get(&reference.key) {
        Some(change) if change.kind == ChangeKind::NoOp => state
            .attribute(reference)
            .map_or_else(unknown, |value| Resolved::Known(value.clone())),
        Some(change) => match change.new.as_ref().and_then(|n| n.get(&reference.attribute)) {
            Some(known @ Resolved::Known(_)) => known.clone(),
            _ => unknown(),
        },
        None => unknown(),
    }
}

fn diff_resource(
    key: &ResourceKey,
    resolved: ResolvedAttributes,
    dependencies: Vec<ResourceKey>,
    record: Option<&StateRecord>,
    registry: &ProviderRegistry,
) -> ResourceChange {
    let schema = registry.schema_or_default(key);
    let new_hash = attribute_hash(&resolved);

    let mut change = ResourceChange {
        key: key.clone(),
        kind: ChangeKind::Create,
        reason: ChangeReason::New,
        old: None,
        new: Some(resolved),
        new_hash: Some(new_hash),
        provider_id: None,
        create_before_destroy: schema.create_before_destroy,
        dependencies,
        prior_dependencies: Vec::new(),
    };

    let Some(record) = record else {
        return change;
    };

    change.old = Some(record.inputs.clone());
    change.provider_id = Some(record.provider_id.clone());
    change.prior_dependencies = record.dependencies.clone();

    let changed = change
        .new
        .as_ref()
        .map(|new| changed_attributes(&record.inputs, new))
        .unwrap_or_default();
    let forced = schema.forces_replace(&changed);

    (change.kind, change.reason) = if record.tainted {
        (ChangeKind::Replace, ChangeReason::Tainted)
    } else if record.drift == Some(DriftKind::Missing) {
        // Nothing left to delete; recreate under the same key.
        change.provider_id = None;
        (
            ChangeKind::Create,
            ChangeReason::Drifted {
                kind: DriftKind::Missing,
            },
        )
    } else if !forced.is_empty() {
        (
            ChangeKind::Replace,
            ChangeReason::ForceReplace { attributes: forced },
        )
    } else if change.new_hash.as_deref() != Some(record.attribute_hash.as_str()) {
        (
            ChangeKind::Update,
            ChangeReason::AttributesChanged {
                attributes: changed,
            },
        )
    } else if let Some(kind) = record.drift {
        (ChangeKind::Update, ChangeReason::Drifted { kind })
    } else {
        (ChangeKind::NoOp, ChangeReason::Unchanged)
    };

    change
}
