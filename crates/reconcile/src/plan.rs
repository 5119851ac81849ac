//! Plan generator - turns resource changes into an ordered action list
//!
//! Every change becomes one action, except a replacement which becomes a
//! delete and a create under the same key. Actions are ordered by edges
//! derived from resource dependencies (A -> B meaning B depends on A):
//!
//! - A's create/update runs before B's create/update
//! - B's delete runs before A's delete
//! - if A is removed outright or replaced create-before-destroy, B's
//!   create/update runs before A's delete
//! - a replacement deletes first, or creates first when the type is
//!   create-before-destroy
//!
//! Objects deposed by an earlier create-before-destroy replacement get a
//! delete of their own, ordered before any delete of the key's current
//! object.
//!
//! A resource that depends on a create-before-destroy replacement and is
//! itself replaced forces its dependencies' replacements to
//! create-before-destroy as well; otherwise the edges above would form a
//! cycle.

use crate::diff::{ChangeKind, ChangeReason, ResourceChange, diff};
use crate::error::{ConflictError, Result, StateError, ValidationError};
use crate::graph::DependencyGraph;
use crate::model::{Attributes, ResourceKey, ResourceSet};
use crate::provider::ProviderRegistry;
use crate::resolve::ResolvedAttributes;
use crate::state::StateDocument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

/// A single provider-level step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Delete,
    Create,
    Update,
    NoOp,
}

impl ActionKind {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }

    pub fn is_change(&self) -> bool {
        *self != Self::NoOp
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::NoOp => write!(f, "no-op"),
        }
    }
}

/// Whether to converge on the model or tear everything down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    #[default]
    Normal,
    /// Plan as if the model were empty
    Destroy,
}

/// One planned action. Immutable once the plan is generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanAction {
    pub index: usize,
    pub kind: ActionKind,
    pub key: ResourceKey,
    pub reason: ChangeReason,
    /// Half of a delete + create replacement
    #[serde(default)]
    pub replacement: bool,
    /// Inputs that were last applied
    pub old: Option<Attributes>,
    /// Desired inputs; unknown values are filled in at execution
    pub new: Option<ResolvedAttributes>,
    pub new_hash: Option<String>,
    /// Remote object this action operates on (update and delete)
    pub provider_id: Option<String>,
    /// Resource dependencies to record in state on success
    #[serde(default)]
    pub dependencies: Vec<ResourceKey>,
    /// Indices of actions that must succeed first
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

/// Action counts, with a replacement counted once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub unchanged: usize,
}

impl PlanSummary {
    pub fn total_changes(&self) -> usize {
        self.create + self.update + self.replace + self.delete
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete",
            self.create, self.update, self.replace, self.delete
        )
    }
}

/// An ordered, serializable set of actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub actions: Vec<PlanAction>,
    pub mode: PlanMode,
    /// State serial the plan was computed against
    pub state_serial: u64,
    pub state_lineage: String,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Validate the model, diff it against `state` and order the result.
    ///
    /// Fails before producing any action if the model is invalid.
    pub fn generate(
        model: &ResourceSet,
        state: &StateDocument,
        registry: &ProviderRegistry,
        mode: PlanMode,
    ) -> std::result::Result<Self, ValidationError> {
        let empty = ResourceSet::new();
        let model = match mode {
            PlanMode::Normal => model,
            PlanMode::Destroy => &empty,
        };

        let graph = DependencyGraph::build(model)?;
        registry.validate(model, state)?;

        let changes = diff(model, &graph, state, registry);
        let mut plan = Self::from_changes(changes)?;
        plan.mode = mode;
        plan.state_serial = state.serial;
        plan.state_lineage.clone_from(&state.lineage);

        let summary = plan.summary();
        log::info!("Plan: {summary}");
        Ok(plan)
    }

    /// Order a set of resource changes.
    pub fn from_changes(
        changes: Vec<ResourceChange>,
    ) -> std::result::Result<Self, ValidationError> {
        let cbd = effective_create_before_destroy(&changes);
        let nodes = expand(changes, &cbd);
        let edges = action_edges(&nodes, &cbd);
        let actions = order(nodes, &edges)?;

        Ok(Self {
            actions,
            mode: PlanMode::Normal,
            state_serial: 0,
            state_lineage: String::new(),
            created_at: Utc::now(),
        })
    }

    /// Actions that change something (NoOps omitted).
    pub fn changes(&self) -> impl Iterator<Item = &PlanAction> {
        self.actions.iter().filter(|a| a.kind.is_change())
    }

    /// True when applying the plan would call no provider.
    pub fn is_empty(&self) -> bool {
        self.changes().next().is_none()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            match (action.kind, action.replacement) {
                (ActionKind::Create, true) => summary.replace += 1,
                (ActionKind::Delete, true) => {}
                (ActionKind::Create, false) => summary.create += 1,
                (ActionKind::Update, _) => summary.update += 1,
                (ActionKind::Delete, false) => summary.delete += 1,
                (ActionKind::NoOp, _) => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Fail unless the plan was computed against this exact state.
    ///
    /// A state that was never written has no lineage of its own yet, so a
    /// plan made against an empty state matches any other empty state.
    pub fn verify_against(&self, state: &StateDocument) -> std::result::Result<(), ConflictError> {
        if state.serial > 0 && self.state_lineage != state.lineage {
            return Err(ConflictError::ForeignPlan {
                planned: self.state_lineage.clone(),
                current: state.lineage.clone(),
            });
        }
        if self.state_serial != state.serial {
            return Err(ConflictError::StalePlan {
                planned: self.state_serial,
                current: state.serial,
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write the plan for a later `apply_plan`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_json().map_err(StateError::from)?;
        fs::write(path, content).map_err(|source| StateError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Saved plan to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| StateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let plan = serde_json::from_str(&content).map_err(|source| StateError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(plan)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes. Infrastructure matches the configuration.");
        }
        for action in self.changes() {
            let verb = if action.replacement {
                format!("{}, replacement", action.kind)
            } else {
                action.kind.to_string()
            };
            writeln!(
                f,
                "  {} {} ({verb}: {})",
                action.kind.symbol(),
                action.key,
                action.reason
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Plan: {}.", self.summary())
    }
}

/// Replacements that must create before destroying, after propagation.
fn effective_create_before_destroy(changes: &[ResourceChange]) -> BTreeSet<ResourceKey> {
    let replaced: BTreeMap<&ResourceKey, &ResourceChange> = changes
        .iter()
        .filter(|c| c.kind == ChangeKind::Replace)
        .map(|c| (&c.key, c))
        .collect();

    let mut cbd: BTreeSet<ResourceKey> = replaced
        .values()
        .filter(|c| c.create_before_destroy)
        .map(|c| c.key.clone())
        .collect();

    loop {
        let promoted: Vec<ResourceKey> = cbd
            .iter()
            .filter_map(|key| replaced.get(key))
            .flat_map(|change| change.dependencies.iter())
            .filter(|dep| replaced.contains_key(dep) && !cbd.contains(*dep))
            .cloned()
            .collect();
        if promoted.is_empty() {
            return cbd;
        }
        for key in promoted {
            log::debug!("{key} will be replaced create-before-destroy because a dependent is");
            cbd.insert(key);
        }
    }
}

/// An action before its final index is known.
struct Node {
    action: PlanAction,
    /// Union of model and recorded dependencies
    all_dependencies: BTreeSet<ResourceKey>,
    pure_removal: bool,
    /// Deletes an object superseded by an earlier replacement
    deposed: bool,
}

fn expand(changes: Vec<ResourceChange>, cbd: &BTreeSet<ResourceKey>) -> Vec<Node> {
    let mut nodes = Vec::with_capacity(changes.len());

    for change in changes {
        let all_dependencies: BTreeSet<ResourceKey> = change
            .dependencies
            .iter()
            .chain(change.prior_dependencies.iter())
            .cloned()
            .collect();

        let base = PlanAction {
            index: 0,
            kind: ActionKind::NoOp,
            key: change.key.clone(),
            reason: change.reason.clone(),
            replacement: false,
            old: change.old.clone(),
            new: change.new.clone(),
            new_hash: change.new_hash.clone(),
            provider_id: change.provider_id.clone(),
            dependencies: change.dependencies.clone(),
            depends_on: Vec::new(),
        };

        let deposed = change.reason == ChangeReason::Deposed;
        let kinds: &[ActionKind] = match change.kind {
            ChangeKind::Create => &[ActionKind::Create],
            ChangeKind::Update => &[ActionKind::Update],
            ChangeKind::Delete => &[ActionKind::Delete],
            ChangeKind::NoOp => &[ActionKind::NoOp],
            ChangeKind::Replace if cbd.contains(&change.key) => {
                &[ActionKind::Create, ActionKind::Delete]
            }
            ChangeKind::Replace => &[ActionKind::Delete, ActionKind::Create],
        };

        for &kind in kinds {
            let mut action = base.clone();
            action.kind = kind;
            action.replacement = change.kind == ChangeKind::Replace;
            match kind {
                ActionKind::Delete => {
                    action.new = None;
                    action.new_hash = None;
                }
                // A replacement's create makes a new object.
                ActionKind::Create => action.provider_id = None,
                ActionKind::Update | ActionKind::NoOp => {}
            }
            nodes.push(Node {
                action,
                all_dependencies: all_dependencies.clone(),
                pure_removal: change.kind == ChangeKind::Delete && !deposed,
                deposed,
            });
        }
    }
    nodes
}

/// Edges between node positions, `(before, after)`.
fn action_edges(nodes: &[Node], cbd: &BTreeSet<ResourceKey>) -> BTreeSet<(usize, usize)> {
    let mut apply_node: BTreeMap<&ResourceKey, usize> = BTreeMap::new();
    let mut delete_node: BTreeMap<&ResourceKey, usize> = BTreeMap::new();
    for (i, node) in nodes.iter().enumerate() {
        let key = &node.action.key;
        if node.deposed {
            continue;
        }
        if node.action.kind == ActionKind::Delete {
            delete_node.insert(key, i);
        } else {
            apply_node.insert(key, i);
        }
    }

    let mut edges = BTreeSet::new();
    for (i, node) in nodes.iter().enumerate() {
        let key = &node.action.key;
        match node.action.kind {
            // Deposed objects go before the record's own object is deleted.
            ActionKind::Delete if node.deposed => {
                if let Some(&j) = delete_node.get(key) {
                    edges.insert((i, j));
                }
            }
            ActionKind::Delete => {
                for dep in &node.all_dependencies {
                    if let Some(&j) = delete_node.get(dep) {
                        edges.insert((i, j));
                    }
                }
                if node.action.replacement
                    && let Some(&create) = apply_node.get(key)
                {
                    if cbd.contains(key) {
                        edges.insert((create, i));
                    } else {
                        edges.insert((i, create));
                    }
                }
            }
            _ => {
                for dep in &node.action.dependencies {
                    if let Some(&j) = apply_node.get(dep) {
                        edges.insert((j, i));
                    }
                }
                for dep in &node.all_dependencies {
                    if let Some(&j) = delete_node.get(dep)
                        && (nodes[j].pure_removal || cbd.contains(dep))
                    {
                        edges.insert((i, j));
                    }
                }
            }
        }
    }
    edges
}

/// Kahn's algorithm over action edges; ready actions ordered by
/// `(key, kind)`.
fn order(
    nodes: Vec<Node>,
    edges: &BTreeSet<(usize, usize)>,
) -> std::result::Result<Vec<PlanAction>, ValidationError> {
    let mut incoming = vec![0usize; nodes.len()];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for &(before, after) in edges {
        incoming[after] += 1;
        outgoing[before].push(after);
    }

    let sort_key = |i: usize| (nodes[i].action.key.clone(), nodes[i].action.kind, i);
    let mut ready: BTreeSet<(ResourceKey, ActionKind, usize)> = (0..nodes.len())
        .filter(|&i| incoming[i] == 0)
        .map(sort_key)
        .collect();

    let mut position = vec![usize::MAX; nodes.len()];
    let mut sequence = Vec::with_capacity(nodes.len());
    while let Some((_, _, i)) = ready.pop_first() {
        position[i] = sequence.len();
        sequence.push(i);
        for &next in &outgoing[i] {
            incoming[next] -= 1;
            if incoming[next] == 0 {
                ready.insert(sort_key(next));
            }
        }
    }

    if sequence.len() < nodes.len() {
        let mut path: Vec<ResourceKey> = (0..nodes.len())
            .filter(|&i| position[i] == usize::MAX)
            .map(|i| nodes[i].action.key.clone())
            .collect();
        path.dedup();
        if let Some(first) = path.first().cloned() {
            path.push(first);
        }
        return Err(ValidationError::Cycle { path });
    }

    let mut prerequisites: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for &(before, after) in edges {
        prerequisites[after].push(position[before]);
    }

    let mut slots: Vec<Option<PlanAction>> = nodes.into_iter().map(|n| Some(n.action)).collect();
    let mut actions = Vec::with_capacity(sequence.len());
    for (index, i) in sequence.into_iter().enumerate() {
        if let Some(mut action) = slots[i].take() {
            action.index = index;
            let mut depends_on = std::mem::take(&mut prerequisites[i]);
            depends_on.sort_unstable();
            action.depends_on = depends_on;
            actions.push(action);
        }
    }
    Ok(actions)
}
