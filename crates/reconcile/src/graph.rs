//! Dependency graph builder
//!
//! Derives a DAG from attribute references and explicit `depends_on`
//! declarations. An edge `A -> B` means A must exist before B.

use crate::error::ValidationError;
use crate::model::{AttrRef, ResourceKey, ResourceSet};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Validated, acyclic dependency graph over resource keys.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeSet<ResourceKey>,
    /// key -> resources it depends on
    dependencies: BTreeMap<ResourceKey, BTreeSet<ResourceKey>>,
    /// key -> resources that depend on it
    dependents: BTreeMap<ResourceKey, BTreeSet<ResourceKey>>,
    /// key -> attribute references it declares
    references: BTreeMap<ResourceKey, Vec<AttrRef>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl DependencyGraph {
    /// Build and validate the graph for a resource set.
    ///
    /// Fails on dangling references and on cycles (reporting the full path).
    pub fn build(resources: &ResourceSet) -> Result<Self, ValidationError> {
        let mut graph = Self::default();

        for resource in resources.iter() {
            let key = &resource.key;
            graph.nodes.insert(key.clone());
            graph.dependencies.entry(key.clone()).or_default();
            graph.dependents.entry(key.clone()).or_default();
            graph
                .references
                .insert(key.clone(), resource.references().cloned().collect());
        }

        for resource in resources.iter() {
            for dependency in resource.dependency_keys() {
                if !resources.contains(&dependency) {
                    return Err(ValidationError::DanglingReference {
                        from: resource.key.clone(),
                        to: dependency,
                    });
                }
                graph
                    .dependencies
                    .entry(resource.key.clone())
                    .or_default()
                    .insert(dependency.clone());
                graph
                    .dependents
                    .entry(dependency)
                    .or_default()
                    .insert(resource.key.clone());
            }
        }

        if let Some(path) = graph.find_cycle() {
            return Err(ValidationError::Cycle { path });
        }

        log::debug!(
            "Built dependency graph: {} resources, {} edges",
            graph.nodes.len(),
            graph.edge_count()
        );
        Ok(graph)
    }

    /// Depth-first search with a recursion stack. Returns the cycle path with
    /// its first key repeated at the end.
    fn find_cycle(&self) -> Option<Vec<ResourceKey>> {
        let mut marks: HashMap<&ResourceKey, Mark> = HashMap::new();
        let mut stack: Vec<&ResourceKey> = Vec::new();

        for node in &self.nodes {
            if !marks.contains_key(node)
                && let Some(cycle) = self.visit(node, &mut marks, &mut stack)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a ResourceKey,
        marks: &mut HashMap<&'a ResourceKey, Mark>,
        stack: &mut Vec<&'a ResourceKey>,
    ) -> Option<Vec<ResourceKey>> {
        marks.insert(node, Mark::Visiting);
        stack.push(node);

        for next in self.dependents_of(node) {
            match marks.get(next) {
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|k| *k == next)?;
                    let mut path: Vec<ResourceKey> =
                        stack[start..].iter().map(|k| (*k).clone()).collect();
                    path.push(next.clone());
                    return Some(path);
                }
                Some(Mark::Done) => {}
                None => {
                    if let Some(cycle) = self.visit(next, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }

    fn dependents_of<'a>(&'a self, key: &'a ResourceKey) -> impl Iterator<Item = &'a ResourceKey> {
        self.dependents.get(key).into_iter().flatten()
    }

    /// All resource keys in sorted order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceKey> {
        self.nodes.iter()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.nodes.contains(key)
    }

    /// Resources that `key` depends on.
    pub fn dependencies(&self, key: &ResourceKey) -> BTreeSet<ResourceKey> {
        self.dependencies.get(key).cloned().unwrap_or_default()
    }

    /// Resources that depend on `key`.
    pub fn dependents(&self, key: &ResourceKey) -> BTreeSet<ResourceKey> {
        self.dependents.get(key).cloned().unwrap_or_default()
    }

    /// Attribute references declared by `key`.
    pub fn references(&self, key: &ResourceKey) -> &[AttrRef] {
        self.references.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Resources with no dependencies, eligible for immediate scheduling.
    pub fn roots(&self) -> Vec<ResourceKey> {
        self.nodes
            .iter()
            .filter(|k| self.dependencies.get(*k).is_none_or(BTreeSet::is_empty))
            .cloned()
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(BTreeSet::len).sum()
    }

    /// Dependencies-first order, ties broken by key.
    pub fn topological_order(&self) -> Vec<ResourceKey> {
        let mut remaining: BTreeMap<&ResourceKey, usize> = self
            .nodes
            .iter()
            .map(|k| (k, self.dependencies.get(k).map_or(0, BTreeSet::len)))
            .collect();
        let mut ready: BTreeSet<&ResourceKey> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(k, _)| *k)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(key) = ready.pop_first() {
            order.push(key.clone());
            for dependent in self.dependents_of(key) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resource;
    use serde_json::json;

    fn key(s: &str) -> ResourceKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_build_from_references() {
        let set = ResourceSet::from_resources([
            Resource::new(key("network.vpc1")).with("cidr", json!("10.0.0.0/16")),
            Resource::new(key("subnet.sub1")).with("vpc_id", key("network.vpc1").attr("id")),
        ])
        .unwrap();

        let graph = DependencyGraph::build(&set).unwrap();
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.roots(), vec![key("network.vpc1")]);
        assert!(graph.dependents(&key("network.vpc1")).contains(&key("subnet.sub1")));
        assert_eq!(graph.references(&key("subnet.sub1")).len(), 1);
        assert_eq!(
            graph.topological_order(),
            vec![key("network.vpc1"), key("subnet.sub1")]
        );
    }

    #[test]
    fn test_dangling_reference() {
        let set = ResourceSet::from_resources([
            Resource::new(key("subnet.sub1")).with("vpc_id", key("network.missing").attr("id")),
        ])
        .unwrap();

        let err = DependencyGraph::build(&set).unwrap_err();
        assert_eq!(
            err,
            ValidationError::DanglingReference {
                from: key("subnet.sub1"),
                to: key("network.missing"),
            }
        );
    }

    #[test]
    fn test_dangling_depends_on() {
        let set = ResourceSet::from_resources([
            Resource::new(key("subnet.sub1")).depends_on(key("gateway.gw")),
        ])
        .unwrap();
        assert!(matches!(
            DependencyGraph::build(&set),
            Err(ValidationError::DanglingReference { .. })
        ));
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let set = ResourceSet::from_resources([
            Resource::new(key("a.one")).with("x", key("c.three").attr("id")),
            Resource::new(key("b.two")).with("x", key("a.one").attr("id")),
            Resource::new(key("c.three")).with("x", key("b.two").attr("id")),
        ])
        .unwrap();

        let err = DependencyGraph::build(&set).unwrap_err();
        match err {
            ValidationError::Cycle { path } => {
                assert_eq!(
                    path,
                    vec![key("a.one"), key("b.two"), key("c.three"), key("a.one")]
                );
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let set = ResourceSet::from_resources([
            Resource::new(key("a.one")).with("x", key("a.one").attr("id")),
        ])
        .unwrap();
        assert!(matches!(
            DependencyGraph::build(&set),
            Err(ValidationError::Cycle { path }) if path == vec![key("a.one"), key("a.one")]
        ));
    }

    #[test]
    fn test_topological_order_is_deterministic() {
        let set = ResourceSet::from_resources([
            Resource::new(key("db.main")).with("net", key("network.vpc").attr("id")),
            Resource::new(key("bucket.logs")),
            Resource::new(key("network.vpc")),
            Resource::new(key("app.web"))
                .with("db", key("db.main").attr("endpoint"))
                .depends_on(key("bucket.logs")),
        ])
        .unwrap();

        let graph = DependencyGraph::build(&set).unwrap();
        let order: Vec<String> = graph
            .topological_order()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(order, ["bucket.logs", "network.vpc", "db.main", "app.web"]);
    }
}
