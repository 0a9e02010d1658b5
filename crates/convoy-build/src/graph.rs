//! Service dependency graph
//!
//! Nodes are buildable services; an edge A -> B means A depends on B and
//! must be built after it. Backing stores are pulled, not built, so they
//! never enter the graph.

use crate::BuildError;
use convoy_core::{ServiceKind, ServiceRegistry};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Directed dependency graph over buildable services
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// node -> its dependencies, insertion-ordered nodes
    edges: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Graph of the registry's application services; dependencies on
    /// backing stores are dropped
    pub fn from_registry(registry: &ServiceRegistry) -> Self {
        let buildable: HashSet<&str> = registry
            .application_services()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        let mut edges = BTreeMap::new();
        for service in registry.services() {
            if service.kind != ServiceKind::Application {
                continue;
            }
            let deps = service
                .dependencies
                .iter()
                .filter(|d| buildable.contains(d.as_str()))
                .cloned()
                .collect();
            edges.insert(service.name.clone(), deps);
        }
        Self { edges }
    }

    /// Graph from explicit edges, for tests and ad-hoc analysis
    pub fn from_edges(edges: &[(&str, &[&str])]) -> Self {
        Self {
            edges: edges
                .iter()
                .map(|(node, deps)| {
                    (node.to_string(), deps.iter().map(|d| d.to_string()).collect())
                })
                .collect(),
        }
    }

    /// All nodes, sorted
    pub fn nodes(&self) -> Vec<&str> {
        self.edges.keys().map(String::as_str).collect()
    }

    /// Dependencies of a node
    pub fn dependencies(&self, node: &str) -> Result<&[String], BuildError> {
        self.edges
            .get(node)
            .map(Vec::as_slice)
            .ok_or_else(|| BuildError::UnknownService(node.into()))
    }

    /// Smallest set containing `roots` that is closed under the
    /// dependency relation
    pub fn closure(&self, roots: &[String]) -> Result<HashSet<String>, BuildError> {
        let mut closed = HashSet::new();
        let mut stack: Vec<String> = Vec::new();
        for root in roots {
            if !self.edges.contains_key(root) {
                return Err(BuildError::UnknownService(root.clone()));
            }
            stack.push(root.clone());
        }
        while let Some(node) = stack.pop() {
            if !closed.insert(node.clone()) {
                continue;
            }
            for dep in &self.edges[&node] {
                if !self.edges.contains_key(dep) {
                    return Err(BuildError::UnknownService(dep.clone()));
                }
                stack.push(dep.clone());
            }
        }
        Ok(closed)
    }

    /// Find a cycle within `scope`, reconstructing the full node sequence.
    ///
    /// Depth-first traversal with a recursion stack; the returned path
    /// starts and ends on the same node, e.g. `A -> B -> A`.
    fn find_cycle(&self, scope: &HashSet<String>) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();

        // the explicit stack is what the cycle path is reconstructed from
        fn visit<'a>(
            graph: &'a DependencyGraph,
            scope: &HashSet<String>,
            node: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            marks.insert(node, Mark::InProgress);
            stack.push(node);
            for dep in &graph.edges[node] {
                if !scope.contains(dep.as_str()) {
                    continue;
                }
                match marks.get(dep.as_str()) {
                    Some(Mark::Done) => {}
                    Some(Mark::InProgress) => {
                        let start = stack.iter().position(|n| *n == dep).unwrap();
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        path.push(dep.clone());
                        return Some(path);
                    }
                    None => {
                        if let Some(path) = visit(graph, scope, dep, marks, stack) {
                            return Some(path);
                        }
                    }
                }
            }
            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut ordered: Vec<&str> = scope.iter().map(String::as_str).collect();
        ordered.sort_unstable();
        for node in ordered {
            if !marks.contains_key(node) {
                if let Some(path) = visit(self, scope, node, &mut marks, &mut stack) {
                    return Some(path);
                }
            }
        }
        None
    }

    /// Topological build order for `roots` (the whole graph when `None`):
    /// the requested set closed under dependencies, dependencies first.
    ///
    /// Kahn's algorithm over the reverse of the dependency edges. Ties are
    /// broken lexicographically, so the order is stable across re-runs of
    /// an unchanged graph.
    pub fn build_order(&self, roots: Option<&[String]>) -> Result<Vec<String>, BuildError> {
        let scope = match roots {
            Some(roots) => self.closure(roots)?,
            None => self.edges.keys().cloned().collect(),
        };

        if let Some(path) = self.find_cycle(&scope) {
            return Err(BuildError::CircularDependency { path });
        }

        // in-degree = number of in-scope dependencies
        let mut indegree: BTreeMap<&str, usize> = scope
            .iter()
            .map(|node| {
                let deg = self.edges[node]
                    .iter()
                    .filter(|d| scope.contains(d.as_str()))
                    .count();
                (node.as_str(), deg)
            })
            .collect();
        // reverse adjacency: dependency -> dependents
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for node in &scope {
            for dep in &self.edges[node] {
                if scope.contains(dep.as_str()) {
                    dependents.entry(dep.as_str()).or_default().push(node.as_str());
                }
            }
        }

        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(node, _)| *node)
            .collect();
        ready.sort_unstable();

        let mut order = Vec::with_capacity(scope.len());
        while let Some(node) = ready.first().copied() {
            ready.remove(0);
            order.push(node.to_string());
            if let Some(list) = dependents.get(node) {
                for dependent in list {
                    let deg = indegree.get_mut(dependent).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        let pos = ready.binary_search(dependent).unwrap_or_else(|p| p);
                        ready.insert(pos, dependent);
                    }
                }
            }
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_registry_graph_order() {
        let graph = DependencyGraph::from_registry(&ServiceRegistry::new());
        let order = graph.build_order(None).unwrap();
        assert_eq!(order.len(), 6);

        let index = |name: &str| order.iter().position(|n| n == name).unwrap();
        // leaves have no service dependencies; gateway closes the order
        assert!(graph.dependencies(&order[0]).unwrap().is_empty());
        assert_eq!(order.last().unwrap(), "gateway");
        assert!(index("personas") < index("workflows"));
        assert!(index("context") < index("workflows"));
        assert!(index("workflows") < index("projects"));
    }

    #[test]
    fn test_order_stable_across_runs() {
        let graph = DependencyGraph::from_registry(&ServiceRegistry::new());
        let first = graph.build_order(None).unwrap();
        for _ in 0..10 {
            assert_eq!(graph.build_order(None).unwrap(), first);
        }
    }

    #[test]
    fn test_subset_closes_under_dependencies() {
        let graph = DependencyGraph::from_registry(&ServiceRegistry::new());
        let order = graph.build_order(Some(&["workflows".into()])).unwrap();
        assert!(order.contains(&"personas".to_string()));
        assert!(order.contains(&"context".to_string()));
        assert_eq!(order.last().unwrap(), "workflows");
        assert!(!order.contains(&"gateway".to_string()));
    }

    #[test]
    fn test_two_node_cycle_reports_path() {
        let graph = DependencyGraph::from_edges(&[("A", &["B"]), ("B", &["A"])]);
        let err = graph.build_order(Some(&["A".into()])).unwrap_err();
        match err {
            BuildError::CircularDependency { path } => {
                assert_eq!(path, vec!["A", "B", "A"]);
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_longer_cycle_reports_full_sequence() {
        let graph =
            DependencyGraph::from_edges(&[("A", &["B"]), ("B", &["C"]), ("C", &["A"]), ("D", &[])]);
        let err = graph.build_order(None).unwrap_err();
        match err {
            BuildError::CircularDependency { path } => {
                assert_eq!(path.len(), 4);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_root_rejected() {
        let graph = DependencyGraph::from_registry(&ServiceRegistry::new());
        assert!(matches!(
            graph.build_order(Some(&["mystery".into()])),
            Err(BuildError::UnknownService(_))
        ));
    }

    proptest! {
        /// Any DAG (edges only point at lower indices) sorts with every
        /// dependency before its dependent.
        #[test]
        fn prop_dependencies_precede_dependents(adjacency in prop::collection::vec(prop::collection::vec(any::<bool>(), 8), 8)) {
            let names: Vec<String> = (0..8).map(|i| format!("s{i}")).collect();
            let edges: Vec<(String, Vec<String>)> = names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let deps: Vec<String> = (0..i)
                        .filter(|j| adjacency[i][*j])
                        .map(|j| names[j].clone())
                        .collect();
                    (name.clone(), deps)
                })
                .collect();
            let borrowed: Vec<(&str, Vec<&str>)> = edges
                .iter()
                .map(|(n, d)| (n.as_str(), d.iter().map(String::as_str).collect()))
                .collect();
            let slices: Vec<(&str, &[&str])> =
                borrowed.iter().map(|(n, d)| (*n, d.as_slice())).collect();
            let graph = DependencyGraph::from_edges(&slices);

            let order = graph.build_order(None).unwrap();
            prop_assert_eq!(order.len(), 8);
            let index = |name: &str| order.iter().position(|n| n == name).unwrap();
            for (node, deps) in &edges {
                for dep in deps {
                    prop_assert!(index(dep) < index(node));
                }
            }
        }
    }
}
