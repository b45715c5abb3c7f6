//! Collection dependency graph and migration ordering.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::warn;

use crate::error::{MigrateError, Result};

/// Declared `collection -> [depends_on]` mapping.
///
/// Declaration order is kept so the computed order is deterministic: among
/// collections that are ready at the same time, the one declared first wins.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a collection and what it depends on.
    pub fn add(&mut self, collection: impl Into<String>, depends_on: Vec<String>) -> &mut Self {
        let collection = collection.into();
        if !self.edges.contains_key(&collection) {
            self.nodes.push(collection.clone());
        }
        self.edges.insert(collection, depends_on);
        self
    }

    /// Declared collections in declaration order.
    pub fn collections(&self) -> &[String] {
        &self.nodes
    }

    /// Dependencies declared for a collection.
    pub fn dependencies(&self, collection: &str) -> &[String] {
        self.edges.get(collection).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Compute migration order with Kahn's algorithm.
    ///
    /// # Errors
    ///
    /// `MigrateError::Config` when a dependency names an undeclared collection,
    /// a collection depends on itself, or the graph contains a cycle. Cycles are
    /// never broken automatically.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let position: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];

        for (idx, node) in self.nodes.iter().enumerate() {
            for dep in self.dependencies(node) {
                let dep_idx = *position.get(dep.as_str()).ok_or_else(|| {
                    MigrateError::Config(format!(
                        "collection '{}' depends on undeclared collection '{}'",
                        node, dep
                    ))
                })?;
                if dep_idx == idx {
                    return Err(MigrateError::Config(format!(
                        "collection '{}' depends on itself",
                        node
                    )));
                }
                in_degree[idx] += 1;
                dependents[dep_idx].push(idx);
            }
        }

        // BTreeSet keyed by declaration index keeps ties deterministic
        let mut ready: BTreeSet<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(idx) = ready.pop_first() {
            order.push(self.nodes[idx].clone());
            for &next in &dependents[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let cyclic: Vec<&str> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, n)| n.as_str())
                .collect();
            return Err(MigrateError::Config(format!(
                "dependency cycle between collections: {}. Supply migration.order_override \
                 to migrate them in an explicit order",
                cyclic.join(", ")
            )));
        }

        Ok(order)
    }

    /// Resolve the final migration order.
    ///
    /// With an override, the operator's order is used as-is after checking that
    /// it names every declared collection exactly once. Dependencies that the
    /// override places after their dependents are logged, not rejected: that is
    /// how an operator migrates a cyclic group.
    pub fn resolve_order(&self, order_override: &[String]) -> Result<Vec<String>> {
        if order_override.is_empty() {
            return self.topological_order();
        }

        let mut seen = BTreeSet::new();
        for name in order_override {
            if !self.edges.contains_key(name) {
                return Err(MigrateError::Config(format!(
                    "order_override names undeclared collection '{}'",
                    name
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(MigrateError::Config(format!(
                    "order_override lists '{}' more than once",
                    name
                )));
            }
        }
        if seen.len() != self.nodes.len() {
            let missing: Vec<&str> = self
                .nodes
                .iter()
                .filter(|n| !seen.contains(n.as_str()))
                .map(String::as_str)
                .collect();
            return Err(MigrateError::Config(format!(
                "order_override is missing collections: {}",
                missing.join(", ")
            )));
        }

        let position: HashMap<&str, usize> = order_override
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        for name in order_override {
            for dep in self.dependencies(name) {
                if position.get(dep.as_str()) > position.get(name.as_str()) {
                    warn!(
                        "order_override migrates {} before its dependency {}; \
                         foreign keys must be enforced after the migration",
                        name, dep
                    );
                }
            }
        }

        Ok(order_override.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for (name, deps) in edges {
            g.add(*name, deps.iter().map(|d| d.to_string()).collect());
        }
        g
    }

    #[test]
    fn test_dependencies_come_first() {
        let g = graph(&[
            ("validations", &["products", "reports", "users"]),
            ("reports", &["products", "laboratories"]),
            ("products", &["users"]),
            ("users", &[]),
            ("laboratories", &[]),
        ]);
        let order = g.topological_order().unwrap();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();

        assert_eq!(order.len(), 5);
        assert!(pos("users") < pos("products"));
        assert!(pos("products") < pos("reports"));
        assert!(pos("laboratories") < pos("reports"));
        assert!(pos("reports") < pos("validations"));
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let g = graph(&[("b", &[]), ("a", &[]), ("c", &["a"])]);
        assert_eq!(g.topological_order().unwrap(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_cycle_is_config_error() {
        let g = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        let err = g.topological_order().unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
        let msg = err.to_string();
        assert!(msg.contains("a, b"), "unexpected message: {}", msg);
    }

    #[test]
    fn test_unknown_dependency_is_config_error() {
        let g = graph(&[("orders", &["customers"])]);
        assert!(matches!(
            g.topological_order(),
            Err(MigrateError::Config(_))
        ));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let g = graph(&[("a", &["a"])]);
        assert!(g.topological_order().is_err());
    }

    #[test]
    fn test_override_resolves_cycle() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        let order = g
            .resolve_order(&["b".to_string(), "a".to_string()])
            .unwrap();
        assert_eq!(order, vec!["b", "a"]);
    }

    #[test]
    fn test_override_must_be_a_permutation() {
        let g = graph(&[("a", &[]), ("b", &[])]);
        assert!(g.resolve_order(&["a".to_string()]).is_err());
        assert!(g
            .resolve_order(&["a".to_string(), "a".to_string()])
            .is_err());
        assert!(g
            .resolve_order(&["a".to_string(), "zzz".to_string()])
            .is_err());
    }
}
