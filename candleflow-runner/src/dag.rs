//! Stage dependency graph.
//!
//! Named nodes plus directed edges, validated on construction and ordered
//! with Kahn's algorithm. Ties are broken by insertion order so the same
//! graph always yields the same execution order.

use std::collections::{BTreeSet, VecDeque};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate stage '{0}'")]
    DuplicateNode(String),

    #[error("edge {from} -> {to} references unknown stage '{missing}'")]
    UnknownNode {
        from: String,
        to: String,
        missing: String,
    },

    #[error("stage graph has a cycle through: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("stage '{0}' is in the graph but has no implementation")]
    Unbound(String),

    #[error("stage '{0}' has no node in the graph")]
    NotInGraph(String),
}

#[derive(Debug, Clone, Default)]
pub struct StageGraph {
    nodes: Vec<String>,
    edges: Vec<(usize, usize)>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// A straight chain `a -> b -> c ...`.
    pub fn chain(names: &[&str]) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for name in names {
            graph.add_node(name)?;
        }
        for pair in names.windows(2) {
            graph.add_edge(pair[0], pair[1])?;
        }
        Ok(graph)
    }

    pub fn add_node(&mut self, name: &str) -> Result<(), GraphError> {
        if self.index_of(name).is_some() {
            return Err(GraphError::DuplicateNode(name.to_string()));
        }
        self.nodes.push(name.to_string());
        Ok(())
    }

    /// `from` must complete before `to` starts.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        let unknown = |missing: &str| GraphError::UnknownNode {
            from: from.to_string(),
            to: to.to_string(),
            missing: missing.to_string(),
        };
        let f = self.index_of(from).ok_or_else(|| unknown(from))?;
        let t = self.index_of(to).ok_or_else(|| unknown(to))?;
        if !self.edges.contains(&(f, t)) {
            self.edges.push((f, t));
        }
        Ok(())
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.edges
            .iter()
            .map(|&(f, t)| (self.nodes[f].as_str(), self.nodes[t].as_str()))
    }

    /// Execution order. Fails with the nodes left on a cycle.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        for &(_, t) in &self.edges {
            in_degree[t] += 1;
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(node) = ready.pop_front() {
            order.push(node);
            for &(f, t) in &self.edges {
                if f == node {
                    in_degree[t] -= 1;
                    if in_degree[t] == 0 {
                        ready.push_back(t);
                    }
                }
            }
        }

        if order.len() < n {
            let stuck = (0..n)
                .filter(|i| !order.contains(i))
                .map(|i| self.nodes[i].clone())
                .collect();
            return Err(GraphError::Cycle(stuck));
        }

        Ok(order.into_iter().map(|i| self.nodes[i].clone()).collect())
    }

    /// Every node reachable from `name`, excluding `name` itself.
    pub fn downstream_of(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let Some(start) = self.index_of(name) else {
            return seen;
        };

        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for &(f, t) in &self.edges {
                if f == node && seen.insert(self.nodes[t].clone()) {
                    stack.push(t);
                }
            }
        }
        seen
    }

    /// One `from -> to` line per edge, then isolated nodes.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (from, to) in self.edges() {
            out.push_str(&format!("{from} -> {to}\n"));
        }
        for (i, name) in self.nodes.iter().enumerate() {
            if !self.edges.iter().any(|&(f, t)| f == i || t == i) {
                out.push_str(&format!("{name}\n"));
            }
        }
        out
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_orders_in_sequence() {
        let graph = StageGraph::chain(&["extract", "load", "transform"]).unwrap();
        assert_eq!(
            graph.topological_order().unwrap(),
            vec!["extract", "load", "transform"]
        );
    }

    #[test]
    fn diamond_respects_every_edge() {
        let mut graph = StageGraph::new();
        for name in ["visualize", "test", "transform", "load"] {
            graph.add_node(name).unwrap();
        }
        graph.add_edge("load", "transform").unwrap();
        graph.add_edge("transform", "test").unwrap();
        graph.add_edge("transform", "visualize").unwrap();

        let order = graph.topological_order().unwrap();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("load") < pos("transform"));
        assert!(pos("transform") < pos("test"));
        assert!(pos("transform") < pos("visualize"));
    }

    #[test]
    fn duplicate_and_unknown_nodes_are_rejected() {
        let mut graph = StageGraph::chain(&["extract", "load"]).unwrap();
        assert_eq!(
            graph.add_node("load"),
            Err(GraphError::DuplicateNode("load".into()))
        );
        assert!(matches!(
            graph.add_edge("load", "publish"),
            Err(GraphError::UnknownNode { missing, .. }) if missing == "publish"
        ));
    }

    #[test]
    fn downstream_is_transitive() {
        let graph =
            StageGraph::chain(&["extract", "load", "transform", "test", "visualize"]).unwrap();
        let downstream: Vec<String> = graph.downstream_of("transform").into_iter().collect();
        assert_eq!(downstream, vec!["test", "visualize"]);
        assert!(graph.downstream_of("visualize").is_empty());
    }

    #[test]
    fn render_lists_edges() {
        let graph = StageGraph::chain(&["a", "b"]).unwrap();
        assert_eq!(graph.render(), "a -> b\n");
    }
}
