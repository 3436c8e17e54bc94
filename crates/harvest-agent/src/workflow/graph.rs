use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::IndexMap;

use harvest_core::error::{HarvestError, Result};

use super::edge::{Edge, Target};
use super::phase::Phase;

/// The outcome of resolving a node's outgoing edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Label chosen by the guard, for conditional edges.
    pub label: Option<&'static str>,
    pub target: Target,
}

/// A validated node/edge table.
///
/// Nodes keep their insertion order, which is also the tie-break order for
/// the topological compile.
pub struct WorkflowGraph<S> {
    name: String,
    entry: String,
    nodes: IndexMap<String, Arc<dyn Phase<S>>>,
    edges: IndexMap<String, Edge<S>>,
}

impl<S> std::fmt::Debug for WorkflowGraph<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("edges", &self.edges.values().collect::<Vec<_>>())
            .finish()
    }
}

impl<S> WorkflowGraph<S> {
    pub fn builder(name: impl Into<String>) -> GraphBuilder<S> {
        GraphBuilder {
            name: name.into(),
            entry: None,
            nodes: vec![],
            edges: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, name: &str) -> Result<&Arc<dyn Phase<S>>> {
        self.nodes
            .get(name)
            .ok_or_else(|| HarvestError::PhaseNotFound(name.to_string()))
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Resolve where to go after `from`, given the current state.
    ///
    /// A node without an outgoing edge ends the run. A guard returning a label
    /// with no route is an error.
    pub fn route(&self, from: &str, state: &S) -> Result<Route> {
        match self.edges.get(from) {
            None => Ok(Route {
                label: None,
                target: Target::End,
            }),
            Some(Edge::Always { to, .. }) => Ok(Route {
                label: None,
                target: to.clone(),
            }),
            Some(Edge::Conditional { guard, routes, .. }) => {
                let label = guard(state);
                routes
                    .iter()
                    .find(|(l, _)| l == label)
                    .map(|(_, target)| Route {
                        label: Some(label),
                        target: target.clone(),
                    })
                    .ok_or_else(|| HarvestError::UnmappedRoute {
                        phase: from.to_string(),
                        route: label.to_string(),
                    })
            }
        }
    }

    /// Order the nodes so that every edge points forward.
    ///
    /// Fails if the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut indegree: IndexMap<&str, usize> =
            self.nodes.keys().map(|k| (k.as_str(), 0)).collect();
        for edge in self.edges.values() {
            for next in successors(edge) {
                if let Some(d) = indegree.get_mut(next) {
                    *d += 1;
                }
            }
        }

        let mut ready: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(name) = ready.pop_front() {
            order.push(name.to_string());
            let Some(edge) = self.edges.get(name) else {
                continue;
            };
            for next in successors(edge) {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(next);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<&str> = indegree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(k, _)| *k)
                .collect();
            return Err(HarvestError::InvalidGraph(format!(
                "workflow '{}' has a cycle through {}",
                self.name,
                stuck.join(", ")
            )));
        }
        Ok(order)
    }
}

/// Distinct node targets of an edge, in route order.
fn successors<S>(edge: &Edge<S>) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    for name in edge.targets().into_iter().filter_map(Target::as_node) {
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

/// Collects nodes and edges, then validates them into a [`WorkflowGraph`].
pub struct GraphBuilder<S> {
    name: String,
    entry: Option<String>,
    nodes: Vec<Arc<dyn Phase<S>>>,
    edges: Vec<Edge<S>>,
}

impl<S> GraphBuilder<S> {
    pub fn node(mut self, phase: impl Phase<S> + 'static) -> Self {
        self.nodes.push(Arc::new(phase));
        self
    }

    pub fn shared_node(mut self, phase: Arc<dyn Phase<S>>) -> Self {
        self.nodes.push(phase);
        self
    }

    pub fn edge(mut self, edge: Edge<S>) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    pub fn build(self) -> Result<WorkflowGraph<S>> {
        let invalid = |msg: String| HarvestError::InvalidGraph(format!("{}: {}", self.name, msg));

        let mut nodes: IndexMap<String, Arc<dyn Phase<S>>> = IndexMap::new();
        for phase in &self.nodes {
            let name = phase.name().to_string();
            if nodes.contains_key(&name) {
                return Err(invalid(format!("duplicate node '{}'", name)));
            }
            nodes.insert(name, phase.clone());
        }

        let entry = self
            .entry
            .clone()
            .ok_or_else(|| invalid("no entry node".to_string()))?;
        if !nodes.contains_key(&entry) {
            return Err(invalid(format!("entry node '{}' does not exist", entry)));
        }

        let mut edges: IndexMap<String, Edge<S>> = IndexMap::new();
        for edge in &self.edges {
            let from = edge.source();
            if !nodes.contains_key(from) {
                return Err(invalid(format!("edge from unknown node '{}'", from)));
            }
            if edges.contains_key(from) {
                return Err(invalid(format!("node '{}' has more than one outgoing edge", from)));
            }
            if let Edge::Conditional { routes, .. } = edge {
                if routes.is_empty() {
                    return Err(invalid(format!("conditional edge from '{}' has no routes", from)));
                }
            }
            for target in edge.targets() {
                if let Some(to) = target.as_node() {
                    if !nodes.contains_key(to) {
                        return Err(invalid(format!("edge from '{}' to unknown node '{}'", from, to)));
                    }
                }
            }
            edges.insert(from.to_string(), edge.clone());
        }

        Ok(WorkflowGraph {
            name: self.name,
            entry,
            nodes,
            edges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::phase::{FnPhase, PhaseReport, PhaseResult};

    fn noop(name: &str) -> FnPhase<fn(&mut u32) -> PhaseResult> {
        let f: fn(&mut u32) -> PhaseResult = |_| Ok(PhaseReport::default());
        FnPhase::new(name, f)
    }

    fn parity(n: &u32) -> &'static str {
        if n % 2 == 0 {
            "even"
        } else {
            "odd"
        }
    }

    fn unknown(_: &u32) -> &'static str {
        "sideways"
    }

    #[test]
    fn test_graph_construction() {
        let graph = WorkflowGraph::builder("demo")
            .node(noop("a"))
            .node(noop("b"))
            .node(noop("c"))
            .edge(Edge::always("a", Target::node("b")))
            .edge(Edge::conditional(
                "b",
                parity,
                [("even", Target::node("c")), ("odd", Target::End)],
            ))
            .entry("a")
            .build()
            .unwrap();

        assert_eq!(graph.entry(), "a");
        assert_eq!(graph.node_names().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(graph.topological_order().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(
            graph.route("b", &2).unwrap(),
            Route {
                label: Some("even"),
                target: Target::node("c")
            }
        );
        assert_eq!(graph.route("b", &1).unwrap().target, Target::End);
        assert_eq!(graph.route("c", &1).unwrap().target, Target::End);
    }

    #[test]
    fn test_missing_entry_rejected() {
        let err = WorkflowGraph::builder("demo")
            .node(noop("a"))
            .entry("z")
            .build()
            .unwrap_err();
        assert!(matches!(err, HarvestError::InvalidGraph(_)));

        let err = WorkflowGraph::<u32>::builder("demo").node(noop("a")).build().unwrap_err();
        assert!(err.to_string().contains("no entry"));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let err = WorkflowGraph::builder("demo")
            .node(noop("a"))
            .edge(Edge::always("a", Target::node("ghost")))
            .entry("a")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_edges_and_nodes_rejected() {
        let err = WorkflowGraph::builder("demo")
            .node(noop("a"))
            .node(noop("b"))
            .edge(Edge::always("a", Target::node("b")))
            .edge(Edge::always("a", Target::End))
            .entry("a")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("more than one"));

        let err = WorkflowGraph::builder("demo")
            .node(noop("a"))
            .node(noop("a"))
            .entry("a")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_unmapped_route_is_error() {
        let graph = WorkflowGraph::builder("demo")
            .node(noop("a"))
            .edge(Edge::conditional("a", unknown, [("up", Target::End)]))
            .entry("a")
            .build()
            .unwrap();
        let err = graph.route("a", &0).unwrap_err();
        assert!(matches!(err, HarvestError::UnmappedRoute { .. }));
    }

    #[test]
    fn test_cycle_detected_by_topological_order() {
        let graph = WorkflowGraph::builder("loop")
            .node(noop("a"))
            .node(noop("b"))
            .edge(Edge::always("a", Target::node("b")))
            .edge(Edge::conditional(
                "b",
                parity,
                [("even", Target::node("a")), ("odd", Target::End)],
            ))
            .entry("a")
            .build()
            .unwrap();
        assert!(matches!(
            graph.topological_order(),
            Err(HarvestError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_two_routes_to_same_node() {
        let graph = WorkflowGraph::builder("fork")
            .node(noop("a"))
            .node(noop("b"))
            .edge(Edge::conditional(
                "a",
                parity,
                [("even", Target::node("b")), ("odd", Target::node("b"))],
            ))
            .entry("a")
            .build()
            .unwrap();
        assert_eq!(graph.topological_order().unwrap(), vec!["a", "b"]);
    }
}
