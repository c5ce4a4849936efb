//! Task graph
//!
//! A pipeline's steps form a directed acyclic graph: nodes are steps, edges
//! point from an upstream step to the step that waits on it. The graph is
//! validated once at construction (unique ids, known endpoints, acyclic,
//! single root, everything reachable) and is immutable afterwards, so the
//! executor can rely on the precomputed topological order.

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::domain::step::Step;
use crate::error::DefinitionError;

/// Directed dependency `upstream -> downstream`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub upstream: String,
    pub downstream: String,
}

impl Edge {
    pub fn new(upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
        }
    }
}

/// Serialized form of a graph, validated on the way in
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphSpec {
    steps: Vec<Step>,
    edges: Vec<Edge>,
}

/// Validated DAG of steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "GraphSpec", into = "GraphSpec")]
pub struct TaskGraph {
    steps: Vec<Step>,
    edges: Vec<Edge>,
    /// Step indices in execution order
    order: Vec<usize>,
}

impl TaskGraph {
    /// Builds and validates a graph
    pub fn new(steps: Vec<Step>, edges: Vec<Edge>) -> Result<Self, DefinitionError> {
        if steps.is_empty() {
            return Err(DefinitionError::invalid_field(
                "steps",
                "a pipeline needs at least one step",
            ));
        }

        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(DefinitionError::invalid_field(
                    format!("steps[{}].id", i),
                    "step id cannot be empty",
                ));
            }
            if index.insert(step.id.as_str(), i).is_some() {
                return Err(DefinitionError::DuplicateStep(step.id.clone()));
            }
        }

        let mut seen_edges = HashSet::with_capacity(edges.len());
        for edge in &edges {
            for endpoint in [&edge.upstream, &edge.downstream] {
                if !index.contains_key(endpoint.as_str()) {
                    return Err(DefinitionError::UnknownStep {
                        from: edge.upstream.clone(),
                        to: edge.downstream.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
            if edge.upstream == edge.downstream {
                return Err(DefinitionError::SelfDependency(edge.upstream.clone()));
            }
            if !seen_edges.insert(edge) {
                return Err(DefinitionError::DuplicateEdge(
                    edge.upstream.clone(),
                    edge.downstream.clone(),
                ));
            }
        }

        let graph = dependency_graph(steps.len(), &edges, &index);
        let order = topological_order(&graph, &steps)?;

        let roots: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|&n| {
                graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect();
        if roots.len() != 1 {
            return Err(DefinitionError::RootCount(
                roots.iter().map(|n| steps[n.index()].id.clone()).collect(),
            ));
        }
        let root = roots[0];

        let mut reachable = HashSet::with_capacity(steps.len());
        let mut dfs = Dfs::new(&graph, root);
        while let Some(node) = dfs.next(&graph) {
            reachable.insert(node.index());
        }
        let unreachable: Vec<String> = (0..steps.len())
            .filter(|i| !reachable.contains(i))
            .map(|i| steps[i].id.clone())
            .collect();
        if !unreachable.is_empty() {
            return Err(DefinitionError::Unreachable {
                root: steps[root.index()].id.clone(),
                unreachable,
            });
        }

        Ok(Self {
            steps,
            edges,
            order,
        })
    }

    /// Steps in declaration order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The single step without upstream dependencies
    pub fn root(&self) -> &Step {
        &self.steps[self.order[0]]
    }

    /// Steps in an order where every step follows all of its upstreams
    pub fn execution_order(&self) -> impl Iterator<Item = &Step> {
        self.order.iter().map(|&i| &self.steps[i])
    }

    /// Ids of the steps `id` waits on
    pub fn upstream_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.downstream == id)
            .map(|e| e.upstream.as_str())
            .collect()
    }

    /// Ids of the steps waiting on `id`
    pub fn downstream_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.upstream == id)
            .map(|e| e.downstream.as_str())
            .collect()
    }
}

impl TryFrom<GraphSpec> for TaskGraph {
    type Error = DefinitionError;

    fn try_from(spec: GraphSpec) -> Result<Self, Self::Error> {
        TaskGraph::new(spec.steps, spec.edges)
    }
}

impl From<TaskGraph> for GraphSpec {
    fn from(graph: TaskGraph) -> Self {
        Self {
            steps: graph.steps,
            edges: graph.edges,
        }
    }
}

/// Builds the petgraph view of the steps; node `i` is `steps[i]`
fn dependency_graph(
    step_count: usize,
    edges: &[Edge],
    index: &HashMap<&str, usize>,
) -> DiGraph<(), ()> {
    let mut graph = DiGraph::with_capacity(step_count, edges.len());
    for _ in 0..step_count {
        graph.add_node(());
    }
    for edge in edges {
        graph.add_edge(
            NodeIndex::new(index[edge.upstream.as_str()]),
            NodeIndex::new(index[edge.downstream.as_str()]),
            (),
        );
    }
    graph
}

/// Topological order of step indices; a cycle reports every step on one
fn topological_order(
    graph: &DiGraph<(), ()>,
    steps: &[Step],
) -> Result<Vec<usize>, DefinitionError> {
    match toposort(graph, None) {
        Ok(sorted) => Ok(sorted.into_iter().map(|n| n.index()).collect()),
        Err(_) => {
            let mut stuck: Vec<usize> = tarjan_scc(graph)
                .into_iter()
                .filter(|component| component.len() > 1)
                .flatten()
                .map(|n| n.index())
                .collect();
            stuck.sort_unstable();
            Err(DefinitionError::Cycle(
                stuck.into_iter().map(|i| steps[i].id.clone()).collect(),
            ))
        }
    }
}
