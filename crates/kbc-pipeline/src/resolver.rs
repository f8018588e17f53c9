//! Dependency resolution
//!
//! Produces a topological order of the stage graph. Among stages whose
//! dependencies are all placed, the one declared first goes next, so the
//! order is a pure function of the definition.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;

use kbc_core::{ConfigError, KbcError, PipelineDefinition, Result};

/// Resolved execution order of a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    order: Vec<String>,
    #[serde(skip)]
    dependencies: HashMap<String, Vec<String>>,
    #[serde(skip)]
    dependents: HashMap<String, Vec<String>>,
}

impl ExecutionPlan {
    /// Stage names, each after all of its dependencies
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Index of a stage in the order
    pub fn position(&self, stage: &str) -> Option<usize> {
        self.order.iter().position(|s| s == stage)
    }

    /// Declared dependencies of a stage (deduplicated)
    pub fn dependencies(&self, stage: &str) -> &[String] {
        self.dependencies.get(stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Stages that declare a direct dependency on `stage`, in plan order
    pub fn dependents(&self, stage: &str) -> &[String] {
        self.dependents.get(stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every stage that transitively depends on `stage`, in plan order
    pub fn descendants(&self, stage: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([stage]);

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(current) {
                if seen.insert(dependent.as_str()) {
                    queue.push_back(dependent);
                }
            }
        }

        self.order
            .iter()
            .filter(|s| seen.contains(s.as_str()))
            .cloned()
            .collect()
    }

    /// Group the order into waves: a stage's wave is one past the latest
    /// wave of its dependencies. Stages within a wave are independent.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<String>> = Vec::new();

        for stage in &self.order {
            let level = self
                .dependencies(stage)
                .iter()
                .filter_map(|d| depth.get(d.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(stage, level);

            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(stage.clone());
        }

        levels
    }
}

/// Resolve the execution order of a pipeline definition
pub fn resolve(definition: &PipelineDefinition) -> Result<ExecutionPlan> {
    let graph: Vec<(&str, &[String])> = definition
        .stages()
        .iter()
        .map(|s| (s.name.as_str(), s.dependencies.as_slice()))
        .collect();
    resolve_graph(&graph)
}

/// Resolve a graph given as (stage, dependencies) pairs in declaration order
pub fn resolve_graph<N, D>(graph: &[(N, D)]) -> Result<ExecutionPlan>
where
    N: AsRef<str>,
    D: AsRef<[String]>,
{
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(graph.len());
    for (i, (name, _)) in graph.iter().enumerate() {
        if index.insert(name.as_ref(), i).is_some() {
            return Err(ConfigError::DuplicateStage(name.as_ref().to_string()).into());
        }
    }

    // Unknown references are reported before any cycle
    for (name, deps) in graph {
        if let Some(missing) = deps.as_ref().iter().find(|d| !index.contains_key(d.as_str())) {
            return Err(KbcError::UnknownDependency {
                stage: name.as_ref().to_string(),
                missing: missing.clone(),
            });
        }
    }

    // Edges point from a stage to each stage it depends on
    let mut dag: DiGraph<usize, ()> = DiGraph::with_capacity(graph.len(), graph.len());
    let nodes: Vec<NodeIndex> = (0..graph.len()).map(|i| dag.add_node(i)).collect();
    let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();

    for (i, (name, deps)) in graph.iter().enumerate() {
        let mut unique = Vec::new();
        for dep in deps.as_ref() {
            if unique.contains(dep) {
                continue;
            }
            dag.add_edge(nodes[i], nodes[index[dep.as_str()]], ());
            unique.push(dep.clone());
        }
        dependencies.insert(name.as_ref().to_string(), unique);
    }

    let mut remaining: Vec<usize> = nodes
        .iter()
        .map(|&n| dag.neighbors_directed(n, Direction::Outgoing).count())
        .collect();
    let mut ready: BTreeSet<usize> = (0..graph.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(graph.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for dependent in dag.neighbors_directed(nodes[next], Direction::Incoming) {
            let d = dag[dependent];
            remaining[d] -= 1;
            if remaining[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() < graph.len() {
        let members = cycle_witness(&dag)
            .into_iter()
            .map(|i| graph[i].0.as_ref().to_string())
            .collect();
        return Err(KbcError::CyclicDependency { members });
    }

    let order: Vec<String> = order
        .into_iter()
        .map(|i| graph[i].0.as_ref().to_string())
        .collect();

    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for stage in &order {
        for dep in &dependencies[stage] {
            dependents.entry(dep.clone()).or_default().push(stage.clone());
        }
    }

    tracing::debug!(order = ?order, "Resolved execution order");

    Ok(ExecutionPlan {
        order,
        dependencies,
        dependents,
    })
}

/// Find one cycle, starting from the earliest-declared stage on any cycle.
///
/// Returned members are in dependency direction: each depends on the next,
/// and the last depends on the first.
fn cycle_witness(dag: &DiGraph<usize, ()>) -> Vec<usize> {
    let cyclic = tarjan_scc(dag).into_iter().filter(|scc| {
        scc.len() > 1 || scc.first().is_some_and(|&n| dag.contains_edge(n, n))
    });
    let Some(component) = cyclic.min_by_key(|scc| scc.iter().map(|&n| dag[n]).min()) else {
        return Vec::new();
    };

    let members: HashSet<NodeIndex> = component.iter().copied().collect();
    let Some(start) = component.iter().copied().min_by_key(|&n| dag[n]) else {
        return Vec::new();
    };

    if dag.contains_edge(start, start) {
        return vec![dag[start]];
    }

    // Shortest walk back to `start` inside the component
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    let mut last = None;

    'search: while let Some(node) = queue.pop_front() {
        let mut next: Vec<NodeIndex> = dag
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|n| members.contains(n))
            .collect();
        next.sort_by_key(|&n| dag[n]);

        for n in next {
            if n == start {
                last = Some(node);
                break 'search;
            }
            if !parent.contains_key(&n) {
                parent.insert(n, node);
                queue.push_back(n);
            }
        }
    }

    let mut path = Vec::new();
    let mut cursor = last;
    while let Some(node) = cursor {
        path.push(dag[node]);
        cursor = if node == start {
            None
        } else {
            parent.get(&node).copied()
        };
    }
    path.reverse();
    path
}
