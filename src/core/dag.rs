//! Dependency graph over tasks.
//!
//! This module provides the `DependencyGraph` structure that represents task
//! dependencies as a directed acyclic graph. Edges point from a dependency to
//! the task that depends on it, so a task can only start once every incoming
//! edge comes from a resolved task.

use crate::core::task::{TaskId, TaskSpec, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// The task dependency graph.
///
/// Built once per orchestration session and read-only afterward. Nodes hold
/// task identities; task state lives with the orchestrator.
pub struct DependencyGraph {
    /// The underlying directed graph.
    graph: DiGraph<TaskId, ()>,
    /// Index mapping from TaskId to NodeIndex, kept in lexical order.
    index: BTreeMap<TaskId, NodeIndex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    /// Build the graph from task definitions.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Two definitions share a name
    /// - A dependency references an unknown task
    /// - The dependencies form a cycle (the error carries the cycle path)
    pub fn build(specs: &[TaskSpec]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = BTreeMap::new();

        for spec in specs {
            if index.contains_key(&spec.name) {
                return Err(Error::DuplicateTask(spec.name.clone()));
            }
            let node = graph.add_node(spec.name.clone());
            index.insert(spec.name.clone(), node);
        }

        for spec in specs {
            let to = index[&spec.name];
            for dependency in &spec.depends_on {
                let from = *index.get(dependency).ok_or_else(|| Error::UnknownDependency {
                    task: spec.name.clone(),
                    dependency: dependency.clone(),
                })?;
                if graph.find_edge(from, to).is_none() {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let dag = Self { graph, index };

        if is_cyclic_directed(&dag.graph) {
            let path = dag.find_cycle().unwrap_or_default();
            return Err(Error::CyclicDependency { path });
        }

        debug!(
            tasks = dag.len(),
            dependencies = dag.graph.edge_count(),
            "dependency graph built"
        );
        Ok(dag)
    }

    /// Get the number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Direct dependencies of a task, in lexical order.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that directly depend on the given task, in lexical order.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Every task reachable through dependent edges from the given task.
    pub fn transitive_dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<TaskId> = self.dependents(id).into();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents(&next));
            }
        }
        seen
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        ids.sort();
        ids
    }

    fn sorted_dependency_nodes(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut nodes: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        nodes.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        nodes
    }

    /// Depth-first coloring search for a dependency cycle.
    ///
    /// Follows dependency edges, so the returned path reads
    /// `a -> b -> ... -> a` where each task depends on the next.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut color = vec![Color::White; self.graph.node_count()];
        let mut stack = Vec::new();
        for &start in self.index.values() {
            if color[start.index()] == Color::White {
                if let Some(path) = self.visit(start, &mut color, &mut stack) {
                    return Some(path);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        node: NodeIndex,
        color: &mut [Color],
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<TaskId>> {
        color[node.index()] = Color::Gray;
        stack.push(node);

        for dep in self.sorted_dependency_nodes(node) {
            match color[dep.index()] {
                Color::Gray => {
                    let start = stack.iter().position(|n| *n == dep)?;
                    let mut path: Vec<TaskId> =
                        stack[start..].iter().map(|n| self.graph[*n].clone()).collect();
                    path.push(self.graph[dep].clone());
                    return Some(path);
                }
                Color::White => {
                    if let Some(path) = self.visit(dep, color, stack) {
                        return Some(path);
                    }
                }
                Color::Black => {}
            }
        }

        stack.pop();
        color[node.index()] = Color::Black;
        None
    }

    // ========== Scheduling Operations ==========

    /// Get tasks in topological order (respecting dependencies).
    ///
    /// When several tasks become available at once the lexically smallest
    /// identity goes first, so identical input always yields the same order.
    pub fn topological_order(&self) -> Vec<TaskId> {
        let mut in_degree: BTreeMap<&TaskId, usize> = self
            .index
            .iter()
            .map(|(id, &node)| {
                let degree = self
                    .graph
                    .neighbors_directed(node, Direction::Incoming)
                    .count();
                (id, degree)
            })
            .collect();

        let mut frontier: BTreeSet<&TaskId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(id) = frontier.pop_first() {
            order.push(id.clone());
            let node = self.index[id];
            for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                let dependent_id = &self.graph[dependent];
                if let Some(degree) = in_degree.get_mut(dependent_id) {
                    *degree -= 1;
                    if *degree == 0 {
                        frontier.insert(dependent_id);
                    }
                }
            }
        }
        order
    }

    /// Longest dependency chain length (in edges) for every task.
    ///
    /// Tasks with no dependencies have depth 0.
    pub fn depths(&self) -> BTreeMap<TaskId, usize> {
        let mut depths: BTreeMap<TaskId, usize> = BTreeMap::new();
        for id in self.topological_order() {
            let depth = self
                .dependencies(&id)
                .iter()
                .filter_map(|dep| depths.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depths.insert(id, depth);
        }
        depths
    }

    /// Tasks ready to be dispatched.
    ///
    /// A task is ready if it has not started and every dependency is
    /// COMPLETED or PARTIAL. Tasks missing from `statuses` count as PENDING.
    pub fn ready(&self, statuses: &BTreeMap<TaskId, TaskStatus>) -> BTreeSet<TaskId> {
        let status_of = |id: &TaskId| statuses.get(id).copied().unwrap_or_default();
        self.index
            .keys()
            .filter(|id| matches!(status_of(*id), TaskStatus::Pending | TaskStatus::Ready))
            .filter(|id| {
                self.dependencies(id)
                    .iter()
                    .all(|dep| status_of(dep).is_resolved())
            })
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
