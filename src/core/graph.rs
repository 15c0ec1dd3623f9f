//! Task dependency graph.
//!
//! Edges run from a blocker to the task it blocks. The graph refuses any edge
//! that would close a cycle, so the relation stays a DAG at every point in
//! time; a rejected insertion leaves the graph exactly as it was.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The task dependency graph.
///
/// Nodes are tasks in insertion order; `NodeIndex` order doubles as the
/// stable insertion-order tie-break since nodes are never removed.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "GraphSnapshot", into = "GraphSnapshot")]
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

/// Serialized form: tasks in insertion order, each carrying `blocked_by`.
#[derive(Serialize, Deserialize)]
struct GraphSnapshot {
    tasks: Vec<Task>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from tasks whose `blocked_by` sets name the edges.
    ///
    /// All tasks are inserted first so edges may point forward.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = Self::new();
        let mut edges = Vec::new();
        for task in tasks {
            for blocker in &task.blocked_by {
                edges.push((blocker.clone(), task.id.clone()));
            }
            graph.add_task(task)?;
        }
        for (blocker, dependent) in edges {
            graph.add_dependency(&blocker, &dependent)?;
        }
        Ok(graph)
    }

    /// Insert a task. Any `blocked_by`/`blocks` it carries are discarded;
    /// edges are added with [`TaskGraph::add_dependency`].
    pub fn add_task(&mut self, mut task: Task) -> Result<()> {
        if self.index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        task.blocked_by.clear();
        task.blocks.clear();
        let id = task.id.clone();
        let node = self.graph.add_node(task);
        self.index.insert(id, node);
        Ok(())
    }

    /// Record that `dependent` may not start until `blocker` completes.
    ///
    /// Adding an existing edge is a no-op.
    ///
    /// # Errors
    /// - `TaskNotFound` if either task is unknown
    /// - `DependencyCycle` if the edge would close a cycle (including a
    ///   self-edge); the graph is left unchanged
    pub fn add_dependency(&mut self, blocker: &TaskId, dependent: &TaskId) -> Result<()> {
        let from = self.node(blocker)?;
        let to = self.node(dependent)?;

        if self.graph.find_edge(from, to).is_some() {
            return Ok(());
        }
        if from == to || has_path_connecting(&self.graph, to, from, None) {
            return Err(Error::DependencyCycle {
                blocker: blocker.clone(),
                dependent: dependent.clone(),
            });
        }

        self.graph.add_edge(from, to, ());
        self.graph[to].blocked_by.insert(blocker.clone());
        self.graph[from].blocks.insert(dependent.clone());
        Ok(())
    }

    fn node(&self, id: &TaskId) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&node| &self.graph[node])
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let node = *self.index.get(id)?;
        self.graph.node_weight_mut(node)
    }

    pub fn task(&self, id: &TaskId) -> Result<&Task> {
        self.get(id).ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        let node = self.node(id)?;
        Ok(&mut self.graph[node])
    }

    /// Insertion position of a task, used as the final ordering key.
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.index.get(id).map(|node| node.index())
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_indices().map(move |node| &self.graph[node])
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks().map(|t| t.id.clone()).collect()
    }

    /// Direct blockers of a task.
    pub fn blockers(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks directly blocked by this one.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.index.get(id) {
            Some(&node) => {
                let mut found: Vec<NodeIndex> =
                    self.graph.neighbors_directed(node, direction).collect();
                found.sort();
                found.into_iter().map(|n| &self.graph[n]).collect()
            }
            None => Vec::new(),
        }
    }

    /// Every task reachable downstream of `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut found = Vec::new();
        while let Some(node) = bfs.next(&self.graph) {
            if node != start {
                found.push(node);
            }
        }
        found.sort();
        found
            .into_iter()
            .map(|n| self.graph[n].id.clone())
            .collect()
    }

    /// Blockers of `id` that are not yet complete.
    pub fn remaining_blockers(&self, id: &TaskId) -> usize {
        self.blockers(id)
            .iter()
            .filter(|t| !t.status.is_complete())
            .count()
    }

    /// Every blocker of `id` is complete.
    pub fn dependencies_met(&self, id: &TaskId) -> bool {
        self.contains(id) && self.remaining_blockers(id) == 0
    }

    /// Any blocker, direct or not, has failed; the task can never run.
    pub fn has_failed_ancestor(&self, id: &TaskId) -> bool {
        let Some(&node) = self.index.get(id) else {
            return false;
        };
        let reversed = petgraph::visit::Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, node);
        while let Some(n) = bfs.next(reversed) {
            if n != node && matches!(self.graph[n].status, TaskStatus::Failed { .. }) {
                return true;
            }
        }
        false
    }

    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            Error::CorruptState(format!(
                "dependency cycle through {}",
                self.graph[cycle.node_id()].id
            ))
        })?;
        Ok(order
            .into_iter()
            .map(|n| self.graph[n].id.clone())
            .collect())
    }

    /// Count of tasks per status label.
    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks() {
            *counts.entry(task.status.label()).or_insert(0) += 1;
        }
        counts
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks().all(|t| t.status.is_terminal())
    }
}

impl TryFrom<GraphSnapshot> for TaskGraph {
    type Error = Error;

    fn try_from(snapshot: GraphSnapshot) -> Result<Self> {
        TaskGraph::from_tasks(snapshot.tasks).map_err(|e| match e {
            Error::CorruptState(msg) => Error::CorruptState(msg),
            other => Error::CorruptState(format!("invalid task graph: {}", other)),
        })
    }
}

impl From<TaskGraph> for GraphSnapshot {
    fn from(graph: TaskGraph) -> Self {
        let (nodes, _) = graph.graph.into_nodes_edges();
        GraphSnapshot {
            tasks: nodes.into_iter().map(|n| n.weight).collect(),
        }
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("task_count", &self.len())
            .field("dependency_count", &self.dependency_count())
            .finish()
    }
}
