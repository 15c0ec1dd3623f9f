//! Work queue: the ordered view of tasks that may be claimed next.
//!
//! The queue stores nothing. Every answer is computed from the task graph
//! plus a tie-break rule, so it can never drift out of sync with the graph.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

use crate::core::{Task, TaskGraph, TaskId, TaskStatus};
use crate::error::Result;
use crate::{clog, clog_debug};

/// Final ordering key when priority and remaining blockers are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Earlier-inserted tasks first.
    #[default]
    InsertionOrder,
    /// Tasks that directly block more work first, then insertion order.
    MostUnblocking,
}

/// What the queue can offer right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueState {
    /// The highest-ranked eligible task.
    Ready(TaskId),
    /// Nothing eligible, but workers still hold tasks whose completion may
    /// unblock more.
    InFlight,
    /// Eligible tasks exist but every one is waiting for sign-off.
    AwaitingApproval(Vec<TaskId>),
    /// Nothing can make progress without outside input.
    Blocked(Vec<TaskId>),
    /// Every task is complete or failed.
    Drained,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkQueue {
    tie_break: TieBreak,
}

impl WorkQueue {
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Pending, every blocker complete, and not waiting for approval.
    pub fn is_eligible(graph: &TaskGraph, task: &Task) -> bool {
        task.status == TaskStatus::Pending
            && !task.awaiting_approval()
            && graph.dependencies_met(&task.id)
    }

    fn rank<'a>(&self, graph: &'a TaskGraph, mut tasks: Vec<&'a Task>) -> Vec<&'a Task> {
        tasks.sort_by_key(|task| {
            let unblocking = match self.tie_break {
                TieBreak::InsertionOrder => 0,
                TieBreak::MostUnblocking => task.blocks.len(),
            };
            (
                task.priority,
                graph.remaining_blockers(&task.id),
                Reverse(unblocking),
                graph.position(&task.id),
            )
        });
        tasks
    }

    /// All eligible tasks, best first.
    pub fn eligible<'a>(&self, graph: &'a TaskGraph) -> Vec<&'a Task> {
        let ready = graph
            .tasks()
            .filter(|task| Self::is_eligible(graph, task))
            .collect();
        self.rank(graph, ready)
    }

    /// Every pending task in queue order, eligible or not.
    pub fn backlog<'a>(&self, graph: &'a TaskGraph) -> Vec<&'a Task> {
        let pending = graph
            .tasks()
            .filter(|task| task.status == TaskStatus::Pending)
            .collect();
        self.rank(graph, pending)
    }

    /// Pending tasks whose blockers are done but which still need sign-off.
    pub fn awaiting_approval<'a>(&self, graph: &'a TaskGraph) -> Vec<&'a Task> {
        let waiting = graph
            .tasks()
            .filter(|task| {
                task.status == TaskStatus::Pending
                    && task.awaiting_approval()
                    && graph.dependencies_met(&task.id)
            })
            .collect();
        self.rank(graph, waiting)
    }

    /// The single highest-ranked eligible task.
    pub fn select_next<'a>(&self, graph: &'a TaskGraph) -> Option<&'a Task> {
        self.eligible(graph).into_iter().next()
    }

    /// Classify the queue. Distinguishes "all done" from "stuck" so the
    /// caller never spins on an empty selection.
    pub fn state(&self, graph: &TaskGraph) -> QueueState {
        if let Some(task) = self.select_next(graph) {
            return QueueState::Ready(task.id.clone());
        }
        if graph.all_terminal() {
            return QueueState::Drained;
        }
        if graph.tasks().any(|t| t.status.is_active()) {
            return QueueState::InFlight;
        }
        let waiting = self.awaiting_approval(graph);
        if !waiting.is_empty() {
            return QueueState::AwaitingApproval(waiting.iter().map(|t| t.id.clone()).collect());
        }
        QueueState::Blocked(Self::stuck(graph))
    }

    /// Tasks needing a decision: explicitly blocked ones, or pending tasks
    /// downstream of a failure when nothing is explicitly blocked.
    fn stuck(graph: &TaskGraph) -> Vec<TaskId> {
        let blocked: Vec<TaskId> = graph
            .tasks()
            .filter(|t| matches!(t.status, TaskStatus::Blocked { .. }))
            .map(|t| t.id.clone())
            .collect();
        if !blocked.is_empty() {
            return blocked;
        }
        graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Pending && graph.has_failed_ancestor(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Mark a task blocked. Idempotent; a task that is already blocked keeps
    /// its original reason.
    ///
    /// Returns the direct dependents whose eligibility depends on this task.
    pub fn mark_blocked(graph: &mut TaskGraph, id: &TaskId, reason: &str) -> Result<Vec<TaskId>> {
        let task = graph.task_mut(id)?;
        if !matches!(task.status, TaskStatus::Blocked { .. }) {
            clog!("Task {} blocked: {}", id, reason);
            task.block(reason);
        }
        Ok(Self::dependents_of(graph, id))
    }

    /// Return a blocked task to pending. Idempotent; tasks in any other
    /// status are left alone.
    ///
    /// Returns the direct dependents, re-checked against the new state.
    pub fn mark_unblocked(graph: &mut TaskGraph, id: &TaskId) -> Result<Vec<TaskId>> {
        let task = graph.task_mut(id)?;
        if matches!(task.status, TaskStatus::Blocked { .. }) {
            clog!("Task {} unblocked", id);
            task.reset();
        }
        Ok(Self::dependents_of(graph, id))
    }

    fn dependents_of(graph: &TaskGraph, id: &TaskId) -> Vec<TaskId> {
        let dependents: Vec<TaskId> = graph.dependents(id).iter().map(|t| t.id.clone()).collect();
        for dep in &dependents {
            clog_debug!(
                "Dependent {} of {}: eligible={}",
                dep,
                id,
                graph
                    .get(dep)
                    .map(|t| Self::is_eligible(graph, t))
                    .unwrap_or(false)
            );
        }
        dependents
    }
}
