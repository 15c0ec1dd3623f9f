//! Synchronized access to the shared task graph.
//!
//! The `TaskBoard` is the only way workers touch the graph. Each operation
//! takes the write lock once and does its check-and-mutate inside it, so a
//! claim is a single indivisible select-and-mark step and two workers can
//! never receive the same task.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};

use crate::core::{Task, TaskGraph, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::pool::WorkerId;
use crate::orchestration::queue::{QueueState, WorkQueue};
use crate::{clog, clog_debug, clog_warn};

/// Worker-level retries before a task is blocked.
pub const MAX_WORKER_RETRIES: u32 = 3;

/// What happened to a task after a worker failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back in the pool with this many retries consumed.
    Requeued { retries: u32 },
    /// Out of retries.
    Blocked,
}

#[derive(Clone)]
pub struct TaskBoard {
    graph: Arc<RwLock<TaskGraph>>,
    queue: WorkQueue,
    changed: Arc<Notify>,
}

impl TaskBoard {
    pub fn new(graph: TaskGraph, queue: WorkQueue) -> Self {
        Self {
            graph: Arc::new(RwLock::new(graph)),
            queue,
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn queue(&self) -> WorkQueue {
        self.queue
    }

    /// Signalled whenever a task is released back or finishes.
    pub fn changed(&self) -> Arc<Notify> {
        Arc::clone(&self.changed)
    }

    /// Atomically select the best eligible task and mark it claimed.
    pub async fn claim(&self, worker: WorkerId) -> Option<Task> {
        let mut graph = self.graph.write().await;
        let id = self.queue.select_next(&graph)?.id.clone();
        let task = graph.get_mut(&id)?;
        task.claim(worker);
        clog!("{} claimed {}", worker, id);
        Some(task.clone())
    }

    /// Move a claimed task to in-progress.
    pub async fn start(&self, worker: WorkerId, id: &TaskId) -> Result<()> {
        let mut graph = self.graph.write().await;
        let task = Self::owned(&mut graph, worker, id)?;
        if task.status != TaskStatus::Claimed {
            return Err(Error::ClaimConflict {
                task: id.clone(),
                worker,
            });
        }
        task.start();
        clog_debug!("{} started {}", worker, id);
        Ok(())
    }

    /// Mark a task complete and release ownership.
    ///
    /// Returns dependents that became eligible. They are visible to the next
    /// `claim` from any worker, including this one.
    pub async fn complete(
        &self,
        worker: WorkerId,
        id: &TaskId,
        changed_paths: Vec<PathBuf>,
    ) -> Result<Vec<TaskId>> {
        let unblocked = {
            let mut graph = self.graph.write().await;
            Self::owned(&mut graph, worker, id)?.complete(changed_paths);
            let unblocked: Vec<TaskId> = graph
                .dependents(id)
                .into_iter()
                .filter(|t| WorkQueue::is_eligible(&graph, t))
                .map(|t| t.id.clone())
                .collect();
            clog!("{} completed {} (unblocked: {:?})", worker, id, unblocked);
            unblocked
        };
        self.changed.notify_waiters();
        Ok(unblocked)
    }

    /// Record a worker failure: requeue with one more retry, or block once
    /// the retry budget is spent.
    pub async fn fail(&self, worker: WorkerId, id: &TaskId, error: &str) -> Result<RetryOutcome> {
        let outcome = {
            let mut graph = self.graph.write().await;
            let task = Self::owned(&mut graph, worker, id)?;
            Self::retry_or_block(task, error)
        };
        self.changed.notify_waiters();
        Ok(outcome)
    }

    /// Block a task whose work could not be made to pass its gates.
    pub async fn block(&self, worker: WorkerId, id: &TaskId, reason: &str) -> Result<()> {
        {
            let mut graph = self.graph.write().await;
            Self::owned(&mut graph, worker, id)?;
            WorkQueue::mark_blocked(&mut graph, id, reason)?;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Hand a task back untouched, without consuming a retry.
    pub async fn release(&self, worker: WorkerId, id: &TaskId) -> Result<()> {
        {
            let mut graph = self.graph.write().await;
            Self::owned(&mut graph, worker, id)?.reset();
            clog_debug!("{} released {}", worker, id);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Recover every task held by a worker that died without reporting.
    /// Each counts as a worker failure.
    pub async fn recover(&self, worker: WorkerId, error: &str) -> Vec<(TaskId, RetryOutcome)> {
        let recovered = {
            let mut graph = self.graph.write().await;
            let held: Vec<TaskId> = graph
                .tasks()
                .filter(|t| t.owner == Some(worker) && t.status.is_active())
                .map(|t| t.id.clone())
                .collect();
            held.into_iter()
                .filter_map(|id| {
                    let task = graph.get_mut(&id)?;
                    Some((id, Self::retry_or_block(task, error)))
                })
                .collect()
        };
        self.changed.notify_waiters();
        recovered
    }

    fn retry_or_block(task: &mut Task, error: &str) -> RetryOutcome {
        if task.retries >= MAX_WORKER_RETRIES {
            clog_warn!(
                "Task {} blocked after {} worker retries: {}",
                task.id,
                task.retries,
                error
            );
            task.block(&format!(
                "worker retries exhausted ({}): {}",
                task.retries, error
            ));
            RetryOutcome::Blocked
        } else {
            task.retries += 1;
            clog_warn!(
                "Task {} returned to pending (retry {}/{}): {}",
                task.id,
                task.retries,
                MAX_WORKER_RETRIES,
                error
            );
            task.reset();
            RetryOutcome::Requeued {
                retries: task.retries,
            }
        }
    }

    /// The task, provided `worker` owns it and holds it actively.
    fn owned<'a>(graph: &'a mut TaskGraph, worker: WorkerId, id: &TaskId) -> Result<&'a mut Task> {
        let task = graph.task_mut(id)?;
        if task.owner != Some(worker) || !task.status.is_active() {
            return Err(Error::ClaimConflict {
                task: id.clone(),
                worker,
            });
        }
        Ok(task)
    }

    pub async fn state(&self) -> QueueState {
        let graph = self.graph.read().await;
        self.queue.state(&graph)
    }

    /// Run a read-only closure against a consistent view.
    pub async fn read<R>(&self, f: impl FnOnce(&TaskGraph) -> R) -> R {
        let graph = self.graph.read().await;
        f(&graph)
    }

    /// Coordinator-side mutation (approvals, resolutions). Wakes waiting
    /// workers afterwards.
    pub async fn update<R>(&self, f: impl FnOnce(&mut TaskGraph) -> R) -> R {
        let result = {
            let mut graph = self.graph.write().await;
            f(&mut graph)
        };
        self.changed.notify_waiters();
        result
    }

    pub async fn snapshot(&self) -> TaskGraph {
        self.graph.read().await.clone()
    }
}
