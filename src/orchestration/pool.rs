//! Worker registry for the swarm.
//!
//! The `WorkerPool` tracks every worker the coordinator has started, enforces
//! the worker bound, and records which task each worker currently holds so a
//! crashed worker's task can be recovered. Status changes are broadcast as
//! [`WorkerEvent`]s.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::core::TaskId;
use crate::error::{Error, Result};
use crate::gates::PipelineReport;
use crate::checkpoint::Checkpoint;

/// Identifier for a worker within one swarm run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Working { task_id: TaskId },
    Stopping,
    Stopped,
}

impl WorkerStatus {
    /// Anything short of a stop acknowledgement counts as active.
    pub fn is_active(&self) -> bool {
        !matches!(self, WorkerStatus::Stopped)
    }
}

/// Events emitted by workers as they progress.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started {
        worker: WorkerId,
    },
    Claimed {
        worker: WorkerId,
        task_id: TaskId,
    },
    Completed {
        worker: WorkerId,
        task_id: TaskId,
        report: Option<PipelineReport>,
    },
    /// The task went back to the pool or was blocked after running out of
    /// retries.
    Failed {
        worker: WorkerId,
        task_id: TaskId,
        error: String,
        blocked: bool,
    },
    /// The per-task gate pipeline could not be brought to pass.
    Unresolved {
        worker: WorkerId,
        task_id: TaskId,
        report: PipelineReport,
    },
    CheckpointCreated {
        worker: WorkerId,
        checkpoint: Checkpoint,
    },
    CheckpointDeferred {
        worker: WorkerId,
        task_id: TaskId,
        reason: String,
    },
    /// Acknowledgement that the worker has left its loop.
    Stopped {
        worker: WorkerId,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub tasks_completed: usize,
}

/// Registry of the workers in one swarm run.
pub struct WorkerPool {
    workers: BTreeMap<WorkerId, WorkerHandle>,
    max_workers: usize,
    next_id: usize,
    event_tx: mpsc::Sender<WorkerEvent>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, event_tx: mpsc::Sender<WorkerEvent>) -> Self {
        Self {
            workers: BTreeMap::new(),
            max_workers,
            next_id: 1,
            event_tx,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<WorkerEvent> {
        self.event_tx.clone()
    }

    /// Register a new idle worker.
    ///
    /// # Errors
    /// `WorkerPoolFull` when the bound is reached.
    pub async fn register(&mut self) -> Result<WorkerId> {
        if !self.has_capacity() {
            return Err(Error::WorkerPoolFull {
                max: self.max_workers,
            });
        }
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        self.workers.insert(
            id,
            WorkerHandle {
                id,
                status: WorkerStatus::Idle,
                tasks_completed: 0,
            },
        );
        let _ = self.event_tx.send(WorkerEvent::Started { worker: id }).await;
        Ok(id)
    }

    pub fn set_status(&mut self, id: WorkerId, status: WorkerStatus) -> Result<()> {
        let handle = self
            .workers
            .get_mut(&id)
            .ok_or(Error::WorkerNotFound { id })?;
        if matches!(handle.status, WorkerStatus::Working { .. })
            && status == WorkerStatus::Idle
        {
            handle.tasks_completed += 1;
        }
        handle.status = status;
        Ok(())
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(&id)
    }

    /// Task held by a worker, if any.
    pub fn task_of(&self, id: WorkerId) -> Option<TaskId> {
        match self.workers.get(&id).map(|h| &h.status) {
            Some(WorkerStatus::Working { task_id }) => Some(task_id.clone()),
            _ => None,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.workers.len() < self.max_workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    /// Workers that have not acknowledged a stop.
    pub fn active(&self) -> Vec<WorkerId> {
        self.workers
            .values()
            .filter(|h| h.status.is_active())
            .map(|h| h.id)
            .collect()
    }

    pub fn working_count(&self) -> usize {
        self.workers
            .values()
            .filter(|h| matches!(h.status, WorkerStatus::Working { .. }))
            .count()
    }

    /// Remove every worker. Refused while any worker still reports itself
    /// active.
    pub fn teardown(&mut self) -> Result<usize> {
        let active = self.active();
        if let Some(id) = active.first() {
            return Err(Error::Validation(format!(
                "teardown refused: {} of {} workers still active (first: {})",
                active.len(),
                self.workers.len(),
                id
            )));
        }
        let removed = self.workers.len();
        self.workers.clear();
        Ok(removed)
    }
}
