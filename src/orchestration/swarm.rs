//! Swarm coordinator.
//!
//! Workers are tokio tasks that loop on [`TaskBoard::claim`]. Each one owns
//! the task it claimed until it reports back, and reports only through the
//! board. The coordinator tracks workers in a [`WorkerPool`], fans their
//! events in over an mpsc channel, and on shutdown waits for every worker to
//! acknowledge the stop before tearing the pool down.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::core::{Task, TaskGraph, TaskId};
use crate::gates::{GatePipeline, PipelineReport, PipelineTarget};
use crate::orchestration::board::{RetryOutcome, TaskBoard};
use crate::orchestration::executor::{ExecutionResult, TaskExecutor};
use crate::orchestration::pool::{WorkerEvent, WorkerId, WorkerPool, WorkerStatus};
use crate::orchestration::queue::{QueueState, WorkQueue};
use crate::util::scopes_overlap;
use crate::{clog, clog_debug, clog_error, clog_warn, Error, Result};

pub const MIN_SWARM_WORKERS: usize = 3;
pub const MAX_SWARM_WORKERS: usize = 20;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The three signals that decide whether to run more than one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmAssessment {
    pub eligible: usize,
    /// First pair of eligible tasks with overlapping scope, if any.
    pub overlap: Option<(TaskId, TaskId)>,
    pub aggregate_estimate: u32,
    pub threshold: u32,
}

impl SwarmAssessment {
    pub fn evaluate(graph: &TaskGraph, queue: &WorkQueue, threshold: u32) -> Self {
        let eligible = queue.eligible(graph);
        let mut overlap = None;
        'outer: for (i, a) in eligible.iter().enumerate() {
            for b in &eligible[i + 1..] {
                if scopes_overlap(&a.scope, &b.scope) {
                    overlap = Some((a.id.clone(), b.id.clone()));
                    break 'outer;
                }
            }
        }
        Self {
            eligible: eligible.len(),
            overlap,
            aggregate_estimate: eligible.iter().map(|t| t.estimate).sum(),
            threshold,
        }
    }

    pub fn activate(&self) -> bool {
        self.eligible >= MIN_SWARM_WORKERS
            && self.overlap.is_none()
            && self.aggregate_estimate > self.threshold
    }
}

/// Bring a requested worker count into range. One stays one; anything more
/// is clamped into the swarm bounds.
pub fn clamp_worker_count(requested: usize) -> usize {
    let clamped = match requested {
        0 | 1 => 1,
        n => n.clamp(MIN_SWARM_WORKERS, MAX_SWARM_WORKERS),
    };
    if clamped != requested {
        clog_warn!("worker_count {} clamped to {}", requested, clamped);
    }
    clamped
}

/// What every worker needs besides the board.
pub struct WorkerContext {
    pub executor: Arc<dyn TaskExecutor>,
    pub pipeline: Option<Arc<GatePipeline>>,
    pub checkpoints: Option<Arc<CheckpointManager>>,
    pub executor_timeout: Duration,
}

/// Receives every worker event on the coordinating task, in order.
#[async_trait]
pub trait SwarmObserver: Send {
    async fn on_event(&mut self, event: &WorkerEvent, board: &TaskBoard) -> Result<()>;
}

/// Observer that ignores everything.
pub struct NoObserver;

#[async_trait]
impl SwarmObserver for NoObserver {
    async fn on_event(&mut self, _event: &WorkerEvent, _board: &TaskBoard) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SwarmSummary {
    pub workers: usize,
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub blocked: Vec<TaskId>,
    pub reports: Vec<PipelineReport>,
    pub checkpoints: Vec<Checkpoint>,
    pub deferred_checkpoints: Vec<TaskId>,
    pub changed_paths: BTreeSet<PathBuf>,
    pub cancelled: bool,
    /// A session-fatal error raised by a worker. The swarm stopped early.
    pub fatal: Option<Error>,
}

pub struct Swarm {
    board: TaskBoard,
    ctx: Arc<WorkerContext>,
    worker_count: usize,
    cancel: CancellationToken,
}

impl Swarm {
    pub fn new(
        board: TaskBoard,
        ctx: WorkerContext,
        worker_count: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            board,
            ctx: Arc::new(ctx),
            worker_count: worker_count.max(1),
            cancel,
        }
    }

    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    /// Run workers until the queue offers nothing more, cancellation is
    /// requested, or a worker hits a session-fatal error.
    pub async fn run(&self, observer: &mut dyn SwarmObserver) -> Result<SwarmSummary> {
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut pool = WorkerPool::new(self.worker_count, tx);
        // Cancelled by the caller or, on a fatal error, by a supervisor.
        let stop = self.cancel.child_token();
        let mut handles = Vec::with_capacity(self.worker_count);

        for _ in 0..self.worker_count {
            let id = pool.register().await?;
            handles.push(tokio::spawn(supervise(
                id,
                self.board.clone(),
                Arc::clone(&self.ctx),
                pool.sender(),
                stop.clone(),
                self.worker_count > 1,
            )));
        }
        clog!("Swarm started with {} workers", self.worker_count);

        let mut summary = SwarmSummary {
            workers: self.worker_count,
            ..SwarmSummary::default()
        };
        let mut stop_sent = false;

        while !pool.active().is_empty() {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    self.record(&mut pool, &mut summary, &event)?;
                    if let Err(e) = observer.on_event(&event, &self.board).await {
                        clog_error!("Swarm observer failed on {:?}: {}", event, e);
                    }
                }
                _ = stop.cancelled(), if !stop_sent => {
                    stop_sent = true;
                    for id in pool.active() {
                        pool.set_status(id, WorkerStatus::Stopping)?;
                    }
                    clog!("Stop requested for {} workers", pool.active().len());
                }
            }
        }

        for result in join_all(handles).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_session_fatal() && summary.fatal.is_none() => {
                    summary.fatal = Some(e);
                }
                Ok(Err(e)) => clog_error!("Worker exited with error: {}", e),
                Err(e) => clog_error!("Worker supervisor failed: {}", e),
            }
        }
        let removed = pool.teardown()?;
        clog_debug!("Swarm torn down ({} workers)", removed);

        let completed: Vec<TaskId> = summary.completed.clone();
        summary.changed_paths = self
            .board
            .read(|graph| {
                completed
                    .iter()
                    .filter_map(|id| graph.get(id))
                    .flat_map(|t| t.changed_paths.iter().cloned())
                    .collect()
            })
            .await;
        summary.cancelled = self.cancel.is_cancelled();
        clog!(
            "Swarm finished: {} completed, {} failed, {} blocked{}",
            summary.completed.len(),
            summary.failed.len(),
            summary.blocked.len(),
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        Ok(summary)
    }

    fn record(
        &self,
        pool: &mut WorkerPool,
        summary: &mut SwarmSummary,
        event: &WorkerEvent,
    ) -> Result<()> {
        let stopping = |pool: &WorkerPool, worker: WorkerId| {
            matches!(pool.get(worker).map(|h| &h.status), Some(WorkerStatus::Stopping))
        };
        match event {
            WorkerEvent::Started { worker } => clog_debug!("{} started", worker),
            WorkerEvent::Claimed { worker, task_id } => {
                if !stopping(pool, *worker) {
                    pool.set_status(
                        *worker,
                        WorkerStatus::Working {
                            task_id: task_id.clone(),
                        },
                    )?;
                }
            }
            WorkerEvent::Completed {
                worker,
                task_id,
                report,
            } => {
                summary.completed.push(task_id.clone());
                if let Some(report) = report {
                    summary.reports.push(report.clone());
                }
                if !stopping(pool, *worker) {
                    pool.set_status(*worker, WorkerStatus::Idle)?;
                }
            }
            WorkerEvent::Failed {
                worker,
                task_id,
                blocked,
                ..
            } => {
                if *blocked {
                    summary.blocked.push(task_id.clone());
                } else {
                    summary.failed.push(task_id.clone());
                }
                if !stopping(pool, *worker) {
                    pool.set_status(*worker, WorkerStatus::Idle)?;
                }
            }
            WorkerEvent::Unresolved {
                worker,
                task_id,
                report,
            } => {
                summary.blocked.push(task_id.clone());
                summary.reports.push(report.clone());
                if !stopping(pool, *worker) {
                    pool.set_status(*worker, WorkerStatus::Idle)?;
                }
            }
            WorkerEvent::CheckpointCreated { checkpoint, .. } => {
                summary.checkpoints.push(checkpoint.clone());
            }
            WorkerEvent::CheckpointDeferred { task_id, .. } => {
                summary.deferred_checkpoints.push(task_id.clone());
            }
            WorkerEvent::Stopped { worker } => {
                pool.set_status(*worker, WorkerStatus::Stopped)?;
                clog_debug!("{} acknowledged stop", worker);
            }
        }
        Ok(())
    }
}

/// Run one worker and always acknowledge with `Stopped`, even if the worker
/// panicked. A panicked worker's held task counts as a worker failure.
async fn supervise(
    id: WorkerId,
    board: TaskBoard,
    ctx: Arc<WorkerContext>,
    events: mpsc::Sender<WorkerEvent>,
    stop: CancellationToken,
    concurrent: bool,
) -> Result<()> {
    let worker = Worker {
        id,
        board: board.clone(),
        ctx,
        events: events.clone(),
        stop: stop.clone(),
        concurrent,
    };
    let result = match tokio::spawn(worker.run()).await {
        Ok(result) => result,
        Err(e) => {
            clog_error!("{} panicked: {}", id, e);
            for (task_id, outcome) in board.recover(id, "worker crashed").await {
                let _ = events
                    .send(WorkerEvent::Failed {
                        worker: id,
                        task_id,
                        error: "worker crashed".to_string(),
                        blocked: outcome == RetryOutcome::Blocked,
                    })
                    .await;
            }
            Err(Error::TaskJoin(e.to_string()))
        }
    };
    if let Err(e) = &result {
        if e.is_session_fatal() {
            clog_error!("{} hit a fatal error, stopping swarm: {}", id, e);
            stop.cancel();
        }
    }
    let _ = events.send(WorkerEvent::Stopped { worker: id }).await;
    result
}

enum Flow {
    Continue,
    Stop,
}

struct Worker {
    id: WorkerId,
    board: TaskBoard,
    ctx: Arc<WorkerContext>,
    events: mpsc::Sender<WorkerEvent>,
    stop: CancellationToken,
    /// Other workers share the tree.
    concurrent: bool,
}

impl Worker {
    async fn run(self) -> Result<()> {
        let changed = self.board.changed();
        loop {
            if self.stop.is_cancelled() {
                clog_debug!("{} stopping before next claim", self.id);
                return Ok(());
            }
            // Register interest before looking, so a release between the
            // claim attempt and the wait is not missed.
            let notified = changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.board.claim(self.id).await {
                match self.work(task).await? {
                    Flow::Continue => continue,
                    Flow::Stop => return Ok(()),
                }
            }

            match self.board.state().await {
                QueueState::Ready(_) => continue,
                QueueState::InFlight => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = self.stop.cancelled() => return Ok(()),
                    }
                }
                state => {
                    clog_debug!("{} idle, queue is {:?}", self.id, state);
                    return Ok(());
                }
            }
        }
    }

    async fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).await.is_err() {
            clog_warn!("{}: event channel closed", self.id);
        }
    }

    async fn work(&self, task: Task) -> Result<Flow> {
        let id = task.id.clone();
        self.emit(WorkerEvent::Claimed {
            worker: self.id,
            task_id: id.clone(),
        })
        .await;
        self.board.start(self.id, &id).await?;

        let timeout = self.ctx.executor_timeout;
        let execution = tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            result = tokio::time::timeout(timeout, self.ctx.executor.execute(&task)) => Some(result),
        };

        let result = match execution {
            None => {
                self.board.release(self.id, &id).await?;
                clog!("{} abandoned {} on stop", self.id, id);
                return Ok(Flow::Stop);
            }
            Some(Err(_)) => {
                let error = Error::WorkerTimeout {
                    task: id.clone(),
                    after: timeout,
                };
                return self.failed(&id, &error.to_string()).await;
            }
            Some(Ok(Err(Error::Timeout(after)))) => {
                let error = Error::WorkerTimeout {
                    task: id.clone(),
                    after,
                };
                return self.failed(&id, &error.to_string()).await;
            }
            Some(Ok(Err(e))) if e.is_session_fatal() => return Err(e),
            Some(Ok(Err(e))) => return self.failed(&id, &e.to_string()).await,
            Some(Ok(Ok(result))) if !result.success => {
                let diagnostics = first_line(&result.diagnostics);
                return self
                    .failed(&id, &format!("executor reported failure: {}", diagnostics))
                    .await;
            }
            Some(Ok(Ok(result))) => result,
        };

        self.verify(&task, result).await
    }

    async fn failed(&self, id: &TaskId, error: &str) -> Result<Flow> {
        let outcome = self.board.fail(self.id, id, error).await?;
        self.emit(WorkerEvent::Failed {
            worker: self.id,
            task_id: id.clone(),
            error: error.to_string(),
            blocked: outcome == RetryOutcome::Blocked,
        })
        .await;
        Ok(Flow::Continue)
    }

    /// Run the task's gate pipeline, then complete or block the task.
    async fn verify(&self, task: &Task, result: ExecutionResult) -> Result<Flow> {
        let id = task.id.clone();
        let Some(pipeline) = &self.ctx.pipeline else {
            self.board.complete(self.id, &id, result.changed_paths).await?;
            self.emit(WorkerEvent::Completed {
                worker: self.id,
                task_id: id,
                report: None,
            })
            .await;
            return Ok(Flow::Continue);
        };

        let mut target = PipelineTarget::task(id.clone(), task.scope.clone());
        if self.concurrent {
            target = target.with_concurrent_writers();
        }
        let report = match pipeline.run(&target).await {
            Ok(report) => report,
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(e) => return self.failed(&id, &format!("gate pipeline error: {}", e)).await,
        };

        if !report.passed {
            let reason = match report.first_unresolved() {
                Some(gate) => format!(
                    "gate {} unresolved after {} attempts and {} escalation attempts",
                    gate.name, gate.attempts, gate.escalation_attempts
                ),
                None => "gate pipeline did not pass".to_string(),
            };
            let unresolvable = Error::Unresolvable {
                task: id.clone(),
                reason,
            };
            clog_warn!("{}", unresolvable);
            self.board.block(self.id, &id, &unresolvable.to_string()).await?;
            self.emit(WorkerEvent::Unresolved {
                worker: self.id,
                task_id: id,
                report,
            })
            .await;
            return Ok(Flow::Continue);
        }

        let mut covered: BTreeSet<PathBuf> = result.changed_paths.iter().cloned().collect();
        covered.extend(report.touched_paths.iter().cloned());
        self.board
            .complete(self.id, &id, covered.iter().cloned().collect())
            .await?;
        self.emit(WorkerEvent::Completed {
            worker: self.id,
            task_id: id.clone(),
            report: Some(report.clone()),
        })
        .await;

        if task.requires_checkpoint {
            self.checkpoint(&id, &report, &covered).await?;
        }
        Ok(Flow::Continue)
    }

    async fn checkpoint(
        &self,
        id: &TaskId,
        report: &PipelineReport,
        covered: &BTreeSet<PathBuf>,
    ) -> Result<()> {
        let Some(manager) = &self.ctx.checkpoints else {
            return Ok(());
        };
        match manager.create(std::slice::from_ref(id), report, covered).await {
            Ok(checkpoint) => {
                self.emit(WorkerEvent::CheckpointCreated {
                    worker: self.id,
                    checkpoint,
                })
                .await;
            }
            Err(Error::CheckpointPrecondition(reason)) => {
                clog!("Checkpoint for {} deferred: {}", id, reason);
                self.emit(WorkerEvent::CheckpointDeferred {
                    worker: self.id,
                    task_id: id.clone(),
                    reason,
                })
                .await;
            }
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(e) => {
                clog_warn!("Checkpoint for {} deferred after error: {}", id, e);
                self.emit(WorkerEvent::CheckpointDeferred {
                    worker: self.id,
                    task_id: id.clone(),
                    reason: e.to_string(),
                })
                .await;
            }
        }
        Ok(())
    }
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("no diagnostics")
}
