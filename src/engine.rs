//! The orchestrator: drives a session through its phases.
//!
//! `Classify -> Init -> Understand -> Plan -> Execute -> Verify -> Quality ->
//! Commit -> Evaluate`, looping from `Evaluate` back to `Execute` until the
//! queue drains and two consecutive quality runs pass. The session is
//! persisted after every transition and every checkpoint, so a cancelled or
//! interrupted run can be picked up with [`Orchestrator::resume`].

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::approval::{
    Answer, ApprovalDecision, ApprovalGate, AutoResponder, Question, Responder, StdinResponder,
    OPTION_ABORT, OPTION_ANSWER, OPTION_RETRY, OPTION_SKIP,
};
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::Config;
use crate::core::{TaskId, TaskStatus};
use crate::gates::{
    CommandRunner, Gate, GatePipeline, PipelineReport, PipelineStage, PipelineTarget, Profile,
    Remediator, ShellRunner,
};
use crate::orchestration::{
    clamp_worker_count, CommandExecutor, QueueState, Swarm, SwarmAssessment, SwarmObserver,
    TaskBoard, TaskExecutor, WorkQueue, WorkerContext, WorkerEvent,
};
use crate::planner::{PlanFilePlanner, Planner};
use crate::session::{Session, SessionStore};
use crate::util::blocking;
use crate::vcs::{GitVcs, VersionControl};
use crate::workflow::{Phase, SessionId, SessionStatus};
use crate::{clog, clog_debug, clog_error, clog_warn, Error, Result};

/// The external parties the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub planner: Arc<dyn Planner>,
    pub executor: Arc<dyn TaskExecutor>,
    pub remediator: Arc<dyn Remediator>,
    pub runner: Arc<dyn CommandRunner>,
    pub vcs: Arc<dyn VersionControl>,
    pub responder: Arc<dyn Responder>,
    pub gates: Vec<Gate>,
}

impl Collaborators {
    /// The production wiring: git, the configured agent command, shell
    /// gates from the resolved profile and a TOML plan file.
    pub fn from_config(
        root: &Path,
        config: &Config,
        plan: &Path,
        interactive: bool,
    ) -> Result<Self> {
        let vcs: Arc<dyn VersionControl> = Arc::new(GitVcs::new(root)?);
        let agent = Arc::new(CommandExecutor::new(
            config.effective_command(),
            root.to_path_buf(),
            Arc::clone(&vcs),
            config.executor_timeout(),
        )?);
        let profile = Profile::resolve(root, config.profile.as_deref())?;
        clog!("Using profile {} ({} gates)", profile.name, profile.gates.len());
        let responder: Arc<dyn Responder> = if interactive {
            Arc::new(StdinResponder)
        } else {
            Arc::new(AutoResponder::new(config.trust))
        };
        Ok(Self {
            planner: Arc::new(PlanFilePlanner::new(plan)),
            executor: agent.clone(),
            remediator: agent,
            runner: Arc::new(ShellRunner),
            vcs,
            responder,
            gates: profile.gates,
        })
    }
}

/// How a call to [`Orchestrator::start`] or [`Orchestrator::resume`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub phase: Phase,
    pub iteration: u32,
    pub summary: String,
    /// Set when the session failed: the checkpoint it can be rolled back to.
    pub rollback: Option<String>,
}

impl RunOutcome {
    fn from_session(session: &Session, summary: impl Into<String>) -> Self {
        Self {
            session_id: session.id,
            status: session.status,
            phase: session.phase(),
            iteration: session.iteration(),
            summary: summary.into(),
            rollback: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

/// What a phase handler wants to happen next.
enum Step {
    Advance(Phase),
    /// Run the current phase again.
    Repeat,
    Halt(SessionStatus, String),
}

pub struct Orchestrator {
    root: PathBuf,
    config: Config,
    parts: Collaborators,
    pipeline: Arc<GatePipeline>,
    store: SessionStore,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(root: &Path, config: Config, parts: Collaborators) -> Self {
        let pipeline = GatePipeline::new(
            root.to_path_buf(),
            parts.gates.clone(),
            Arc::clone(&parts.runner),
            Arc::clone(&parts.remediator),
            Arc::clone(&parts.vcs),
        )
        .with_timeouts(config.gate_timeouts.clone())
        .with_advisory_overrides(config.advisory_overrides.clone());
        Self {
            root: root.to_path_buf(),
            store: SessionStore::new(root),
            config,
            parts,
            pipeline: Arc::new(pipeline),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the session at the next safe point when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a new session for `prompt`.
    ///
    /// # Errors
    /// `Validation` if a resumable session already exists.
    pub async fn start(&self, prompt: &str) -> Result<RunOutcome> {
        match self.store.load() {
            Ok(existing) if existing.status.is_resumable() => {
                return Err(Error::Validation(format!(
                    "session {} is still {}; resume it or clear it first",
                    existing.id.short(),
                    existing.status
                )));
            }
            Ok(existing) => {
                self.store.archive(&existing).await?;
            }
            Err(Error::NoSession(_)) => {}
            Err(e) => return Err(e),
        }

        self.config.validate()?;
        let session = Session::new(prompt, &self.config);
        clog!("Starting session {}: {}", session.id.short(), prompt);
        self.store.save(&session).await?;
        self.drive(session).await
    }

    /// Continue the saved session from where it stopped.
    pub async fn resume(&self) -> Result<RunOutcome> {
        let mut session = self.store.load()?;
        if !session.status.is_resumable() {
            return Err(Error::Validation(format!(
                "session {} is {} and cannot be resumed",
                session.id.short(),
                session.status
            )));
        }
        // Tasks a previous process held when it stopped belong to no worker.
        let orphaned: Vec<TaskId> = session
            .graph
            .tasks()
            .filter(|t| t.status.is_active())
            .map(|t| t.id.clone())
            .collect();
        for id in &orphaned {
            session.graph.task_mut(id)?.reset();
            clog_debug!("Returned orphaned task {} to pending", id);
        }
        session.status = SessionStatus::Running;
        session.swarm.active_workers.clear();
        clog!(
            "Resuming session {} at phase {} (iteration {})",
            session.id.short(),
            session.phase(),
            session.iteration()
        );
        self.drive(session).await
    }

    /// Restore the working tree to a checkpoint of the saved session.
    pub async fn rollback(&self, reference: &str) -> Result<Checkpoint> {
        let mut session = self.store.load()?;
        let manager =
            CheckpointManager::new(Arc::clone(&self.parts.vcs), session.checkpoints.clone());
        let checkpoint = manager.rollback_to(reference).await?;
        session.checkpoints = manager.log().await;
        session.uncommitted.clear();
        session.touch();
        self.store.save(&session).await?;
        Ok(checkpoint)
    }

    /// Run the gate pipeline over the whole workspace, outside any session.
    pub async fn verify(&self, stage: PipelineStage) -> Result<PipelineReport> {
        self.pipeline
            .run(&PipelineTarget::workspace(stage, Vec::new()))
            .await
    }

    async fn drive(&self, mut session: Session) -> Result<RunOutcome> {
        loop {
            if self.cancel.is_cancelled() {
                return self.halt(&mut session, SessionStatus::Paused, "cancelled").await;
            }
            let phase = session.phase();
            if phase == Phase::Complete {
                return self.finish(&mut session).await;
            }

            let step = match self.run_phase(&mut session, phase).await {
                Ok(step) => step,
                Err(e) => return self.fail(&mut session, e).await,
            };

            match step {
                Step::Advance(next) => {
                    if let Err(e) = session.machine.transition(next) {
                        return self.fail(&mut session, e).await;
                    }
                }
                Step::Repeat => {}
                Step::Halt(status, reason) => {
                    return self.halt(&mut session, status, &reason).await;
                }
            }
            session.touch();
            self.store.save(&session).await?;
        }
    }

    async fn run_phase(&self, session: &mut Session, phase: Phase) -> Result<Step> {
        clog_debug!("Running phase {} (iteration {})", phase, session.iteration());
        match phase {
            Phase::Classify => self.classify(session).await,
            Phase::Init => self.init(session).await,
            Phase::Understand => self.understand(session),
            Phase::Plan => self.plan(session).await,
            Phase::Execute => self.execute(session).await,
            Phase::Verify => self.verify_phase(session).await,
            Phase::Quality => self.quality(session).await,
            Phase::Commit => self.commit(session).await,
            Phase::Evaluate => self.evaluate(session).await,
            Phase::Blocked => {
                session.machine.unblock()?;
                Ok(Step::Repeat)
            }
            Phase::Complete => Ok(Step::Repeat),
        }
    }

    async fn classify(&self, session: &mut Session) -> Result<Step> {
        if session.classification.is_some() {
            session.machine.skip_current()?;
        } else {
            let classification = self.parts.planner.classify(&session.prompt).await?;
            session.classification = Some(classification);
        }
        Ok(Step::Advance(Phase::Init))
    }

    async fn init(&self, session: &mut Session) -> Result<Step> {
        let vcs = Arc::clone(&self.parts.vcs);
        let dirty = blocking(move || vcs.dirty_paths()).await?;
        if !dirty.is_empty() {
            clog_warn!(
                "Working tree has {} uncommitted paths before the session starts; \
                 checkpoints wait until they are committed or removed",
                dirty.len()
            );
        }
        session.baseline_dirty = dirty;
        if session.profile.is_none() {
            session.profile = self.config.profile.clone();
        }
        Ok(Step::Advance(Phase::Understand))
    }

    fn understand(&self, session: &mut Session) -> Result<Step> {
        let applicable: Vec<&str> = self
            .pipeline
            .gates()
            .iter()
            .filter(|g| g.detect.applies(&self.root))
            .map(|g| g.name.as_str())
            .collect();
        clog!(
            "Project gates for {}: [{}]",
            session.id.short(),
            applicable.join(", ")
        );
        if let Some(c) = &session.classification {
            clog!("Work is {:?}/{:?}: {}", c.category, c.complexity, c.summary);
        }
        Ok(Step::Advance(Phase::Plan))
    }

    async fn plan(&self, session: &mut Session) -> Result<Step> {
        if !session.graph.is_empty() {
            session.machine.skip_current()?;
            return Ok(Step::Advance(Phase::Execute));
        }
        let classification = session.classification.clone().unwrap_or_default();
        let plan = self
            .parts
            .planner
            .plan(&session.prompt, &classification)
            .await?;
        session.graph = plan.into_graph()?;
        clog!("Planned {} tasks", session.graph.len());
        Ok(Step::Advance(Phase::Execute))
    }

    async fn execute(&self, session: &mut Session) -> Result<Step> {
        let queue = WorkQueue::new(session.swarm.tie_break);

        for id in ApprovalGate::pending(&session.graph, &queue) {
            let question = ApprovalGate::question(&session.graph, &id)?;
            let Some(answer) = self.ask(session, question, SessionStatus::PendingApproval).await?
            else {
                return Ok(Step::Halt(SessionStatus::Paused, "cancelled".to_string()));
            };
            let decision = ApprovalDecision::from_answer(answer);
            ApprovalGate::apply(&mut session.graph, &id, &decision)?;
        }

        let assessment =
            SwarmAssessment::evaluate(&session.graph, &queue, session.swarm.threshold);
        let workers = if session.swarm.worker_count > 1 && assessment.activate() {
            clamp_worker_count(session.swarm.worker_count)
        } else {
            1
        };
        clog!(
            "Execute iteration {}: {} eligible, estimate {}, {} worker(s)",
            session.iteration(),
            assessment.eligible,
            assessment.aggregate_estimate,
            workers
        );

        let manager = Arc::new(CheckpointManager::new(
            Arc::clone(&self.parts.vcs),
            session.checkpoints.clone(),
        ));
        let ctx = WorkerContext {
            executor: Arc::clone(&self.parts.executor),
            pipeline: Some(Arc::clone(&self.pipeline)),
            checkpoints: Some(Arc::clone(&manager)),
            executor_timeout: self.config.executor_timeout(),
        };
        let board = TaskBoard::new(session.graph.clone(), queue);
        let swarm = Swarm::new(board, ctx, workers, self.cancel.clone());

        let summary = {
            let mut observer = PersistingObserver {
                store: &self.store,
                session: &mut *session,
                checkpoints: Arc::clone(&manager),
            };
            swarm.run(&mut observer).await?
        };

        session.graph = swarm.board().snapshot().await;
        session.checkpoints = manager.log().await;
        session.swarm.active_workers.clear();
        for report in summary.reports {
            session.record_report(report);
        }
        session.record_changes(summary.changed_paths);
        for id in summary.deferred_checkpoints {
            if !session.deferred_checkpoints.contains(&id) {
                session.deferred_checkpoints.push(id);
            }
        }

        if let Some(fatal) = summary.fatal {
            return Err(fatal);
        }
        if summary.cancelled {
            return Ok(Step::Halt(SessionStatus::Paused, "cancelled".to_string()));
        }
        Ok(Step::Advance(Phase::Verify))
    }

    async fn verify_phase(&self, session: &mut Session) -> Result<Step> {
        if session.uncommitted.is_empty() {
            session.machine.skip_current()?;
            return Ok(Step::Advance(Phase::Quality));
        }
        let target = PipelineTarget::workspace(PipelineStage::Verify, uncommitted_tasks(session));
        let report = self.pipeline.run(&target).await?;
        if !report.passed {
            clog_warn!(
                "Verify failed for iteration {}: {}",
                session.iteration(),
                report
                    .first_unresolved()
                    .map(|g| g.name.as_str())
                    .unwrap_or("unknown gate")
            );
        }
        session.record_changes(report.touched_paths.iter().cloned());
        session.record_report(report);
        Ok(Step::Advance(Phase::Quality))
    }

    async fn quality(&self, session: &mut Session) -> Result<Step> {
        let complete: Vec<TaskId> = session
            .graph
            .tasks()
            .filter(|t| t.status.is_complete())
            .map(|t| t.id.clone())
            .collect();
        let report = self
            .pipeline
            .run(&PipelineTarget::workspace(PipelineStage::Quality, complete))
            .await?;
        for warning in &report.warnings {
            clog_warn!("Quality warning: {}", warning);
        }
        session.record_changes(report.touched_paths.iter().cloned());
        session.record_report(report);
        Ok(Step::Advance(Phase::Commit))
    }

    async fn commit(&self, session: &mut Session) -> Result<Step> {
        if session.uncommitted.is_empty() && session.deferred_checkpoints.is_empty() {
            session.machine.skip_current()?;
            return Ok(Step::Advance(Phase::Evaluate));
        }
        let Some(report) = session.last_report(PipelineStage::Quality).cloned() else {
            return Ok(Step::Advance(Phase::Evaluate));
        };

        let mut task_ids = session.deferred_checkpoints.clone();
        for id in uncommitted_tasks(session) {
            if !task_ids.contains(&id) {
                task_ids.push(id);
            }
        }
        let mut covered = session.uncommitted.clone();
        covered.extend(report.touched_paths.iter().cloned());
        covered.retain(|p| !session.baseline_dirty.contains(p));

        let manager =
            CheckpointManager::new(Arc::clone(&self.parts.vcs), session.checkpoints.clone());
        match manager.create(&task_ids, &report, &covered).await {
            Ok(checkpoint) => {
                session.checkpoints = manager.log().await;
                session.deferred_checkpoints.clear();
                session.uncommitted.clear();
                clog!(
                    "Committed iteration {} as checkpoint #{}",
                    session.iteration(),
                    checkpoint.id
                );
            }
            Err(Error::CheckpointPrecondition(reason)) => {
                clog!("Commit deferred: {}", reason);
            }
            Err(e) => return Err(e),
        }
        Ok(Step::Advance(Phase::Evaluate))
    }

    async fn evaluate(&self, session: &mut Session) -> Result<Step> {
        let queue = WorkQueue::new(session.swarm.tie_break);
        match queue.state(&session.graph) {
            QueueState::Drained => {
                if session.quality_streak_passed() {
                    return Ok(Step::Advance(Phase::Complete));
                }
                let last_failed = session
                    .last_report(PipelineStage::Quality)
                    .map(|r| !r.passed)
                    .unwrap_or(false);
                if last_failed {
                    let detail = session
                        .last_report(PipelineStage::Quality)
                        .and_then(|r| r.first_unresolved())
                        .map(|g| format!("gate {} unresolved", g.name))
                        .unwrap_or_default();
                    let question = Question::quality_stalled(&detail);
                    let Some(answer) = self.ask(session, question, SessionStatus::Blocked).await?
                    else {
                        return Ok(Step::Halt(SessionStatus::Paused, "cancelled".to_string()));
                    };
                    if !is_choice(&answer, OPTION_RETRY) {
                        return Ok(Step::Halt(
                            SessionStatus::Aborted,
                            "aborted: quality gates keep failing".to_string(),
                        ));
                    }
                }
                self.loop_back(session)
            }
            QueueState::Blocked(ids) => {
                session.machine.block()?;
                self.store.save(session).await?;
                for id in ids {
                    let reason = match &session.graph.task(&id)?.status {
                        TaskStatus::Blocked { reason } => reason.clone(),
                        _ => "an upstream task failed".to_string(),
                    };
                    let question = Question::blocked(&id, &reason);
                    let Some(answer) = self.ask(session, question, SessionStatus::Blocked).await?
                    else {
                        return Ok(Step::Halt(SessionStatus::Paused, "cancelled".to_string()));
                    };
                    if !resolve_blocked(session, &id, answer)? {
                        return Ok(Step::Halt(
                            SessionStatus::Aborted,
                            format!("aborted while {} was blocked", id),
                        ));
                    }
                }
                session.machine.unblock()?;
                Ok(Step::Repeat)
            }
            QueueState::Ready(_) | QueueState::AwaitingApproval(_) | QueueState::InFlight => {
                self.loop_back(session)
            }
        }
    }

    fn loop_back(&self, session: &Session) -> Result<Step> {
        if session.iteration() >= self.config.max_iterations {
            return Err(Error::MaxIterations(self.config.max_iterations));
        }
        Ok(Step::Advance(Phase::Execute))
    }

    /// Put a question to the responder, persisting the suspension first.
    /// `None` means the session was cancelled while waiting.
    async fn ask(
        &self,
        session: &mut Session,
        question: Question,
        waiting: SessionStatus,
    ) -> Result<Option<Answer>> {
        session.status = waiting;
        session.pending_question = Some(question.clone());
        session.touch();
        self.store.save(session).await?;

        let answer = tokio::select! {
            _ = self.cancel.cancelled() => None,
            answer = self.parts.responder.ask(&question) => Some(answer?),
        };
        if answer.is_some() {
            session.status = SessionStatus::Running;
            session.pending_question = None;
        }
        Ok(answer)
    }

    async fn halt(
        &self,
        session: &mut Session,
        status: SessionStatus,
        reason: &str,
    ) -> Result<RunOutcome> {
        session.status = status;
        session.touch();
        self.store.save(session).await?;
        clog!(
            "Session {} {} at phase {}: {}",
            session.id.short(),
            status,
            session.phase(),
            reason
        );
        Ok(RunOutcome::from_session(session, reason))
    }

    async fn finish(&self, session: &mut Session) -> Result<RunOutcome> {
        session.status = SessionStatus::Completed;
        session.pending_question = None;
        session.touch();
        self.store.save(session).await?;
        self.store.archive(session).await?;
        let complete = session
            .graph
            .tasks()
            .filter(|t| t.status.is_complete())
            .count();
        let summary = format!(
            "{} of {} tasks complete in {} iterations, {} checkpoints",
            complete,
            session.graph.len(),
            session.iteration(),
            session.checkpoints.len()
        );
        clog!("Session {} complete: {}", session.id.short(), summary);
        Ok(RunOutcome::from_session(session, summary))
    }

    /// Halt the session on an error that no single task owns.
    async fn fail(&self, session: &mut Session, error: Error) -> Result<RunOutcome> {
        clog_error!("Session {} failed: {}", session.id.short(), error);
        session.status = SessionStatus::Failed;
        session.last_error = Some(error.to_string());
        session.touch();
        self.store.save(session).await?;
        let mut outcome = RunOutcome::from_session(session, error.to_string());
        outcome.rollback = session.checkpoints.latest().map(|c| c.id.to_string());
        if let Some(target) = &outcome.rollback {
            clog!("Rollback available to checkpoint #{}", target);
        }
        Ok(outcome)
    }
}

fn is_choice(answer: &Answer, option: &str) -> bool {
    matches!(answer, Answer::Choice { option: chosen, .. } if chosen == option)
}

/// Apply the caller's resolution for a stuck task. Returns `false` on abort.
fn resolve_blocked(session: &mut Session, id: &TaskId, answer: Answer) -> Result<bool> {
    let note = match answer {
        Answer::Choice { option, .. } if option == OPTION_ABORT => return Ok(false),
        Answer::Choice { option, .. } if option == OPTION_SKIP => {
            let downstream = session.graph.transitive_dependents(id);
            session.graph.task_mut(id)?.fail("skipped by caller");
            for dep in &downstream {
                let task = session.graph.task_mut(dep)?;
                if !task.status.is_terminal() {
                    task.fail(&format!("upstream task {} was skipped", id));
                }
            }
            clog!("Task {} skipped with {} dependents", id, downstream.len());
            return Ok(true);
        }
        Answer::Choice { option, note } if option == OPTION_ANSWER => note.unwrap_or_default(),
        Answer::Choice { option, note } => note.unwrap_or(option),
        Answer::FreeText { text } => text,
    };

    let task = session.graph.task_mut(id)?;
    if !note.trim().is_empty() {
        task.notes.push(note);
    }
    task.retries = 0;
    WorkQueue::mark_unblocked(&mut session.graph, id)?;
    clog!("Task {} answered and returned to the queue", id);
    Ok(true)
}

/// Completed tasks whose changes have not been committed yet.
fn uncommitted_tasks(session: &Session) -> Vec<TaskId> {
    session
        .graph
        .tasks()
        .filter(|t| t.status.is_complete())
        .filter(|t| t.changed_paths.iter().any(|p| session.uncommitted.contains(p)))
        .map(|t| t.id.clone())
        .collect()
}

/// Keeps the persisted session in step with the swarm: the worker registry
/// on start/stop and the graph plus checkpoint log on every checkpoint.
struct PersistingObserver<'a> {
    store: &'a SessionStore,
    session: &'a mut Session,
    checkpoints: Arc<CheckpointManager>,
}

#[async_trait]
impl<'a> SwarmObserver for PersistingObserver<'a> {
    async fn on_event(&mut self, event: &WorkerEvent, board: &TaskBoard) -> Result<()> {
        match event {
            WorkerEvent::Started { worker } => {
                self.session.swarm.active_workers.push(*worker);
            }
            WorkerEvent::Stopped { worker } => {
                self.session.swarm.active_workers.retain(|w| w != worker);
            }
            WorkerEvent::CheckpointCreated { checkpoint, .. } => {
                self.session.graph = board.snapshot().await;
                self.session.checkpoints = self.checkpoints.log().await;
                let covered: BTreeSet<_> = checkpoint.task_ids.iter().collect();
                self.session
                    .deferred_checkpoints
                    .retain(|id| !covered.contains(id));
                self.session.touch();
                self.store.save(self.session).await?;
            }
            _ => {}
        }
        Ok(())
    }
}
