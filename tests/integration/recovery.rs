//! Worker failure recovery, cancellation, resume and persisted-state
//! handling.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use cadence::approval::AutoResponder;
use cadence::checkpoint::{CheckpointLog, CheckpointManager};
use cadence::config::Config;
use cadence::core::{Task, TaskId, TaskStatus};
use cadence::gates::{GatePipeline, NoRemediation, PipelineStage, PipelineTarget};
use cadence::planner::Plan;
use cadence::orchestration::{
    ExecutionResult, NoObserver, Swarm, TaskBoard, TaskExecutor, WorkQueue, WorkerContext,
    WorkerId, MAX_WORKER_RETRIES,
};
use cadence::{Error, Orchestrator, Phase, Session, SessionStatus, SessionStore};

use crate::fixtures::{
    collaborators, independent_tasks, FailingExecutor, GatedExecutor, MemoryVcs,
    RecordingExecutor, ScriptedRunner,
};

const TWO_STEP_PLAN: &str = r#"
[[tasks]]
key = "T1"
title = "Add rate limiter"

[[tasks]]
key = "T2"
title = "Wire rate limiter into router"
blocked_by = ["T1"]
"#;

struct SlowExecutor;

#[async_trait]
impl TaskExecutor for SlowExecutor {
    async fn execute(&self, _task: &Task) -> cadence::Result<ExecutionResult> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(ExecutionResult::default())
    }
}

fn swarm_with(executor: Arc<dyn TaskExecutor>, tasks: usize, timeout: Duration) -> Swarm {
    let board = TaskBoard::new(independent_tasks(tasks), WorkQueue::default());
    let ctx = WorkerContext {
        executor,
        pipeline: None,
        checkpoints: None,
        executor_timeout: timeout,
    };
    Swarm::new(board, ctx, 1, CancellationToken::new())
}

// ========== Worker Retry Tests ==========

#[tokio::test]
async fn test_failing_task_blocked_after_retries() {
    let executor = Arc::new(FailingExecutor::new(&["T1"]));
    let swarm = swarm_with(executor.clone(), 2, Duration::from_secs(10));

    let summary = swarm.run(&mut NoObserver).await.unwrap();

    assert_eq!(executor.attempts("T1"), MAX_WORKER_RETRIES + 1);
    assert_eq!(summary.failed.len() as u32, MAX_WORKER_RETRIES);
    assert_eq!(summary.blocked, vec![TaskId::new("T1")]);
    assert_eq!(summary.completed, vec![TaskId::new("T2")]);

    let graph = swarm.board().snapshot().await;
    let t1 = graph.get(&TaskId::new("T1")).unwrap();
    assert!(matches!(t1.status, TaskStatus::Blocked { .. }));
    assert_eq!(t1.retries, MAX_WORKER_RETRIES);
    assert_eq!(t1.owner, None);
}

#[tokio::test(start_paused = true)]
async fn test_executor_timeout_counts_as_worker_failure() {
    let swarm = swarm_with(Arc::new(SlowExecutor), 1, Duration::from_secs(1));

    let summary = swarm.run(&mut NoObserver).await.unwrap();

    assert_eq!(summary.blocked, vec![TaskId::new("T1")]);
    let graph = swarm.board().snapshot().await;
    match &graph.get(&TaskId::new("T1")).unwrap().status {
        TaskStatus::Blocked { reason } => assert!(reason.contains("timed out"), "{}", reason),
        other => panic!("expected blocked, got {:?}", other),
    }
}

// ========== Cancellation and Resume Tests ==========

#[tokio::test]
async fn test_cancel_mid_execution_then_resume() {
    let dir = TempDir::new().unwrap();
    let vcs = Arc::new(MemoryVcs::new());
    let gated = Arc::new(GatedExecutor::new());
    let parts = collaborators(
        TWO_STEP_PLAN,
        gated.clone(),
        Arc::new(ScriptedRunner::new()),
        vcs.clone(),
        Arc::new(AutoResponder::new(false)),
    );
    let first = Orchestrator::new(dir.path(), Config::default(), parts);
    let cancel = first.cancel_token();

    let (outcome, _) = tokio::join!(first.start("rate limit the API"), async {
        gated.wait_for(1).await;
        cancel.cancel();
    });
    let outcome = outcome.unwrap();

    assert_eq!(outcome.status, SessionStatus::Paused);
    assert_eq!(outcome.phase, Phase::Execute);
    let saved = first.store().load().unwrap();
    assert_eq!(saved.status, SessionStatus::Paused);
    let t1 = saved.graph.get(&TaskId::new("T1")).unwrap();
    assert_eq!(t1.status, TaskStatus::Pending);
    assert_eq!(t1.retries, 0, "cancellation must not consume a retry");
    assert!(saved.swarm.active_workers.is_empty());

    // A new process picks the session up with a working executor.
    let executor = Arc::new(RecordingExecutor::writing_to(vcs.clone()));
    let parts = collaborators(
        TWO_STEP_PLAN,
        executor.clone(),
        Arc::new(ScriptedRunner::new()),
        vcs.clone(),
        Arc::new(AutoResponder::new(false)),
    );
    let second = Orchestrator::new(dir.path(), Config::default(), parts);
    let outcome = second.resume().await.unwrap();

    assert!(outcome.is_success(), "{:?}", outcome);
    assert_eq!(outcome.session_id, saved.id);
    assert_eq!(executor.started(), vec![TaskId::new("T1"), TaskId::new("T2")]);
    assert!(vcs.snapshot_count() >= 1);
}

#[tokio::test]
async fn test_resume_returns_orphaned_tasks_to_pending() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path());

    let mut session = Session::new("rate limit the API", &Config::default());
    session.graph = Plan::parse(TWO_STEP_PLAN)
        .unwrap()
        .into_graph()
        .unwrap();
    let board = TaskBoard::new(session.graph.clone(), WorkQueue::default());
    board.claim(WorkerId(7)).await.unwrap();
    session.graph = board.snapshot().await;
    for phase in [Phase::Init, Phase::Understand, Phase::Plan, Phase::Execute] {
        session.machine.transition(phase).unwrap();
    }
    store.save(&session).await.unwrap();

    let vcs = Arc::new(MemoryVcs::new());
    let executor = Arc::new(RecordingExecutor::writing_to(vcs.clone()));
    let parts = collaborators(
        TWO_STEP_PLAN,
        executor.clone(),
        Arc::new(ScriptedRunner::new()),
        vcs,
        Arc::new(AutoResponder::new(false)),
    );
    let engine = Orchestrator::new(dir.path(), Config::default(), parts);
    let outcome = engine.resume().await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(executor.started().len(), 2);
}

#[tokio::test]
async fn test_finished_session_cannot_resume() {
    let dir = TempDir::new().unwrap();
    let vcs = Arc::new(MemoryVcs::new());
    let parts = collaborators(
        TWO_STEP_PLAN,
        Arc::new(RecordingExecutor::writing_to(vcs.clone())),
        Arc::new(ScriptedRunner::new()),
        vcs,
        Arc::new(AutoResponder::new(false)),
    );
    let engine = Orchestrator::new(dir.path(), Config::default(), parts);

    assert!(engine.start("rate limit").await.unwrap().is_success());
    assert!(matches!(engine.resume().await, Err(Error::NoSession(_))));
    // A new session may start once the old one is archived.
    assert!(engine.start("rate limit again").await.unwrap().is_success());
    assert_eq!(engine.store().list_history().unwrap().len(), 2);
}

// ========== Persisted State Tests ==========

#[tokio::test]
async fn test_snapshot_survives_reload() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path());
    let mut session = Session::new("rate limit", &Config::default());
    session.graph = Plan::parse(TWO_STEP_PLAN)
        .unwrap()
        .into_graph()
        .unwrap();
    session.machine.transition(Phase::Init).unwrap();
    store.save(&session).await.unwrap();

    let loaded = store.load().unwrap();
    assert_eq!(loaded.id, session.id);
    assert_eq!(loaded.phase(), Phase::Init);
    assert_eq!(loaded.iteration(), 1);
    assert_eq!(loaded.graph.len(), 2);
    assert!(loaded
        .graph
        .get(&TaskId::new("T2"))
        .unwrap()
        .blocked_by
        .contains(&TaskId::new("T1")));
}

#[tokio::test]
async fn test_corrupt_and_foreign_snapshots_rejected() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path());
    store.save(&Session::new("x", &Config::default())).await.unwrap();

    std::fs::write(store.session_path(), "{ not json").unwrap();
    let corrupt = store.load();
    assert!(matches!(corrupt, Err(Error::CorruptState(_))));
    assert!(corrupt.unwrap_err().is_session_fatal());

    std::fs::write(store.session_path(), r#"{"version": 99}"#).unwrap();
    assert!(matches!(
        store.load(),
        Err(Error::UnsupportedStateVersion { found: 99, .. })
    ));
}

#[tokio::test]
async fn test_corrupt_state_fails_resume() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path());
    store.save(&Session::new("x", &Config::default())).await.unwrap();
    std::fs::write(store.session_path(), "garbage").unwrap();

    let vcs = Arc::new(MemoryVcs::new());
    let parts = collaborators(
        TWO_STEP_PLAN,
        Arc::new(RecordingExecutor::new()),
        Arc::new(ScriptedRunner::new()),
        vcs,
        Arc::new(AutoResponder::new(false)),
    );
    let engine = Orchestrator::new(dir.path(), Config::default(), parts);
    assert!(matches!(engine.resume().await, Err(Error::CorruptState(_))));
    assert!(matches!(engine.start("y").await, Err(Error::CorruptState(_))));
}

// ========== Rollback Tests ==========

#[tokio::test]
async fn test_rollback_supersedes_later_checkpoints() {
    let vcs = Arc::new(MemoryVcs::new());
    let manager = CheckpointManager::new(vcs.clone(), CheckpointLog::new());
    let pipeline = GatePipeline::new(
        PathBuf::from("."),
        Vec::new(),
        Arc::new(ScriptedRunner::new()),
        Arc::new(NoRemediation),
        vcs.clone(),
    );

    for (n, content) in ["v1", "v2", "v3"].iter().enumerate() {
        vcs.write("lib.rs", content);
        let id = TaskId::new(format!("T{}", n + 1));
        let report = pipeline
            .run(&PipelineTarget::workspace(PipelineStage::Quality, vec![id.clone()]))
            .await
            .unwrap();
        manager
            .create(&[id], &report, &[PathBuf::from("lib.rs")].into_iter().collect())
            .await
            .unwrap();
    }

    let target = manager.rollback_to("1").await.unwrap();
    assert_eq!(target.id, 1);
    assert_eq!(vcs.contents("lib.rs").as_deref(), Some("v1"));

    let log = manager.log().await;
    assert_eq!(log.len(), 3, "rollback never deletes checkpoints");
    let superseded: Vec<u32> = log
        .entries()
        .iter()
        .filter(|c| c.superseded)
        .map(|c| c.id)
        .collect();
    assert_eq!(superseded, vec![2, 3]);
    assert_eq!(log.latest().unwrap().id, 1);

    // Superseded checkpoints cannot be rolled back to.
    assert!(manager.rollback_to("3").await.is_err());
    assert!(matches!(
        manager.rollback_to("9").await,
        Err(Error::CheckpointNotFound(_))
    ));
}

#[tokio::test]
async fn test_engine_rollback_updates_saved_log() {
    let dir = TempDir::new().unwrap();
    let vcs = Arc::new(MemoryVcs::new());
    let store = SessionStore::new(dir.path());
    let manager = CheckpointManager::new(vcs.clone(), CheckpointLog::new());
    let pipeline = GatePipeline::new(
        dir.path().to_path_buf(),
        Vec::new(),
        Arc::new(ScriptedRunner::new()),
        Arc::new(NoRemediation),
        vcs.clone(),
    );
    for id in ["T1", "T2"] {
        vcs.write(&format!("{}.rs", id), id);
        let task = TaskId::new(id);
        let report = pipeline
            .run(&PipelineTarget::workspace(PipelineStage::Quality, vec![task.clone()]))
            .await
            .unwrap();
        let covered = [PathBuf::from(format!("{}.rs", id))].into_iter().collect();
        manager.create(&[task], &report, &covered).await.unwrap();
    }

    let mut session = Session::new("rate limit", &Config::default());
    session.checkpoints = manager.log().await;
    session.uncommitted.insert("scratch.rs".into());
    session.status = SessionStatus::Paused;
    store.save(&session).await.unwrap();

    let parts = collaborators(
        TWO_STEP_PLAN,
        Arc::new(RecordingExecutor::new()),
        Arc::new(ScriptedRunner::new()),
        vcs.clone(),
        Arc::new(AutoResponder::new(false)),
    );
    let engine = Orchestrator::new(dir.path(), Config::default(), parts);
    let checkpoint = engine.rollback("1").await.unwrap();

    assert_eq!(checkpoint.id, 1);
    assert_eq!(vcs.contents("T1.rs").as_deref(), Some("T1"));
    assert!(vcs.contents("T2.rs").is_none());
    let saved = engine.store().load().unwrap();
    assert_eq!(saved.checkpoints.len(), 2);
    assert!(saved.checkpoints.entries()[1].superseded);
    assert!(saved.uncommitted.is_empty());
}
