//! End-to-end scenarios: ordering under one worker, fix-command recovery,
//! bounded swarm claims and approval rejection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use cadence::approval::{Answer, QuestionKind, ScriptedResponder, OPTION_ABORT, OPTION_REJECT};
use cadence::config::Config;
use cadence::core::{TaskId, TaskStatus};
use cadence::gates::{Gate, GateCategory, GatePipeline, GateStatus, PipelineTarget};
use cadence::orchestration::{
    NoObserver, Swarm, SwarmAssessment, TaskBoard, WorkQueue, WorkerContext,
};
use cadence::{Orchestrator, SessionStatus};

use crate::fixtures::{
    chain_graph, collaborators, independent_tasks, GatedExecutor, MemoryVcs, RecordingExecutor,
    RecordingRemediator, ScriptedRunner,
};

fn context(executor: Arc<dyn cadence::orchestration::TaskExecutor>) -> WorkerContext {
    WorkerContext {
        executor,
        pipeline: None,
        checkpoints: None,
        executor_timeout: Duration::from_secs(10),
    }
}

// ========== Scenario A: dependency order with one worker ==========

#[tokio::test]
async fn test_chain_runs_in_dependency_order() {
    let board = TaskBoard::new(chain_graph(), WorkQueue::default());
    let executor = Arc::new(RecordingExecutor::new());
    executor.watch(board.clone());
    let swarm = Swarm::new(
        board,
        context(executor.clone()),
        1,
        CancellationToken::new(),
    );

    let summary = swarm.run(&mut NoObserver).await.unwrap();

    assert_eq!(summary.workers, 1);
    assert_eq!(summary.completed.len(), 4);
    assert!(executor.early_starts().is_empty(), "{:?}", executor.early_starts());

    let started = executor.started();
    let pos = |id: &str| started.iter().position(|t| *t == TaskId::new(id)).unwrap();
    assert!(pos("T1") < pos("T2"));
    assert!(pos("T2") < pos("T3"));
    assert!(started.contains(&TaskId::new("T4")));

    let graph = swarm.board().snapshot().await;
    assert!(graph.all_terminal());
}

// ========== Scenario B: fix command recovers a failing gate ==========

#[tokio::test]
async fn test_fix_command_recovers_lint() {
    let vcs = Arc::new(MemoryVcs::new());
    let runner = Arc::new(ScriptedRunner::new());
    runner.script("cargo clippy", &[(1, "2 errors"), (0, "")]);
    let remediator = Arc::new(RecordingRemediator::new());
    let pipeline = GatePipeline::new(
        PathBuf::from("."),
        vec![
            Gate::new(GateCategory::Lint, "cargo clippy").with_fix("cargo clippy --fix"),
            Gate::new(GateCategory::Test, "cargo test"),
        ],
        runner.clone(),
        remediator.clone(),
        vcs,
    );

    let report = pipeline
        .run(&PipelineTarget::task(TaskId::new("T1"), Vec::new()))
        .await
        .unwrap();

    assert!(report.passed);
    let lint = report.gate("lint").unwrap();
    assert_eq!(lint.status, GateStatus::Passed);
    assert_eq!(lint.attempts, 2);
    assert!(!lint.escalated);
    assert_eq!(
        runner.calls(),
        vec!["cargo clippy", "cargo clippy --fix", "cargo clippy", "cargo test"]
    );
    assert!(remediator.requests().is_empty());
    assert_eq!(report.summary().passed, 2);
}

// ========== Scenario C: worker count bounds concurrent claims ==========

#[tokio::test]
async fn test_three_workers_claim_three_of_five() {
    let graph = independent_tasks(5);
    let assessment = SwarmAssessment::evaluate(&graph, &WorkQueue::default(), 3);
    assert!(assessment.activate());

    let board = TaskBoard::new(graph, WorkQueue::default());
    let observer_board = board.clone();
    let executor = Arc::new(GatedExecutor::new());
    let swarm = Swarm::new(board, context(executor.clone()), 3, CancellationToken::new());

    let mut observer = NoObserver;
    let (summary, _) = tokio::join!(swarm.run(&mut observer), async {
        executor.wait_for(3).await;
        // Give a fourth claim every chance to happen before looking.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (active, pending) = observer_board
            .read(|graph| {
                let active = graph.tasks().filter(|t| t.status.is_active()).count();
                let pending = graph
                    .tasks()
                    .filter(|t| t.status == TaskStatus::Pending)
                    .count();
                (active, pending)
            })
            .await;
        assert_eq!(active, 3);
        assert_eq!(pending, 2);
        assert_eq!(executor.in_flight(), 3);

        executor.open();
    });

    let summary = summary.unwrap();
    assert_eq!(summary.completed.len(), 5);
    assert_eq!(executor.peak(), 3);
    assert!(swarm.board().snapshot().await.all_terminal());
}

// ========== Scenario D: rejected approval blocks only that task ==========

const RISKY_PLAN: &str = r#"
[[tasks]]
key = "T1"
title = "Drop legacy sessions table"
requires_approval = true

[[tasks]]
key = "T2"
title = "Add session expiry"
"#;

#[tokio::test]
async fn test_rejected_task_blocks_while_others_continue() {
    let dir = TempDir::new().unwrap();
    let vcs = Arc::new(MemoryVcs::new());
    let responder = Arc::new(ScriptedResponder::new([
        Answer::with_note(OPTION_REJECT, "data loss"),
        Answer::choice(OPTION_ABORT),
    ]));
    let parts = collaborators(
        RISKY_PLAN,
        Arc::new(RecordingExecutor::writing_to(Arc::clone(&vcs))),
        Arc::new(ScriptedRunner::new()),
        vcs.clone(),
        responder.clone(),
    );
    let engine = Orchestrator::new(dir.path(), Config::default(), parts);

    let outcome = engine.start("expire sessions").await.unwrap();

    // Rejection did not halt the session; only the later abort did.
    let asked = responder.asked();
    assert_eq!(asked.len(), 2);
    assert_eq!(asked[0].kind, QuestionKind::Approval);
    assert_eq!(asked[1].kind, QuestionKind::Blocked);
    assert_eq!(asked[1].task, Some(TaskId::new("T1")));
    assert_eq!(outcome.status, SessionStatus::Aborted);

    let saved = engine.store().load().unwrap();
    match &saved.graph.get(&TaskId::new("T1")).unwrap().status {
        TaskStatus::Blocked { reason } => assert!(reason.contains("data loss"), "{}", reason),
        other => panic!("T1 should be blocked, got {:?}", other),
    }
    assert_eq!(
        saved.graph.get(&TaskId::new("T2")).unwrap().status,
        TaskStatus::Complete
    );
    assert!(vcs.contents("T2.rs").is_some());
    assert!(vcs.contents("T1.rs").is_none());
}
