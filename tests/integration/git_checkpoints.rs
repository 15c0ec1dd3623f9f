//! Checkpoints against a real git repository.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

use cadence::approval::AutoResponder;
use cadence::checkpoint::{CheckpointLog, CheckpointManager};
use cadence::config::Config;
use cadence::core::{Task, TaskId};
use cadence::gates::{GatePipeline, NoRemediation, PipelineStage, PipelineTarget};
use cadence::orchestration::{ExecutionResult, TaskExecutor};
use cadence::vcs::{GitVcs, VersionControl};
use cadence::{Error, Orchestrator};

use crate::fixtures::{collaborators, ScriptedRunner, TestRepo, CHAIN_WITH_SIDE_TASK};

/// Writes `src/<task>.rs` into the repository work tree.
struct FileWritingExecutor {
    root: PathBuf,
}

#[async_trait]
impl TaskExecutor for FileWritingExecutor {
    async fn execute(&self, task: &Task) -> cadence::Result<ExecutionResult> {
        let relative = PathBuf::from(format!("src/{}.rs", task.id.as_str().to_lowercase()));
        let full = self.root.join(&relative);
        tokio::fs::create_dir_all(self.root.join("src")).await?;
        tokio::fs::write(&full, format!("// {}\n", task.title)).await?;
        Ok(ExecutionResult {
            changed_paths: vec![relative],
            success: true,
            diagnostics: String::new(),
        })
    }
}

fn empty_pipeline(repo: &TestRepo, vcs: Arc<GitVcs>) -> GatePipeline {
    GatePipeline::new(
        repo.path.clone(),
        Vec::new(),
        Arc::new(ScriptedRunner::new()),
        Arc::new(NoRemediation),
        vcs,
    )
}

// ========== Checkpoint Manager Tests ==========

#[test]
fn test_checkpoint_and_rollback_on_git() {
    let repo = TestRepo::new();
    let vcs = Arc::new(GitVcs::new(&repo.path).unwrap());
    let pipeline = empty_pipeline(&repo, vcs.clone());
    let manager = CheckpointManager::new(vcs.clone(), CheckpointLog::new());

    tokio_test::block_on(async {
        repo.write("src/limiter.rs", "pub struct Limiter;\n");
        let first = TaskId::new("T1");
        let report = assert_ok!(
            pipeline
                .run(&PipelineTarget::workspace(PipelineStage::Quality, vec![first.clone()]))
                .await
        );
        let covered: BTreeSet<PathBuf> = [PathBuf::from("src/limiter.rs")].into_iter().collect();
        let checkpoint = assert_ok!(manager.create(&[first], &report, &covered).await);
        assert_eq!(checkpoint.id, 1);
        assert_eq!(vcs.head_commit().unwrap(), checkpoint.commit_ref);
        assert!(vcs.is_clean().unwrap());

        repo.write("src/limiter.rs", "pub struct Limiter { rate: u32 }\n");
        repo.write("src/router.rs", "mod limiter;\n");
        let second = TaskId::new("T2");
        let report = assert_ok!(
            pipeline
                .run(&PipelineTarget::workspace(PipelineStage::Quality, vec![second.clone()]))
                .await
        );
        let covered: BTreeSet<PathBuf> = ["src/limiter.rs", "src/router.rs"]
            .into_iter()
            .map(PathBuf::from)
            .collect();
        assert_ok!(manager.create(&[second], &report, &covered).await);
        assert_eq!(vcs.checkpoint_refs().unwrap().len(), 2);

        assert_ok!(manager.rollback_to("1").await);
    });

    assert_eq!(
        repo.read("src/limiter.rs").as_deref(),
        Some("pub struct Limiter;\n")
    );
    assert!(repo.read("src/router.rs").is_none());
    assert_eq!(repo.read("README.md").as_deref(), Some("# Test Repository\n"));
}

#[test]
fn test_task_checkpoint_refuses_unrelated_git_changes() {
    let repo = TestRepo::new();
    let vcs = Arc::new(GitVcs::new(&repo.path).unwrap());
    let pipeline = empty_pipeline(&repo, vcs.clone());
    let manager = CheckpointManager::new(vcs.clone(), CheckpointLog::new());
    let head = vcs.head_commit().unwrap();

    repo.write("src/limiter.rs", "pub struct Limiter;\n");
    repo.write("notes.txt", "scratch\n");
    let covered = [PathBuf::from("src/limiter.rs")].into_iter().collect();

    let result = tokio_test::block_on(async {
        let report = pipeline
            .run(&PipelineTarget::task(
                TaskId::new("T1"),
                vec![PathBuf::from("src")],
            ))
            .await
            .unwrap();
        manager.create(&[TaskId::new("T1")], &report, &covered).await
    });

    let err = assert_err!(result);
    match err {
        Error::CheckpointPrecondition(reason) => assert!(reason.contains("notes.txt"), "{}", reason),
        other => panic!("expected precondition failure, got {:?}", other),
    }
    assert_eq!(vcs.head_commit().unwrap(), head);
    assert!(vcs.checkpoint_refs().unwrap().is_empty());
}

#[test]
fn test_rollback_to_unknown_ref() {
    let repo = TestRepo::new();
    let vcs = Arc::new(GitVcs::new(&repo.path).unwrap());
    let manager = CheckpointManager::new(vcs, CheckpointLog::new());

    let result = tokio_test::block_on(manager.rollback_to("deadbeefcafe"));
    assert!(matches!(result, Err(Error::CheckpointNotFound(_))));
}

// ========== Engine on Git Tests ==========

#[tokio::test]
async fn test_session_commits_work_and_keeps_state_out_of_git() {
    let repo = TestRepo::new();
    let vcs = Arc::new(GitVcs::new(&repo.path).unwrap());
    let initial = vcs.head_commit().unwrap();
    let parts = collaborators(
        CHAIN_WITH_SIDE_TASK,
        Arc::new(FileWritingExecutor {
            root: repo.path.clone(),
        }),
        Arc::new(ScriptedRunner::new()),
        vcs.clone(),
        Arc::new(AutoResponder::new(false)),
    );
    let engine = Orchestrator::new(&repo.path, Config::default(), parts);

    let outcome = engine.start("add login flow").await.unwrap();

    assert!(outcome.is_success(), "{:?}", outcome);
    assert!(vcs.is_clean().unwrap());
    assert_ne!(vcs.head_commit().unwrap(), initial);
    assert!(!vcs.checkpoint_refs().unwrap().is_empty());
    for file in ["src/t1.rs", "src/t2.rs", "src/t3.rs", "src/t4.rs"] {
        assert!(repo.read(file).is_some(), "{} missing", file);
    }

    let git = git2::Repository::open(&repo.path).unwrap();
    let head = git.head().unwrap().peel_to_commit().unwrap();
    assert!(head.message().unwrap().contains("cadence checkpoint"));
    let tree = head.tree().unwrap();
    assert!(tree.get_path(std::path::Path::new("src/t3.rs")).is_ok());
    assert!(tree.get_path(std::path::Path::new(".cadence")).is_err());

    // Session state lives on disk but never in a commit.
    assert!(engine.store().history_dir().exists());
}
