//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - An in-memory version-control adapter
//! - Scripted gate commands, executors and remediators
//! - Temporary git repositories
//! - Predefined plans and task graphs

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{OnceCell, Semaphore};

use cadence::approval::Responder;
use cadence::core::{Task, TaskGraph, TaskId};
use cadence::gates::{
    CommandOutput, CommandRunner, Gate, GateCategory, NoRemediation, RemediationRequest,
    RemediationTier, Remediator,
};
use cadence::orchestration::{ExecutionResult, TaskBoard, TaskExecutor};
use cadence::planner::{Classification, Plan, Planner};
use cadence::vcs::{SavedWorktree, VersionControl};
use cadence::{Collaborators, Result};

// ========== Version control ==========

#[derive(Default)]
struct MemoryTree {
    committed: BTreeMap<PathBuf, Vec<u8>>,
    working: BTreeMap<PathBuf, Vec<u8>>,
    snapshots: Vec<BTreeMap<PathBuf, Vec<u8>>>,
}

/// Version control over an in-memory file map. Snapshot refs are the
/// snapshot number zero-padded to 40 characters.
#[derive(Default)]
pub struct MemoryVcs {
    tree: Mutex<MemoryTree>,
}

impl MemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, path: &str, content: &str) {
        self.tree
            .lock()
            .unwrap()
            .working
            .insert(PathBuf::from(path), content.as_bytes().to_vec());
    }

    pub fn contents(&self, path: &str) -> Option<String> {
        self.tree
            .lock()
            .unwrap()
            .working
            .get(Path::new(path))
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn snapshot_count(&self) -> usize {
        self.tree.lock().unwrap().snapshots.len()
    }
}

impl VersionControl for MemoryVcs {
    fn snapshot(&self, _message: &str) -> Result<String> {
        let mut tree = self.tree.lock().unwrap();
        let files = tree.working.clone();
        tree.committed = files.clone();
        tree.snapshots.push(files);
        Ok(format!("{:040}", tree.snapshots.len()))
    }

    fn restore(&self, commit_ref: &str) -> Result<()> {
        let mut tree = self.tree.lock().unwrap();
        let n: usize = commit_ref
            .parse()
            .map_err(|_| cadence::Error::RefNotFound(commit_ref.to_string()))?;
        let files = tree
            .snapshots
            .get(n.wrapping_sub(1))
            .cloned()
            .ok_or_else(|| cadence::Error::RefNotFound(commit_ref.to_string()))?;
        tree.committed = files.clone();
        tree.working = files;
        Ok(())
    }

    fn dirty_paths(&self) -> Result<BTreeSet<PathBuf>> {
        let tree = self.tree.lock().unwrap();
        let mut dirty: BTreeSet<PathBuf> = tree
            .working
            .iter()
            .filter(|(p, c)| tree.committed.get(*p) != Some(*c))
            .map(|(p, _)| p.clone())
            .collect();
        dirty.extend(
            tree.committed
                .keys()
                .filter(|p| !tree.working.contains_key(*p))
                .cloned(),
        );
        Ok(dirty)
    }

    fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.lock().unwrap().working.get(path).cloned())
    }

    fn restore_paths(&self, saved: &SavedWorktree, paths: &BTreeSet<PathBuf>) -> Result<()> {
        let mut tree = self.tree.lock().unwrap();
        for path in paths {
            let content = match saved.files.get(path) {
                Some(content) => content.clone(),
                None => tree.committed.get(path).cloned(),
            };
            match content {
                Some(bytes) => {
                    tree.working.insert(path.clone(), bytes);
                }
                None => {
                    tree.working.remove(path);
                }
            }
        }
        Ok(())
    }
}

// ========== Gate commands ==========

/// Replays canned outputs per command; the last one repeats. Unscripted
/// commands pass.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<BTreeMap<String, VecDeque<CommandOutput>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `(exit code, stdout)` results for a command.
    pub fn script(&self, command: &str, results: &[(i32, &str)]) -> &Self {
        let outputs = results
            .iter()
            .map(|(code, out)| output(*code, out))
            .collect();
        self.scripts
            .lock()
            .unwrap()
            .insert(command.to_string(), outputs);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls().iter().filter(|c| *c == command).count()
    }
}

pub fn output(code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: stdout.to_string(),
        ..CommandOutput::default()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str, _cwd: &Path, _timeout: Duration) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.to_string());
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.entry(command.to_string()).or_default();
        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(next.unwrap_or_else(|| output(0, "")))
    }
}

/// Records every remediation request and optionally writes a file into the
/// in-memory tree, so reverts can be observed.
pub struct RecordingRemediator {
    vcs: Option<Arc<MemoryVcs>>,
    requests: Mutex<Vec<(String, RemediationTier, u32)>>,
}

impl RecordingRemediator {
    pub fn new() -> Self {
        Self {
            vcs: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Each request writes `fix-<gate>-<n>.txt`.
    pub fn writing_to(vcs: Arc<MemoryVcs>) -> Self {
        Self {
            vcs: Some(vcs),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<(String, RemediationTier, u32)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Remediator for RecordingRemediator {
    async fn remediate(&self, request: &RemediationRequest) -> Result<()> {
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push((request.gate.clone(), request.tier, request.attempt));
            requests.len()
        };
        if let Some(vcs) = &self.vcs {
            vcs.write(&format!("fix-{}-{}.txt", request.gate, n), "patched");
        }
        Ok(())
    }
}

// ========== Executors ==========

/// Succeeds for every task, writes `<task id>.rs` and records the order in
/// which tasks started. With a board attached it also records any task that
/// started before all of its blockers were complete.
#[derive(Default)]
pub struct RecordingExecutor {
    vcs: Option<Arc<MemoryVcs>>,
    board: OnceCell<TaskBoard>,
    started: Mutex<Vec<TaskId>>,
    early_starts: Mutex<Vec<TaskId>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writing_to(vcs: Arc<MemoryVcs>) -> Self {
        Self {
            vcs: Some(vcs),
            ..Self::default()
        }
    }

    pub fn watch(&self, board: TaskBoard) {
        let _ = self.board.set(board);
    }

    pub fn started(&self) -> Vec<TaskId> {
        self.started.lock().unwrap().clone()
    }

    pub fn early_starts(&self) -> Vec<TaskId> {
        self.early_starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
    async fn execute(&self, task: &Task) -> Result<ExecutionResult> {
        if let Some(board) = self.board.get() {
            let blockers: Vec<TaskId> = task.blocked_by.iter().cloned().collect();
            let ready = board
                .read(|graph| {
                    blockers
                        .iter()
                        .all(|b| graph.get(b).is_some_and(|t| t.status.is_complete()))
                })
                .await;
            if !ready {
                self.early_starts.lock().unwrap().push(task.id.clone());
            }
        }
        self.started.lock().unwrap().push(task.id.clone());
        tokio::task::yield_now().await;

        let path = format!("{}.rs", task.id);
        if let Some(vcs) = &self.vcs {
            vcs.write(&path, &format!("// {}\n", task.title));
        }
        Ok(ExecutionResult {
            changed_paths: vec![PathBuf::from(path)],
            success: true,
            diagnostics: String::new(),
        })
    }
}

/// Holds every execution until the test opens the gate, counting how many
/// are waiting and the most that were ever in flight together.
pub struct GatedExecutor {
    gate: Semaphore,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl GatedExecutor {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn open(&self) {
        self.gate.add_permits(1024);
    }

    /// Poll until `n` executions are waiting at the gate.
    pub async fn wait_for(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.in_flight() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("executions never reached the gate");
    }
}

#[async_trait]
impl TaskExecutor for GatedExecutor {
    async fn execute(&self, task: &Task) -> Result<ExecutionResult> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let permit = self.gate.acquire().await;
        drop(permit);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ExecutionResult {
            changed_paths: vec![PathBuf::from(format!("{}.rs", task.id))],
            success: true,
            diagnostics: String::new(),
        })
    }
}

/// Fails every execution of the named tasks.
pub struct FailingExecutor {
    failing: BTreeSet<TaskId>,
    attempts: Mutex<BTreeMap<TaskId, u32>>,
}

impl FailingExecutor {
    pub fn new(failing: &[&str]) -> Self {
        Self {
            failing: failing.iter().map(|id| TaskId::new(*id)).collect(),
            attempts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn attempts(&self, id: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&TaskId::new(id))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl TaskExecutor for FailingExecutor {
    async fn execute(&self, task: &Task) -> Result<ExecutionResult> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(task.id.clone())
            .or_default() += 1;
        let success = !self.failing.contains(&task.id);
        Ok(ExecutionResult {
            changed_paths: if success {
                vec![PathBuf::from(format!("{}.rs", task.id))]
            } else {
                Vec::new()
            },
            success,
            diagnostics: if success {
                String::new()
            } else {
                "agent gave up".to_string()
            },
        })
    }
}

// ========== Planning ==========

pub struct StaticPlanner(pub Plan);

impl StaticPlanner {
    pub fn parse(toml: &str) -> Self {
        Self(Plan::parse(toml).expect("invalid test plan"))
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn classify(&self, prompt: &str) -> Result<Classification> {
        Ok(Classification::infer(prompt))
    }

    async fn plan(&self, _prompt: &str, _classification: &Classification) -> Result<Plan> {
        Ok(self.0.clone())
    }
}

/// `T1 -> T2 -> T3` with `T4` independent.
pub const CHAIN_WITH_SIDE_TASK: &str = r#"
[[tasks]]
key = "T1"
title = "Add session model"

[[tasks]]
key = "T2"
title = "Add session store"
blocked_by = ["T1"]

[[tasks]]
key = "T3"
title = "Add login endpoint"
blocked_by = ["T2"]

[[tasks]]
key = "T4"
title = "Update README"
"#;

/// `count` independent tasks with disjoint scopes.
pub fn independent_tasks(count: usize) -> TaskGraph {
    let mut graph = TaskGraph::new();
    for i in 1..=count {
        let task = Task::new(format!("T{}", i).as_str(), &format!("task {}", i))
            .with_scope([format!("src/mod{}", i)])
            .with_estimate(2);
        graph.add_task(task).unwrap();
    }
    graph
}

pub fn chain_graph() -> TaskGraph {
    Plan::parse(CHAIN_WITH_SIDE_TASK)
        .unwrap()
        .into_graph()
        .unwrap()
}

/// Engine wiring with `lint` and `test` gates and no remediation.
pub fn collaborators(
    plan: &str,
    executor: Arc<dyn TaskExecutor>,
    runner: Arc<ScriptedRunner>,
    vcs: Arc<dyn VersionControl>,
    responder: Arc<dyn Responder>,
) -> Collaborators {
    Collaborators {
        planner: Arc::new(StaticPlanner::parse(plan)),
        executor,
        remediator: Arc::new(NoRemediation),
        runner,
        vcs,
        responder,
        gates: vec![
            Gate::new(GateCategory::Lint, "lint"),
            Gate::new(GateCategory::Test, "test"),
        ],
    }
}

// ========== Git ==========

/// A temporary git repository with one initial commit.
pub struct TestRepo {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        let repo = git2::Repository::init(&path).expect("Failed to init git");
        {
            let mut config = repo.config().expect("Failed to open git config");
            config.set_str("user.name", "Test User").unwrap();
            config.set_str("user.email", "test@test.com").unwrap();
        }

        std::fs::write(path.join("README.md"), "# Test Repository\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = repo.signature().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .expect("Failed to create initial commit");

        Self { temp_dir, path }
    }

    pub fn write(&self, relative: &str, content: &str) {
        let full = self.path.join(relative);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, content).unwrap();
    }

    pub fn read(&self, relative: &str) -> Option<String> {
        std::fs::read_to_string(self.path.join(relative)).ok()
    }
}
