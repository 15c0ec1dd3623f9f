//! Task data model for the dependency graph.
//!
//! Tasks are the atomic units of work handed to the executor. Each task
//! tracks its status, priority, ownership, and dependency edges. The
//! `blocked_by`/`blocks` sets are maintained by [`TaskGraph`] and should not
//! be edited directly.
//!
//! [`TaskGraph`]: crate::core::TaskGraph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use uuid::Uuid;

use crate::orchestration::WorkerId;

/// Stable identifier for a task.
///
/// Plans name their tasks (`T1`, `auth-api`); tasks created at runtime get a
/// generated id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id of the form `t-1a2b3c4d`.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("t-{}", &uuid[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Implement,
    Fix,
    Refactor,
    Test,
    Docs,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Implement => write!(f, "implement"),
            TaskKind::Fix => write!(f, "fix"),
            TaskKind::Refactor => write!(f, "refactor"),
            TaskKind::Test => write!(f, "test"),
            TaskKind::Docs => write!(f, "docs"),
        }
    }
}

/// Severity-ordered priority. `S0` sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum Priority {
    S0,
    S1,
    #[default]
    S2,
    S3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::S0 => write!(f, "S0"),
            Priority::S1 => write!(f, "S1"),
            Priority::S2 => write!(f, "S2"),
            Priority::S3 => write!(f, "S3"),
        }
    }
}

/// Task status in its lifecycle.
///
/// `pending -> claimed -> in_progress -> {complete | failed | blocked}`.
/// Failed and blocked tasks may return to pending after remediation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    #[default]
    Pending,
    Claimed,
    InProgress,
    Complete,
    Failed {
        error: String,
    },
    Blocked {
        reason: String,
    },
}

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Blocked { .. } => "blocked",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, TaskStatus::Complete)
    }

    /// Complete or failed; nothing further will happen to the task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed { .. })
    }

    /// Owned by a worker right now.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// A single task in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    /// Tasks that must complete before this one may start.
    #[serde(default)]
    pub blocked_by: BTreeSet<TaskId>,
    /// Inverse of `blocked_by`.
    #[serde(default)]
    pub blocks: BTreeSet<TaskId>,
    /// Files or directories this task may write.
    #[serde(default)]
    pub scope: Vec<PathBuf>,
    /// Relative size of the work, in abstract units.
    #[serde(default = "default_estimate")]
    pub estimate: u32,
    #[serde(default)]
    pub requires_checkpoint: bool,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub owner: Option<WorkerId>,
    /// Worker-level retries consumed so far.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub changed_paths: Vec<PathBuf>,
    /// Answers and resolution notes attached by the caller.
    #[serde(default)]
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_estimate() -> u32 {
    1
}

impl Task {
    /// Create a pending task with default priority and no dependencies.
    pub fn new(id: impl Into<TaskId>, title: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: String::new(),
            kind: TaskKind::default(),
            priority: Priority::default(),
            status: TaskStatus::Pending,
            blocked_by: BTreeSet::new(),
            blocks: BTreeSet::new(),
            scope: Vec::new(),
            estimate: default_estimate(),
            requires_checkpoint: false,
            requires_approval: false,
            approved: false,
            owner: None,
            retries: 0,
            changed_paths: Vec::new(),
            notes: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_scope<I, P>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.scope = scope.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_estimate(mut self, estimate: u32) -> Self {
        self.estimate = estimate;
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn requiring_checkpoint(mut self) -> Self {
        self.requires_checkpoint = true;
        self
    }

    /// Still waiting for a sign-off before it may be claimed.
    pub fn awaiting_approval(&self) -> bool {
        self.requires_approval && !self.approved
    }

    pub(crate) fn claim(&mut self, worker: WorkerId) {
        self.status = TaskStatus::Claimed;
        self.owner = Some(worker);
    }

    pub(crate) fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn complete(&mut self, changed_paths: Vec<PathBuf>) {
        self.status = TaskStatus::Complete;
        self.owner = None;
        self.changed_paths = changed_paths;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.owner = None;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn block(&mut self, reason: &str) {
        self.status = TaskStatus::Blocked {
            reason: reason.to_string(),
        };
        self.owner = None;
    }

    /// Return the task to the pool, dropping ownership.
    pub(crate) fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.owner = None;
        self.started_at = None;
    }
}
