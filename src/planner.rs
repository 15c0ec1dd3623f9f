//! Classification and planning contract.
//!
//! Turning a request into tasks is an external concern. The engine only
//! needs a [`Planner`] that classifies the request and produces a [`Plan`],
//! a list of task specs whose `blocked_by` keys name the edges. The built-in
//! [`PlanFilePlanner`] reads the plan from a TOML file.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::{Priority, Task, TaskGraph, TaskId, TaskKind};
use crate::{clog, clog_debug, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkCategory {
    #[default]
    Feature,
    Bugfix,
    Refactor,
    Test,
    Docs,
    Chore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    #[default]
    Small,
    Moderate,
    Large,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default)]
    pub category: WorkCategory,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub summary: String,
}

impl Classification {
    /// Keyword heuristic used when nothing better is available.
    pub fn infer(prompt: &str) -> Self {
        let lower = prompt.to_lowercase();
        let category = if contains_any(&lower, &["fix", "bug", "crash", "broken", "regression"]) {
            WorkCategory::Bugfix
        } else if contains_any(&lower, &["refactor", "clean up", "restructure", "simplify"]) {
            WorkCategory::Refactor
        } else if contains_any(&lower, &["test", "coverage"]) {
            WorkCategory::Test
        } else if contains_any(&lower, &["doc", "readme", "changelog"]) {
            WorkCategory::Docs
        } else if contains_any(&lower, &["bump", "upgrade", "dependency", "ci "]) {
            WorkCategory::Chore
        } else {
            WorkCategory::Feature
        };
        let words = lower.split_whitespace().count();
        let complexity = match words {
            0..=5 => Complexity::Trivial,
            6..=20 => Complexity::Small,
            21..=60 => Complexity::Moderate,
            _ => Complexity::Large,
        };
        Self {
            category,
            complexity,
            summary: prompt.lines().next().unwrap_or("").trim().to_string(),
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Task kind implied by a title, for plans that leave it out.
pub fn infer_kind(title: &str) -> TaskKind {
    let lower = title.to_lowercase();
    if contains_any(&lower, &["fix", "bug"]) {
        TaskKind::Fix
    } else if contains_any(&lower, &["refactor", "extract", "rename"]) {
        TaskKind::Refactor
    } else if contains_any(&lower, &["test", "spec"]) {
        TaskKind::Test
    } else if contains_any(&lower, &["doc", "readme"]) {
        TaskKind::Docs
    } else {
        TaskKind::Implement
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: Option<TaskKind>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub scope: Vec<PathBuf>,
    #[serde(default = "default_estimate")]
    pub estimate: u32,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub requires_checkpoint: bool,
}

fn default_estimate() -> u32 {
    1
}

impl TaskSpec {
    fn to_task(&self) -> Task {
        let mut task = Task::new(self.key.as_str(), &self.title)
            .with_kind(self.kind.unwrap_or_else(|| infer_kind(&self.title)))
            .with_priority(self.priority)
            .with_description(&self.description)
            .with_scope(self.scope.iter().cloned())
            .with_estimate(self.estimate);
        task.requires_approval = self.requires_approval;
        task.requires_checkpoint = self.requires_checkpoint;
        task
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl Plan {
    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Build the task graph. Tasks are inserted in plan order, then edges.
    ///
    /// # Errors
    /// `DuplicateTask` for a repeated key, `TaskNotFound` for a dependency
    /// on an unknown key, `DependencyCycle` if the edges do not form a DAG.
    pub fn into_graph(self) -> Result<TaskGraph> {
        if self.tasks.is_empty() {
            return Err(Error::Validation("plan contains no tasks".to_string()));
        }
        let mut graph = TaskGraph::new();
        for spec in &self.tasks {
            graph.add_task(spec.to_task())?;
        }
        for spec in &self.tasks {
            let dependent = TaskId::new(spec.key.as_str());
            for blocker in &spec.blocked_by {
                graph.add_dependency(&TaskId::new(blocker.as_str()), &dependent)?;
            }
        }
        clog_debug!(
            "Plan built: {} tasks, {} dependencies",
            graph.len(),
            graph.dependency_count()
        );
        Ok(graph)
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn classify(&self, prompt: &str) -> Result<Classification>;
    async fn plan(&self, prompt: &str, classification: &Classification) -> Result<Plan>;
}

/// Reads the plan from a TOML file:
///
/// ```toml
/// [classification]
/// category = "feature"
///
/// [[tasks]]
/// key = "T1"
/// title = "Add login endpoint"
/// scope = ["src/auth"]
///
/// [[tasks]]
/// key = "T2"
/// title = "Add login tests"
/// blocked_by = ["T1"]
/// ```
pub struct PlanFilePlanner {
    path: PathBuf,
}

impl PlanFilePlanner {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn read(&self) -> Result<Plan> {
        let contents = fs::read_to_string(&self.path).map_err(|e| {
            Error::Validation(format!("cannot read plan {}: {}", self.path.display(), e))
        })?;
        Plan::parse(&contents)
    }
}

#[async_trait]
impl Planner for PlanFilePlanner {
    async fn classify(&self, prompt: &str) -> Result<Classification> {
        let classification = match self.read()?.classification {
            Some(mut declared) => {
                if declared.summary.is_empty() {
                    declared.summary = Classification::infer(prompt).summary;
                }
                declared
            }
            None => Classification::infer(prompt),
        };
        clog!(
            "Classified as {:?} ({:?})",
            classification.category,
            classification.complexity
        );
        Ok(classification)
    }

    async fn plan(&self, _prompt: &str, _classification: &Classification) -> Result<Plan> {
        let plan = self.read()?;
        clog!("Loaded plan {} ({} tasks)", self.path.display(), plan.tasks.len());
        Ok(plan)
    }
}
