//! Gate definitions and the results the pipeline records for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::TaskId;

/// Gate categories in the order the pipeline runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateCategory {
    Lint,
    Type,
    Test,
    Build,
    Security,
    Docs,
    Performance,
    Accessibility,
    Modernity,
}

impl GateCategory {
    /// Lint through security fail the pipeline; the rest only report.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            GateCategory::Lint
                | GateCategory::Type
                | GateCategory::Test
                | GateCategory::Build
                | GateCategory::Security
        )
    }

    pub fn default_timeout(&self) -> Duration {
        match self {
            GateCategory::Test => Duration::from_secs(600),
            GateCategory::Build => Duration::from_secs(300),
            _ => Duration::from_secs(180),
        }
    }
}

impl std::fmt::Display for GateCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GateCategory::Lint => "lint",
            GateCategory::Type => "type",
            GateCategory::Test => "test",
            GateCategory::Build => "build",
            GateCategory::Security => "security",
            GateCategory::Docs => "docs",
            GateCategory::Performance => "performance",
            GateCategory::Accessibility => "accessibility",
            GateCategory::Modernity => "modernity",
        };
        write!(f, "{}", name)
    }
}

/// When a gate applies to a project.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "when", content = "value")]
pub enum Detect {
    #[default]
    Always,
    /// A marker file relative to the project root.
    FileExists(PathBuf),
    /// A binary on `PATH`.
    Binary(String),
}

impl Detect {
    pub fn applies(&self, root: &Path) -> bool {
        match self {
            Detect::Always => true,
            Detect::FileExists(path) => root.join(path).exists(),
            Detect::Binary(name) => which::which(name).is_ok(),
        }
    }
}

/// A named check with an optional auto-fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate {
    pub name: String,
    pub category: GateCategory,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_command: Option<String>,
    pub blocking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub detect: Detect,
}

impl Gate {
    /// A gate named after its category, blocking according to the category.
    pub fn new(category: GateCategory, command: &str) -> Self {
        Self {
            name: category.to_string(),
            category,
            command: command.to_string(),
            fix_command: None,
            blocking: category.is_blocking(),
            timeout_secs: None,
            detect: Detect::Always,
        }
    }

    pub fn with_fix(mut self, fix_command: &str) -> Self {
        self.fix_command = Some(fix_command.to_string());
        self
    }

    pub fn with_detect(mut self, detect: Detect) -> Self {
        self.detect = detect;
        self
    }

    pub fn advisory(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.category.default_timeout())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    /// Advisory gate that failed; reported as a warning.
    Failed,
    /// Not applicable, or not reached because an earlier blocking gate was
    /// unresolved.
    Skipped,
    /// Blocking gate that could not be brought to pass.
    Unresolved,
}

/// What happened to one gate in one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub name: String,
    pub category: GateCategory,
    pub blocking: bool,
    pub status: GateStatus,
    /// In-budget check runs (initial + fix + manual), at most three.
    pub attempts: u32,
    /// Check runs after escalation, at most two.
    pub escalation_attempts: u32,
    /// Failure count observed after each check run.
    pub failure_counts: Vec<u32>,
    pub escalated: bool,
    /// A remediation made things worse and was rolled back.
    pub reverted: bool,
    #[serde(default)]
    pub output: String,
    pub duration_ms: u64,
}

impl GateOutcome {
    pub fn skipped(gate: &Gate, blocking: bool, reason: &str) -> Self {
        Self {
            name: gate.name.clone(),
            category: gate.category,
            blocking,
            status: GateStatus::Skipped,
            attempts: 0,
            escalation_attempts: 0,
            failure_counts: Vec::new(),
            escalated: false,
            reverted: false,
            output: reason.to_string(),
            duration_ms: 0,
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self.status, GateStatus::Passed | GateStatus::Skipped)
    }
}

/// Where in the lifecycle a pipeline ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Blocking gates over one task's work.
    Task,
    /// Blocking gates over everything changed this iteration.
    Verify,
    /// Every gate, advisory ones included.
    Quality,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::Task => write!(f, "task"),
            PipelineStage::Verify => write!(f, "verify"),
            PipelineStage::Quality => write!(f, "quality"),
        }
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub stage: PipelineStage,
    pub task_ids: Vec<TaskId>,
    pub gates: Vec<GateOutcome>,
    /// Advisory failures and overridden blocking failures.
    pub warnings: Vec<String>,
    /// A blocking gate failed but was demoted to advisory by configuration.
    pub override_outstanding: bool,
    /// Paths modified by remediation during this run.
    pub touched_paths: BTreeSet<PathBuf>,
    pub passed: bool,
    pub finished_at: DateTime<Utc>,
}

impl PipelineReport {
    pub fn covers(&self, task: &TaskId) -> bool {
        self.task_ids.contains(task)
    }

    pub fn gate(&self, name: &str) -> Option<&GateOutcome> {
        self.gates.iter().find(|g| g.name == name)
    }

    /// The first blocking gate that did not pass.
    pub fn first_unresolved(&self) -> Option<&GateOutcome> {
        self.gates
            .iter()
            .find(|g| g.status == GateStatus::Unresolved)
    }

    pub fn summary(&self) -> GateSummary {
        let mut summary = GateSummary {
            all_blocking_passed: self.passed,
            ..GateSummary::default()
        };
        for gate in &self.gates {
            summary.total += 1;
            match gate.status {
                GateStatus::Passed => summary.passed += 1,
                GateStatus::Failed | GateStatus::Unresolved => summary.failed += 1,
                GateStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub all_blocking_passed: bool,
}
