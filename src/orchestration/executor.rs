//! Task executor delegate.
//!
//! The orchestrator never edits code itself. It hands a claimed task to a
//! [`TaskExecutor`] and gets back the paths that changed. [`CommandExecutor`]
//! drives an external agent CLI (`claude -p` by default) and doubles as the
//! gate pipeline's remediator.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::core::Task;
use crate::gates::{RemediationRequest, RemediationTier, Remediator};
use crate::util::{blocking, within_scope};
use crate::vcs::{SavedWorktree, VersionControl};
use crate::{clog_debug, clog_warn, Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub changed_paths: Vec<PathBuf>,
    pub success: bool,
    pub diagnostics: String,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<ExecutionResult>;
}

/// Runs an agent command with a task prompt appended as the final argument.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    root: PathBuf,
    vcs: Arc<dyn VersionControl>,
    timeout: Duration,
}

impl CommandExecutor {
    /// # Errors
    /// `Validation` when `command` is empty.
    pub fn new(
        command: &str,
        root: PathBuf,
        vcs: Arc<dyn VersionControl>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut parts = command.split_whitespace().map(String::from);
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("executor command is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            root,
            vcs,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the agent with `prompt`, returning (success, combined output).
    async fn invoke(&self, prompt: &str) -> Result<(bool, String)> {
        clog_debug!("Invoking {} ({} chars of prompt)", self.program, prompt.len());
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(prompt)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Executor(format!("failed to start {}: {}", self.program, e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push('\n');
            text.push_str(&stderr);
        }
        Ok((output.status.success(), text))
    }

    async fn save_worktree(&self) -> Result<SavedWorktree> {
        let vcs = Arc::clone(&self.vcs);
        blocking(move || vcs.save_worktree()).await
    }

    async fn changed_since(&self, saved: SavedWorktree) -> Result<BTreeSet<PathBuf>> {
        let vcs = Arc::clone(&self.vcs);
        blocking(move || vcs.changed_since(&saved)).await
    }
}

pub fn task_prompt(task: &Task) -> String {
    let mut prompt = format!("Task {} ({}): {}\n", task.id, task.kind, task.title);
    if !task.description.is_empty() {
        prompt.push('\n');
        prompt.push_str(&task.description);
        prompt.push('\n');
    }
    if !task.scope.is_empty() {
        let scope: Vec<String> = task.scope.iter().map(|p| p.display().to_string()).collect();
        prompt.push_str(&format!("\nOnly modify files under: {}\n", scope.join(", ")));
    }
    if !task.notes.is_empty() {
        prompt.push_str("\nNotes:\n");
        for note in &task.notes {
            prompt.push_str(&format!("- {}\n", note));
        }
    }
    prompt.push_str("\nDo not commit. Leave changes in the working tree.");
    prompt
}

pub fn remediation_prompt(request: &RemediationRequest) -> String {
    let lead = match request.tier {
        RemediationTier::Manual => format!(
            "The {} gate failed (attempt {}). Fix the reported problems.",
            request.gate, request.attempt
        ),
        RemediationTier::Assisted => format!(
            "The {} gate is still failing after the automatic fix budget was spent \
             (escalation attempt {}). Diagnose the root cause and fix it.",
            request.gate, request.attempt
        ),
    };
    let mut prompt = format!("{}\n\nCheck command: {}\n", lead, request.command);
    if !request.scope.is_empty() {
        let scope: Vec<String> = request.scope.iter().map(|p| p.display().to_string()).collect();
        prompt.push_str(&format!("Only modify files under: {}\n", scope.join(", ")));
    }
    prompt.push_str("\nOutput:\n");
    prompt.push_str(tail(&request.output, 8000));
    prompt
}

/// The last `max` bytes of `text`, on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, task: &Task) -> Result<ExecutionResult> {
        let saved = self.save_worktree().await?;
        let (success, diagnostics) = self.invoke(&task_prompt(task)).await?;

        // Compared by content, so edits to already-dirty files count too.
        let changed_paths: Vec<PathBuf> = self
            .changed_since(saved)
            .await?
            .into_iter()
            .filter(|p| task.scope.is_empty() || within_scope(p, &task.scope))
            .collect();
        if !success {
            clog_warn!("Executor reported failure for {}", task.id);
        }
        Ok(ExecutionResult {
            changed_paths,
            success,
            diagnostics,
        })
    }
}

#[async_trait]
impl Remediator for CommandExecutor {
    async fn remediate(&self, request: &RemediationRequest) -> Result<()> {
        let (success, output) = self.invoke(&remediation_prompt(request)).await?;
        if !success {
            return Err(Error::Executor(format!(
                "remediation for {} exited unsuccessfully: {}",
                request.gate,
                tail(&output, 200)
            )));
        }
        Ok(())
    }
}
