//! Gate-verified restore points.
//!
//! Checkpoints form an append-only log ordered by creation. Rolling back
//! never removes entries: everything created after the target is marked
//! superseded. Creation is serialized through the manager's mutex so two
//! workers can never interleave partial snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::TaskId;
use crate::gates::{GateOutcome, PipelineReport, PipelineStage};
use crate::util::blocking;
use crate::vcs::VersionControl;
use crate::{clog, clog_debug, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Position in the log, starting at 1.
    pub id: u32,
    pub commit_ref: String,
    pub timestamp: DateTime<Utc>,
    pub task_ids: Vec<TaskId>,
    pub gates: Vec<GateOutcome>,
    #[serde(default)]
    pub superseded: bool,
}

impl Checkpoint {
    /// Short form of the commit ref for display.
    pub fn short_ref(&self) -> &str {
        self.commit_ref.get(..12).unwrap_or(&self.commit_ref)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointLog {
    entries: Vec<Checkpoint>,
}

impl CheckpointLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[Checkpoint] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_id(&self) -> u32 {
        self.entries.last().map(|c| c.id + 1).unwrap_or(1)
    }

    fn append(&mut self, checkpoint: Checkpoint) {
        self.entries.push(checkpoint);
    }

    /// Entries that have not been superseded by a rollback.
    pub fn active(&self) -> impl Iterator<Item = &Checkpoint> {
        self.entries.iter().filter(|c| !c.superseded)
    }

    /// The newest checkpoint still in effect.
    pub fn latest(&self) -> Option<&Checkpoint> {
        self.entries.iter().rev().find(|c| !c.superseded)
    }

    /// Look up by log id (`"3"`) or commit ref prefix (at least 7 chars).
    pub fn find(&self, reference: &str) -> Option<&Checkpoint> {
        if let Ok(id) = reference.parse::<u32>() {
            if let Some(found) = self.entries.iter().find(|c| c.id == id) {
                return Some(found);
            }
        }
        if reference.len() < 7 {
            return None;
        }
        self.entries
            .iter()
            .rev()
            .find(|c| c.commit_ref.starts_with(reference))
    }

    /// Mark every entry after `id` superseded. Returns how many changed.
    fn supersede_after(&mut self, id: u32) -> usize {
        let mut marked = 0;
        for entry in self.entries.iter_mut().filter(|c| c.id > id && !c.superseded) {
            entry.superseded = true;
            marked += 1;
        }
        marked
    }
}

pub struct CheckpointManager {
    vcs: Arc<dyn VersionControl>,
    log: Mutex<CheckpointLog>,
}

impl CheckpointManager {
    pub fn new(vcs: Arc<dyn VersionControl>, log: CheckpointLog) -> Self {
        Self {
            vcs,
            log: Mutex::new(log),
        }
    }

    /// Snapshot the work covered by `task_ids`.
    ///
    /// `report` must be the most recent pipeline run for that work.
    /// `covered_paths` are the paths the covered tasks changed; any other
    /// dirty path counts as an unrelated change.
    ///
    /// # Errors
    /// `CheckpointPrecondition` when the report did not pass, an advisory
    /// override is outstanding, the report does not cover the tasks, or the
    /// working tree holds unrelated changes. Callers defer and retry later.
    /// Workspace-wide reports cover every task, but never unrelated paths.
    pub async fn create(
        &self,
        task_ids: &[TaskId],
        report: &PipelineReport,
        covered_paths: &BTreeSet<PathBuf>,
    ) -> Result<Checkpoint> {
        let mut log = self.log.lock().await;

        if !report.passed {
            return Err(Error::CheckpointPrecondition(format!(
                "gate pipeline did not pass for {:?}",
                task_ids
            )));
        }
        if report.override_outstanding {
            return Err(Error::CheckpointPrecondition(
                "an advisory-only override is outstanding".to_string(),
            ));
        }
        let workspace_wide = matches!(report.stage, PipelineStage::Verify | PipelineStage::Quality);
        if !workspace_wide {
            if let Some(missing) = task_ids.iter().find(|id| !report.covers(id)) {
                return Err(Error::CheckpointPrecondition(format!(
                    "last pipeline run does not cover {}",
                    missing
                )));
            }
        }

        let vcs = Arc::clone(&self.vcs);
        let dirty = blocking(move || vcs.dirty_paths()).await?;
        let unrelated: Vec<&PathBuf> = dirty
            .iter()
            .filter(|p| !covered_paths.contains(*p) && !report.touched_paths.contains(*p))
            .collect();
        if !unrelated.is_empty() {
            return Err(Error::CheckpointPrecondition(format!(
                "uncommitted unrelated changes: {}",
                unrelated
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let ids: Vec<String> = task_ids.iter().map(|t| t.to_string()).collect();
        let message = format!("cadence checkpoint: {}", ids.join(", "));
        let vcs = Arc::clone(&self.vcs);
        let commit_ref = blocking(move || vcs.snapshot(&message)).await?;

        let checkpoint = Checkpoint {
            id: log.next_id(),
            commit_ref,
            timestamp: Utc::now(),
            task_ids: task_ids.to_vec(),
            gates: report.gates.clone(),
            superseded: false,
        };
        log.append(checkpoint.clone());
        clog!(
            "Checkpoint #{} at {} covering {:?}",
            checkpoint.id,
            checkpoint.short_ref(),
            checkpoint.task_ids
        );
        Ok(checkpoint)
    }

    /// Restore the working tree to a checkpoint and supersede everything
    /// created after it.
    pub async fn rollback_to(&self, reference: &str) -> Result<Checkpoint> {
        let mut log = self.log.lock().await;
        let target = log
            .find(reference)
            .cloned()
            .ok_or_else(|| Error::CheckpointNotFound(reference.to_string()))?;
        if target.superseded {
            return Err(Error::Validation(format!(
                "checkpoint #{} was superseded by an earlier rollback",
                target.id
            )));
        }

        let vcs = Arc::clone(&self.vcs);
        let commit_ref = target.commit_ref.clone();
        blocking(move || vcs.restore(&commit_ref)).await?;

        let superseded = log.supersede_after(target.id);
        clog!(
            "Rolled back to checkpoint #{} ({}), {} superseded",
            target.id,
            target.short_ref(),
            superseded
        );
        Ok(target)
    }

    pub async fn log(&self) -> CheckpointLog {
        self.log.lock().await.clone()
    }

    pub async fn latest(&self) -> Option<Checkpoint> {
        let log = self.log.lock().await;
        clog_debug!("Checkpoint log has {} entries", log.len());
        log.latest().cloned()
    }
}
