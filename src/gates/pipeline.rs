//! The gate pipeline: check, fix, re-check, with a bounded budget.
//!
//! For each blocking gate the pipeline runs the check, then spends up to
//! [`MAX_FIX_ATTEMPTS`] total check runs on remediation (the gate's own fix
//! command first, then delegated manual fixes). A remediation that raises
//! the failure count is reverted on the spot and the gate escalates instead
//! of retrying. An escalated gate gets at most [`MAX_ESCALATION_ATTEMPTS`]
//! assisted tries before it is reported unresolved. Attempt counters live in
//! each gate's outcome and start from zero on every run.

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use super::runner::{CommandOutput, CommandRunner};
use super::types::{Gate, GateCategory, GateOutcome, GateStatus, PipelineReport, PipelineStage};
use crate::core::TaskId;
use crate::error::Result;
use crate::util::{blocking, within_scope};
use crate::vcs::{SavedWorktree, VersionControl};
use crate::{clog, clog_debug, clog_warn};

/// Check runs per gate before escalation, including the first.
pub const MAX_FIX_ATTEMPTS: u32 = 3;
/// Assisted tries after escalation before a gate is unresolved.
pub const MAX_ESCALATION_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationTier {
    /// In-budget fix attempt.
    Manual,
    /// External assistance after escalation.
    Assisted,
}

/// Everything a remediator needs to attempt a fix.
#[derive(Debug, Clone)]
pub struct RemediationRequest {
    pub gate: String,
    pub category: GateCategory,
    pub command: String,
    pub output: String,
    pub attempt: u32,
    pub tier: RemediationTier,
    pub task_ids: Vec<TaskId>,
    pub scope: Vec<PathBuf>,
}

#[async_trait]
pub trait Remediator: Send + Sync {
    async fn remediate(&self, request: &RemediationRequest) -> Result<()>;
}

/// A remediator that never changes anything. Gates without a fix command
/// then escalate after re-checking.
#[derive(Debug, Clone, Default)]
pub struct NoRemediation;

#[async_trait]
impl Remediator for NoRemediation {
    async fn remediate(&self, request: &RemediationRequest) -> Result<()> {
        clog_debug!(
            "No remediator configured for gate {} ({:?} attempt {})",
            request.gate,
            request.tier,
            request.attempt
        );
        Ok(())
    }
}

/// What a pipeline run covers.
#[derive(Debug, Clone)]
pub struct PipelineTarget {
    pub stage: PipelineStage,
    pub task_ids: Vec<TaskId>,
    /// Limits which changed paths a revert may touch. Empty means anywhere,
    /// unless other writers share the tree.
    pub scope: Vec<PathBuf>,
    pub concurrent: bool,
}

impl PipelineTarget {
    pub fn task(task_id: TaskId, scope: Vec<PathBuf>) -> Self {
        Self {
            stage: PipelineStage::Task,
            task_ids: vec![task_id],
            scope,
            concurrent: false,
        }
    }

    /// Other workers may change the tree while this run is in progress.
    pub fn with_concurrent_writers(mut self) -> Self {
        self.concurrent = true;
        self
    }

    pub fn workspace(stage: PipelineStage, task_ids: Vec<TaskId>) -> Self {
        Self {
            stage,
            task_ids,
            scope: Vec::new(),
            concurrent: false,
        }
    }
}

/// Sum the failure counts a tool prints (`3 failed`, `2 errors`); a failing
/// run with no recognizable count counts as one failure.
pub fn count_failures(output: &CommandOutput) -> u32 {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    if output.success() {
        return 0;
    }
    if output.timed_out {
        return 1;
    }
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(\d+)\s+(?:failed|failures?|errors?|problems?|violations?)\b").ok()
    });
    let text = output.combined();
    let total: u32 = pattern
        .as_ref()
        .map(|re| {
            re.captures_iter(&text)
                .filter_map(|c| c.get(1)?.as_str().parse::<u32>().ok())
                .sum()
        })
        .unwrap_or(0);
    total.max(1)
}

enum Remedy<'a> {
    Fix(&'a str),
    Delegate(RemediationTier, u32),
}

struct Check {
    output: CommandOutput,
    failures: u32,
    regressed: bool,
    reverted: bool,
}

pub struct GatePipeline {
    root: PathBuf,
    gates: Vec<Gate>,
    runner: Arc<dyn CommandRunner>,
    remediator: Arc<dyn Remediator>,
    vcs: Arc<dyn VersionControl>,
    timeouts: BTreeMap<String, u64>,
    advisory_overrides: BTreeSet<String>,
}

impl GatePipeline {
    /// Gates are run in category order; gates sharing a category keep the
    /// order they were given in.
    pub fn new(
        root: PathBuf,
        mut gates: Vec<Gate>,
        runner: Arc<dyn CommandRunner>,
        remediator: Arc<dyn Remediator>,
        vcs: Arc<dyn VersionControl>,
    ) -> Self {
        gates.sort_by_key(|g| g.category);
        Self {
            root,
            gates,
            runner,
            remediator,
            vcs,
            timeouts: BTreeMap::new(),
            advisory_overrides: BTreeSet::new(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: BTreeMap<String, u64>) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_advisory_overrides(mut self, overrides: BTreeSet<String>) -> Self {
        self.advisory_overrides = overrides;
        self
    }

    pub fn gates(&self) -> &[Gate] {
        &self.gates
    }

    pub fn timeout_for(&self, gate: &Gate) -> Duration {
        self.timeouts
            .get(&gate.name)
            .or_else(|| self.timeouts.get(&gate.category.to_string()))
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| gate.timeout())
    }

    /// Run the pipeline. Task and verify stages run blocking gates only;
    /// quality runs advisory gates too. Blocking gates after an unresolved
    /// one are skipped.
    pub async fn run(&self, target: &PipelineTarget) -> Result<PipelineReport> {
        let include_advisory = target.stage == PipelineStage::Quality;
        let mut outcomes = Vec::new();
        let mut warnings = Vec::new();
        let mut touched = BTreeSet::new();
        let mut override_outstanding = false;
        let mut unresolved: Option<String> = None;

        clog_debug!(
            "Pipeline {} starting for {:?} ({} gates)",
            target.stage,
            target.task_ids,
            self.gates.len()
        );

        for gate in &self.gates {
            if !gate.blocking && !include_advisory {
                continue;
            }
            let overridden = gate.blocking && self.advisory_overrides.contains(&gate.name);
            let blocking = gate.blocking && !overridden;

            if !gate.detect.applies(&self.root) {
                outcomes.push(GateOutcome::skipped(gate, blocking, "not applicable"));
                continue;
            }
            if blocking {
                if let Some(name) = &unresolved {
                    let reason = format!("not run: {} unresolved", name);
                    outcomes.push(GateOutcome::skipped(gate, blocking, &reason));
                    continue;
                }
                let outcome = self.run_blocking(gate, target, &mut touched).await?;
                if outcome.status == GateStatus::Unresolved {
                    unresolved = Some(gate.name.clone());
                }
                outcomes.push(outcome);
            } else {
                let outcome = self.run_report_only(gate).await?;
                if outcome.status == GateStatus::Failed {
                    let note = if overridden {
                        override_outstanding = true;
                        "blocking gate overridden to advisory"
                    } else {
                        "advisory"
                    };
                    warnings.push(format!("{} failed ({}): {}", gate.name, note, first_line(&outcome.output)));
                }
                outcomes.push(outcome);
            }
        }

        let passed = unresolved.is_none();
        if passed {
            clog!("Pipeline {} PASS for {:?}", target.stage, target.task_ids);
        } else {
            clog_warn!("Pipeline {} FAIL for {:?}", target.stage, target.task_ids);
        }
        Ok(PipelineReport {
            stage: target.stage,
            task_ids: target.task_ids.clone(),
            gates: outcomes,
            warnings,
            override_outstanding,
            touched_paths: touched,
            passed,
            finished_at: Utc::now(),
        })
    }

    async fn check(&self, gate: &Gate) -> Result<CommandOutput> {
        self.runner
            .run(&gate.command, &self.root, self.timeout_for(gate))
            .await
    }

    async fn run_report_only(&self, gate: &Gate) -> Result<GateOutcome> {
        let started = Instant::now();
        let output = self.check(gate).await?;
        let failures = count_failures(&output);
        Ok(GateOutcome {
            name: gate.name.clone(),
            category: gate.category,
            blocking: false,
            status: if output.success() {
                GateStatus::Passed
            } else {
                GateStatus::Failed
            },
            attempts: 1,
            escalation_attempts: 0,
            failure_counts: vec![failures],
            escalated: false,
            reverted: false,
            output: output.combined(),
            duration_ms: elapsed_ms(started),
        })
    }

    async fn run_blocking(
        &self,
        gate: &Gate,
        target: &PipelineTarget,
        touched: &mut BTreeSet<PathBuf>,
    ) -> Result<GateOutcome> {
        let started = Instant::now();
        let mut outcome = GateOutcome {
            name: gate.name.clone(),
            category: gate.category,
            blocking: true,
            status: GateStatus::Unresolved,
            attempts: 0,
            escalation_attempts: 0,
            failure_counts: Vec::new(),
            escalated: false,
            reverted: false,
            output: String::new(),
            duration_ms: 0,
        };

        let output = self.check(gate).await?;
        let mut failures = count_failures(&output);
        outcome.attempts = 1;
        outcome.failure_counts.push(failures);
        outcome.output = output.combined();
        if output.success() {
            outcome.status = GateStatus::Passed;
            outcome.duration_ms = elapsed_ms(started);
            return Ok(outcome);
        }
        clog_debug!("Gate {} failed attempt 1 ({} failures)", gate.name, failures);

        let mut regressed = false;
        while outcome.attempts < MAX_FIX_ATTEMPTS {
            let remedy = match (&gate.fix_command, outcome.attempts) {
                (Some(fix), 1) => Remedy::Fix(fix),
                _ => Remedy::Delegate(RemediationTier::Manual, outcome.attempts),
            };
            let check = self
                .remediate_and_check(gate, target, remedy, failures, &outcome.output, touched)
                .await?;
            outcome.attempts += 1;
            outcome.failure_counts.push(check.failures);
            outcome.output = check.output.combined();
            if check.output.success() {
                outcome.status = GateStatus::Passed;
                outcome.duration_ms = elapsed_ms(started);
                clog!("Gate {} passed after {} attempts", gate.name, outcome.attempts);
                return Ok(outcome);
            }
            if check.regressed {
                outcome.reverted = check.reverted;
                regressed = true;
                clog_warn!(
                    "Gate {} regressed on attempt {} ({} -> {} failures) for tasks {:?}{}",
                    gate.name,
                    outcome.attempts,
                    failures,
                    check.failures,
                    target.task_ids,
                    if check.reverted { "; reverted" } else { "; nothing to revert" }
                );
                break;
            }
            failures = check.failures;
        }

        outcome.escalated = true;
        clog_warn!(
            "Gate {} failed-escalated for tasks {:?} after {} attempts{}",
            gate.name,
            target.task_ids,
            outcome.attempts,
            if regressed { " (regression)" } else { "" }
        );

        for attempt in 1..=MAX_ESCALATION_ATTEMPTS {
            let remedy = Remedy::Delegate(RemediationTier::Assisted, attempt);
            let check = self
                .remediate_and_check(gate, target, remedy, failures, &outcome.output, touched)
                .await?;
            outcome.escalation_attempts = attempt;
            outcome.failure_counts.push(check.failures);
            outcome.output = check.output.combined();
            if check.output.success() {
                outcome.status = GateStatus::Passed;
                outcome.duration_ms = elapsed_ms(started);
                clog!(
                    "Gate {} passed after escalation ({} assisted attempts)",
                    gate.name,
                    attempt
                );
                return Ok(outcome);
            }
            if check.regressed {
                outcome.reverted |= check.reverted;
                break;
            }
            failures = check.failures;
        }

        outcome.status = GateStatus::Unresolved;
        outcome.duration_ms = elapsed_ms(started);
        clog_warn!(
            "Gate {} unresolved for tasks {:?}: {} attempts, {} escalation attempts",
            gate.name,
            target.task_ids,
            outcome.attempts,
            outcome.escalation_attempts
        );
        Ok(outcome)
    }

    /// Apply one remediation, re-run the check, and revert the remediation
    /// if it made the failure count worse.
    async fn remediate_and_check(
        &self,
        gate: &Gate,
        target: &PipelineTarget,
        remedy: Remedy<'_>,
        prior_failures: u32,
        last_output: &str,
        touched: &mut BTreeSet<PathBuf>,
    ) -> Result<Check> {
        let saved = self.save_worktree().await?;

        match remedy {
            Remedy::Fix(fix) => {
                clog_debug!("Gate {}: running fix command '{}'", gate.name, fix);
                let fixed = self.runner.run(fix, &self.root, self.timeout_for(gate)).await?;
                if !fixed.success() {
                    clog_debug!("Gate {}: fix command exited unsuccessfully", gate.name);
                }
            }
            Remedy::Delegate(tier, attempt) => {
                let request = RemediationRequest {
                    gate: gate.name.clone(),
                    category: gate.category,
                    command: gate.command.clone(),
                    output: last_output.to_string(),
                    attempt,
                    tier,
                    task_ids: target.task_ids.clone(),
                    scope: target.scope.clone(),
                };
                if let Err(e) = self.remediator.remediate(&request).await {
                    if e.is_session_fatal() {
                        return Err(e);
                    }
                    clog_warn!("Gate {}: {:?} remediation failed: {}", gate.name, tier, e);
                }
            }
        }

        let output = self.check(gate).await?;
        let failures = count_failures(&output);
        let changed = self.changed_since(saved.clone(), target).await?;

        if !output.success() && failures > prior_failures {
            let reverted = !changed.is_empty();
            if reverted {
                self.revert(saved, changed).await?;
            }
            return Ok(Check {
                output,
                failures,
                regressed: true,
                reverted,
            });
        }
        touched.extend(changed);
        Ok(Check {
            output,
            failures,
            regressed: false,
            reverted: false,
        })
    }

    async fn save_worktree(&self) -> Result<SavedWorktree> {
        let vcs = Arc::clone(&self.vcs);
        blocking(move || vcs.save_worktree()).await
    }

    async fn changed_since(
        &self,
        saved: SavedWorktree,
        target: &PipelineTarget,
    ) -> Result<BTreeSet<PathBuf>> {
        let vcs = Arc::clone(&self.vcs);
        let changed = blocking(move || vcs.changed_since(&saved)).await?;
        if target.scope.is_empty() {
            if target.concurrent {
                // Without a scope, this task's changes cannot be told apart
                // from another worker's.
                clog_warn!(
                    "Tasks {:?} have no scope while other workers are active; \
                     {} changed paths left unattributed",
                    target.task_ids,
                    changed.len()
                );
                return Ok(BTreeSet::new());
            }
            return Ok(changed);
        }
        Ok(changed
            .into_iter()
            .filter(|p| within_scope(p, &target.scope))
            .collect())
    }

    async fn revert(&self, saved: SavedWorktree, paths: BTreeSet<PathBuf>) -> Result<()> {
        let vcs = Arc::clone(&self.vcs);
        blocking(move || vcs.restore_paths(&saved, &paths)).await
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("")
}
