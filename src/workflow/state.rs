//! Phase state machine with transition validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::clog;

use super::Phase;

/// A record of a phase being entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase: Phase,
    pub entered_at: DateTime<Utc>,
    /// Iteration of the Execute..Evaluate loop this entry belongs to.
    pub iteration: u32,
    /// The phase was passed over without running.
    #[serde(default)]
    pub skipped: bool,
}

/// Drives the session through its phases:
///
/// Classify -> Init -> Understand -> Plan -> Execute -> Verify -> Quality
/// -> Commit -> Evaluate -> (Execute | Complete)
///
/// Any running phase may enter `Blocked`; leaving `Blocked` returns to the
/// phase that blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseMachine {
    phase: Phase,
    iteration: u32,
    /// Phase to return to when leaving `Blocked`.
    #[serde(default)]
    resume_to: Option<Phase>,
    history: Vec<PhaseHistoryEntry>,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            phase: Phase::Classify,
            iteration: 1,
            resume_to: None,
            history: vec![PhaseHistoryEntry {
                phase: Phase::Classify,
                entered_at: Utc::now(),
                iteration: 1,
                skipped: false,
            }],
        }
    }

    pub fn can_transition(&self, target: Phase) -> bool {
        if self.phase == Phase::Blocked {
            return self.resume_to == Some(target);
        }
        if target == Phase::Blocked {
            return !self.phase.is_terminal();
        }
        matches!(
            (self.phase, target),
            (Phase::Classify, Phase::Init)
                | (Phase::Init, Phase::Understand)
                | (Phase::Understand, Phase::Plan)
                | (Phase::Plan, Phase::Execute)
                | (Phase::Execute, Phase::Verify)
                | (Phase::Verify, Phase::Quality)
                | (Phase::Quality, Phase::Commit)
                | (Phase::Commit, Phase::Evaluate)
                | (Phase::Evaluate, Phase::Execute)
                | (Phase::Evaluate, Phase::Complete)
        )
    }

    pub fn transition(&mut self, target: Phase) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.phase.to_string(),
                to: target.to_string(),
            });
        }
        match (self.phase, target) {
            (_, Phase::Blocked) => self.resume_to = Some(self.phase),
            (Phase::Blocked, _) => self.resume_to = None,
            (Phase::Evaluate, Phase::Execute) => self.iteration += 1,
            _ => {}
        }
        clog!("Phase {} -> {} (iteration {})", self.phase, target, self.iteration);
        self.phase = target;
        self.history.push(PhaseHistoryEntry {
            phase: target,
            entered_at: Utc::now(),
            iteration: self.iteration,
            skipped: false,
        });
        Ok(())
    }

    /// Record the current phase as skipped.
    ///
    /// # Errors
    /// `InvalidPhaseTransition` for phases that must always run.
    pub fn skip_current(&mut self) -> Result<()> {
        if !self.phase.is_skippable() {
            return Err(Error::InvalidPhaseTransition {
                from: self.phase.to_string(),
                to: "skipped".to_string(),
            });
        }
        if let Some(entry) = self.history.last_mut() {
            entry.skipped = true;
        }
        clog!("Phase {} skipped", self.phase);
        Ok(())
    }

    /// Suspend the machine, remembering where to pick up.
    pub fn block(&mut self) -> Result<()> {
        self.transition(Phase::Blocked)
    }

    /// Leave `Blocked` for the phase that blocked.
    pub fn unblock(&mut self) -> Result<()> {
        let target = self.resume_to.ok_or_else(|| Error::InvalidPhaseTransition {
            from: self.phase.to_string(),
            to: "resume".to_string(),
        })?;
        self.transition(target)
    }

    pub fn current_phase(&self) -> Phase {
        self.phase
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn resume_to(&self) -> Option<Phase> {
        self.resume_to
    }

    pub fn phase_history(&self) -> &[PhaseHistoryEntry] {
        &self.history
    }

    /// Whether `phase` was run (not skipped) at least once.
    pub fn has_run(&self, phase: Phase) -> bool {
        self.history.iter().any(|e| e.phase == phase && !e.skipped)
    }
}
