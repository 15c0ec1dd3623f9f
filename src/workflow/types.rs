//! Session and phase type definitions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an orchestration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the UUID, for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle phases, in the order they run.
///
/// `Evaluate` loops back to `Execute` while work remains. `Blocked` is a
/// pseudo-phase entered from any running phase when progress needs outside
/// input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Classify,
    Init,
    Understand,
    Plan,
    Execute,
    Verify,
    Quality,
    Commit,
    Evaluate,
    Complete,
    Blocked,
}

impl Phase {
    /// Phases that may be recorded as skipped instead of run.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Phase::Classify | Phase::Plan | Phase::Verify | Phase::Commit)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Classify => "classify",
            Phase::Init => "init",
            Phase::Understand => "understand",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Verify => "verify",
            Phase::Quality => "quality",
            Phase::Commit => "commit",
            Phase::Evaluate => "evaluate",
            Phase::Complete => "complete",
            Phase::Blocked => "blocked",
        };
        write!(f, "{}", name)
    }
}

/// Status of a session in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Running,
    /// Suspended on an approval request.
    PendingApproval,
    /// Suspended on a blocked-task resolution request.
    Blocked,
    /// Cancelled; resumable.
    Paused,
    Completed,
    Aborted,
    Failed,
}

impl SessionStatus {
    /// Whether `resume` may pick the session up again.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            SessionStatus::Running
                | SessionStatus::PendingApproval
                | SessionStatus::Blocked
                | SessionStatus::Paused
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::PendingApproval => write!(f, "pending_approval"),
            SessionStatus::Blocked => write!(f, "blocked"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Aborted => write!(f, "aborted"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}
