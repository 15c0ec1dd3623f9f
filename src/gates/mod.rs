//! Quality gates: definitions, the command runner, language profiles and
//! the remediation pipeline.

pub mod pipeline;
pub mod profile;
pub mod runner;
pub mod types;

pub use pipeline::{
    count_failures, GatePipeline, NoRemediation, PipelineTarget, RemediationRequest,
    RemediationTier, Remediator, MAX_ESCALATION_ATTEMPTS, MAX_FIX_ATTEMPTS,
};
pub use profile::Profile;
pub use runner::{CommandOutput, CommandRunner, ShellRunner};
pub use types::{
    Detect, Gate, GateCategory, GateOutcome, GateStatus, GateSummary, PipelineReport,
    PipelineStage,
};
