pub mod approval;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod gates;
pub mod log;
pub mod orchestration;
pub mod planner;
pub mod session;
pub mod util;
pub mod vcs;
pub mod workflow;

pub use engine::{Collaborators, Orchestrator, RunOutcome};
pub use error::{Error, Result};
pub use session::{Session, SessionStore};
pub use workflow::{Phase, SessionId, SessionStatus};
