//! Session lifecycle types and the phase state machine.

mod state;
mod types;

pub use state::{PhaseHistoryEntry, PhaseMachine};
pub use types::{Phase, SessionId, SessionStatus};
