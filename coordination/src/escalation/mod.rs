//! Escalation orchestrator — sequencing of the left-behind occupant response
//!
//! Owns the end-to-end sequence as a set of independently cancellable
//! background tasks. Only the active session's tasks run, and at most one of
//! each kind.
//!
//! # Escalation Ladder
//!
//! ```text
//! door closed ──(arm delay)──▶ detection armed
//!     │
//!     ▼
//! CountdownToAlert (5s) ── reads the latest occupant count
//!     │
//!     ├─ count == 0 → AlertActive, "check again" prompt only
//!     │
//!     ▼ count ≥ 1
//! AlertActive + AutoOpenRetrying — N × (10s countdown, lock check, 2s cool-down)
//!     │
//!     ├─ door unlocked → DoorOpenedAutomatically (alarm keeps sounding)
//!     │
//!     ▼ all attempts hit a locked door
//! AllRetriesExhausted → SosWaiting (configurable minutes) → SosSent
//!     │
//!     ▼ alert loop joined
//! AuthorityWaiting ∥ safety instructions → AuthorityNotified
//!
//! Alarm off, vehicle moving, or shutdown → Acknowledged from any live phase
//! ```

pub mod orchestrator;
pub mod phase;
pub mod session;
pub(crate) mod steps;

pub use orchestrator::{Command, Orchestrator, OrchestratorConfig, OrchestratorHandle};
pub use phase::{EscalationPhase, IllegalTransition, PhaseMachine, PhaseTransition, SessionEnd};
pub use session::{EscalationSession, SessionId, SessionSummary};
