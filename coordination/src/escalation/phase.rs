//! Escalation phases — explicit states and legal transition guards.
//!
//! Every session starts at `Idle` and ends at `Acknowledged`. The
//! orchestrator calls `advance()` to move between phases; each call checks
//! the transition table and records it in the session's transition log.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// The set of escalation phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPhase {
    /// No session running.
    Idle,
    /// Detection armed; the pre-alert countdown is running.
    CountdownToAlert,
    /// Alert loop running; no automatic open in progress.
    AlertActive,
    /// Automatic open attempts are counting down.
    AutoOpenRetrying,
    /// An automatic open succeeded; waiting for the operator.
    DoorOpenedAutomatically,
    /// Every automatic open attempt found the door locked.
    AllRetriesExhausted,
    /// Counting down to the emergency message.
    SosWaiting,
    /// Emergency message sent (or its delivery failed).
    SosSent,
    /// Counting down to the authority signal; safety instructions repeat.
    AuthorityWaiting,
    /// Authority signalled; safety instructions keep repeating.
    AuthorityNotified,
    /// Session over; terminal.
    Acknowledged,
}

impl EscalationPhase {
    pub fn is_terminal(self) -> bool {
        self == Self::Acknowledged
    }
}

impl fmt::Display for EscalationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::CountdownToAlert => write!(f, "CountdownToAlert"),
            Self::AlertActive => write!(f, "AlertActive"),
            Self::AutoOpenRetrying => write!(f, "AutoOpenRetrying"),
            Self::DoorOpenedAutomatically => write!(f, "DoorOpenedAutomatically"),
            Self::AllRetriesExhausted => write!(f, "AllRetriesExhausted"),
            Self::SosWaiting => write!(f, "SosWaiting"),
            Self::SosSent => write!(f, "SosSent"),
            Self::AuthorityWaiting => write!(f, "AuthorityWaiting"),
            Self::AuthorityNotified => write!(f, "AuthorityNotified"),
            Self::Acknowledged => write!(f, "Acknowledged"),
        }
    }
}

/// Legal transitions between escalation phases.
///
/// ```text
/// Idle → CountdownToAlert
/// CountdownToAlert → AlertActive
/// AlertActive → AutoOpenRetrying | AllRetriesExhausted
/// AutoOpenRetrying → DoorOpenedAutomatically | AllRetriesExhausted | AlertActive
/// AllRetriesExhausted → SosWaiting
/// SosWaiting → SosSent
/// SosSent → AuthorityWaiting
/// AuthorityWaiting → AuthorityNotified
/// ```
fn is_legal_transition(from: EscalationPhase, to: EscalationPhase) -> bool {
    use EscalationPhase::*;

    // Any live phase can be acknowledged (alarm off, vehicle moves, shutdown).
    if to == Acknowledged && !from.is_terminal() && from != Idle {
        return true;
    }

    matches!(
        (from, to),
        (Idle, CountdownToAlert)
            | (CountdownToAlert, AlertActive)
            | (AlertActive, AutoOpenRetrying)
            // Attempt count unusable: skip straight to the SOS path
            | (AlertActive, AllRetriesExhausted)
            | (AutoOpenRetrying, DoorOpenedAutomatically)
            | (AutoOpenRetrying, AllRetriesExhausted)
            // Operator opened the door by hand mid-sequence
            | (AutoOpenRetrying, AlertActive)
            | (AllRetriesExhausted, SosWaiting)
            | (SosWaiting, SosSent)
            | (SosSent, AuthorityWaiting)
            | (AuthorityWaiting, AuthorityNotified)
    )
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    AlarmOff,
    VehicleMoved,
    Shutdown,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlarmOff => write!(f, "alarm turned off"),
            Self::VehicleMoved => write!(f, "vehicle moved"),
            Self::Shutdown => write!(f, "system shut down"),
        }
    }
}

/// A single recorded phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: EscalationPhase,
    pub to: EscalationPhase,
    /// Milliseconds since the session opened.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: EscalationPhase,
    pub to: EscalationPhase,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal escalation transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// Per-session phase tracker with a transition log.
pub struct PhaseMachine {
    current: EscalationPhase,
    created_at: Instant,
    transitions: Vec<PhaseTransition>,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            current: EscalationPhase::Idle,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> EscalationPhase {
        self.current
    }

    /// Attempt to advance to the next phase.
    pub fn advance(
        &mut self,
        to: EscalationPhase,
        reason: Option<&str>,
    ) -> Result<EscalationPhase, IllegalTransition> {
        let from = self.current;
        if !is_legal_transition(from, to) {
            return Err(IllegalTransition { from, to });
        }

        tracing::debug!(from = %from, to = %to, reason, "Escalation transition");

        self.transitions.push(PhaseTransition {
            from,
            to,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(from)
    }

    /// End the session from any live phase.
    pub fn acknowledge(&mut self, end: SessionEnd) -> Result<EscalationPhase, IllegalTransition> {
        let reason = end.to_string();
        self.advance(EscalationPhase::Acknowledged, Some(&reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    /// One-line history, e.g. `Idle → AlertActive (1200ms, 2 transitions)`.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} → {} ({}ms, {} transitions)",
            EscalationPhase::Idle,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
        );
        if !self.transitions.is_empty() {
            let phases: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
            out.push_str(&format!(" [{}]", phases.join(" → ")));
        }
        out
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}
