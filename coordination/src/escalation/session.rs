//! One escalation session, from arming to acknowledgment.

use serde::Serialize;

use super::phase::{EscalationPhase, IllegalTransition, PhaseMachine, SessionEnd};
use crate::config::EscalationSettings;

/// Monotonic session identifier. Task results carry it so that results
/// from an ended session are recognised and dropped.
pub type SessionId = u64;

/// State owned by the orchestrator for the active session.
pub struct EscalationSession {
    id: SessionId,
    /// Occupant count read when the pre-alert countdown elapsed.
    detected_count: Option<u32>,
    /// Settings snapshot taken when the session opened.
    settings: EscalationSettings,
    phases: PhaseMachine,
}

impl EscalationSession {
    pub fn new(id: SessionId, settings: EscalationSettings) -> Self {
        Self {
            id,
            detected_count: None,
            settings,
            phases: PhaseMachine::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn detected_count(&self) -> Option<u32> {
        self.detected_count
    }

    pub fn record_count(&mut self, count: u32) {
        self.detected_count = Some(count);
    }

    pub fn settings(&self) -> &EscalationSettings {
        &self.settings
    }

    pub fn phase(&self) -> EscalationPhase {
        self.phases.current()
    }

    pub fn phases(&self) -> &PhaseMachine {
        &self.phases
    }

    pub fn advance(
        &mut self,
        to: EscalationPhase,
        reason: Option<&str>,
    ) -> Result<EscalationPhase, IllegalTransition> {
        self.phases.advance(to, reason)
    }

    pub fn acknowledge(&mut self, end: SessionEnd) -> Result<EscalationPhase, IllegalTransition> {
        self.phases.acknowledge(end)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            detected_count: self.detected_count,
            phase: self.phase(),
            transitions: self.phases.transitions().len(),
        }
    }
}

/// Serializable view of a session, for status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub detected_count: Option<u32>,
    pub phase: EscalationPhase,
    pub transitions: usize,
}
