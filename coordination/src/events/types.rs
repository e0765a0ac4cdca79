//! Event types emitted by the orchestrator
//!
//! Presentation layers subscribe to these instead of being driven by
//! callbacks; every variant carries its own timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::escalation::{EscalationPhase, SessionId};

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Operator controls whose enablement the core decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlId {
    Engine,
    Move,
    Stop,
    OpenDoor,
    CloseDoor,
    LockSwitch,
    AlarmOff,
    DetectionOptions,
}

impl ControlId {
    pub const ALL: [ControlId; 8] = [
        Self::Engine,
        Self::Move,
        Self::Stop,
        Self::OpenDoor,
        Self::CloseDoor,
        Self::LockSwitch,
        Self::AlarmOff,
        Self::DetectionOptions,
    ];
}

/// Everything the core reports outward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardEvent {
    /// Headline status text changed
    StatusChanged {
        text: String,
        timestamp: DateTime<Utc>,
    },

    /// Something worth recording in the session log
    Log {
        message: String,
        severity: Severity,
        timestamp: DateTime<Utc>,
    },

    /// A running countdown ticked
    CountdownTick {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Latest occupant count to display
    PersonCount {
        count: u32,
        timestamp: DateTime<Utc>,
    },

    /// A control should be enabled or disabled
    ControlEnablement {
        control: ControlId,
        enabled: bool,
        timestamp: DateTime<Utc>,
    },

    /// The escalation state machine moved
    PhaseChanged {
        session_id: SessionId,
        from: EscalationPhase,
        to: EscalationPhase,
        timestamp: DateTime<Utc>,
    },
}

impl GuardEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status_changed",
            Self::Log { .. } => "log",
            Self::CountdownTick { .. } => "countdown_tick",
            Self::PersonCount { .. } => "person_count",
            Self::ControlEnablement { .. } => "control_enablement",
            Self::PhaseChanged { .. } => "phase_changed",
        }
    }

    /// Get the timestamp of the event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::StatusChanged { timestamp, .. }
            | Self::Log { timestamp, .. }
            | Self::CountdownTick { timestamp, .. }
            | Self::PersonCount { timestamp, .. }
            | Self::ControlEnablement { timestamp, .. }
            | Self::PhaseChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Log message text, if this is a log event
    pub fn log_message(&self) -> Option<&str> {
        match self {
            Self::Log { message, .. } => Some(message),
            _ => None,
        }
    }
}
