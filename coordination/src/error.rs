//! Coordination error types
//!
//! Errors here are recoverable by design of the escalation flow: a rejected
//! operator action leaves the state untouched, an invalid setting skips the
//! dependent task. Nothing in this crate is fatal to the host.

use thiserror::Error;

use crate::vehicle::{DoorPosition, VehiclePhase};

/// Result type alias for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// An operation was requested while the vehicle/door machine was in an
/// incompatible state. The machine is unchanged when this is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("engine is already running ({phase})")]
    EngineAlreadyOn { phase: VehiclePhase },

    #[error("engine is not running ({phase})")]
    EngineNotRunning { phase: VehiclePhase },

    #[error("cannot turn the engine off while the vehicle is {phase}")]
    VehicleInMotion { phase: VehiclePhase },

    #[error("vehicle must be stationary to start moving ({phase})")]
    NotReadyToMove { phase: VehiclePhase },

    #[error("vehicle is not moving ({phase})")]
    NotMoving { phase: VehiclePhase },

    #[error("vehicle has not fully stopped ({phase})")]
    NotFullyStopped { phase: VehiclePhase },

    #[error("door must be closed, it is {door}")]
    DoorNotClosed { door: DoorPosition },

    #[error("door is not open ({door})")]
    DoorNotOpen { door: DoorPosition },

    #[error("door is locked")]
    DoorLocked,

    #[error("detection is already armed")]
    AlreadyArmed,

    #[error("alarm was acknowledged; re-arm requires a fresh stop and door cycle")]
    AlarmAcknowledged,

    #[error("no escalation session is active")]
    NoActiveSession,

    #[error("shutdown in progress")]
    ShuttingDown,
}

/// Which escalation setting a [`ConfigError`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingField {
    AutoOpenAttempts,
    SosWaitMinutes,
    AuthorityWaitMinutes,
}

impl std::fmt::Display for SettingField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoOpenAttempts => write!(f, "auto_open_attempts"),
            Self::SosWaitMinutes => write!(f, "sos_wait_minutes"),
            Self::AuthorityWaitMinutes => write!(f, "authority_wait_minutes"),
        }
    }
}

/// An escalation setting failed validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field}: '{raw}' is not a number")]
    NotANumber { field: SettingField, raw: String },

    #[error("{field}: {value} is not a positive whole number")]
    NotPositiveInteger { field: SettingField, value: f64 },

    #[error("{field}: {value} is not a positive finite number")]
    NotPositiveFinite { field: SettingField, value: f64 },

    #[error("{field}: {value} minutes is out of range")]
    OutOfRange { field: SettingField, value: f64 },
}

impl ConfigError {
    /// The setting this error is about.
    pub fn field(&self) -> SettingField {
        match self {
            Self::NotANumber { field, .. }
            | Self::NotPositiveInteger { field, .. }
            | Self::NotPositiveFinite { field, .. }
            | Self::OutOfRange { field, .. } => *field,
        }
    }
}

/// Umbrella error for the orchestrator handle.
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// The orchestrator loop has exited; no further commands are accepted.
    #[error("orchestrator is no longer running")]
    ChannelClosed,
}

impl CoordinationError {
    /// Whether the error is a rejected operator action rather than a dead
    /// orchestrator.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }
}
