//! Vehicle / door state machine — explicit states and legal transition guards.
//!
//! Three orthogonal sub-states are tracked:
//!
//! ```text
//! motion: EngineOff → EngineStarting → Idle → Moving → Stopping → StoppedFully
//!                                        ▲                              │
//!                                        └──────── begin_move ──────────┘
//! door:   Closed → Opening → Open → Closing → Closed
//! lock:   Unlocked ↔ Locked            (only while the door is Closed)
//! ```
//!
//! Physical transitions (`begin_stop`, `begin_open`, `begin_close`) return a
//! [`SettleTicket`]. The caller waits the settle delay and hands the ticket
//! back to the matching `finish_*` method; a ticket superseded by a later
//! operation is ignored, so a late completion can never overwrite a newer
//! state.
//!
//! Rejections return [`PreconditionError`] and leave the machine untouched.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::PreconditionError;

/// Engine / motion phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehiclePhase {
    EngineOff,
    /// Waiting for the detection feed to come up.
    EngineStarting,
    /// Engine running, vehicle parked, never moved this run.
    Idle,
    Moving,
    /// Braking; completes after the stop settle delay.
    Stopping,
    StoppedFully,
}

impl VehiclePhase {
    pub fn engine_on(self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Moving | Self::Stopping | Self::StoppedFully
        )
    }
}

impl fmt::Display for VehiclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EngineOff => write!(f, "engine_off"),
            Self::EngineStarting => write!(f, "engine_starting"),
            Self::Idle => write!(f, "idle"),
            Self::Moving => write!(f, "moving"),
            Self::Stopping => write!(f, "stopping"),
            Self::StoppedFully => write!(f, "stopped_fully"),
        }
    }
}

/// Door sub-state. `Opening`/`Closing` are the in-motion window where the
/// door is neither open nor fully closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorPosition {
    Closed,
    Opening,
    Open,
    Closing,
}

impl fmt::Display for DoorPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Opening => write!(f, "opening"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    Locked,
}

/// Flat boolean view of the machine, published to tasks as one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VehicleDoorState {
    pub engine_on: bool,
    pub vehicle_moving: bool,
    pub vehicle_fully_stopped: bool,
    pub door_open: bool,
    pub door_fully_closed: bool,
    pub door_locked: bool,
    pub detection_armed: bool,
    pub alarm_acknowledged: bool,
}

/// Which physical transition a ticket completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleKind {
    VehicleStop,
    DoorOpen,
    DoorClose,
}

impl fmt::Display for SettleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VehicleStop => write!(f, "vehicle_stop"),
            Self::DoorOpen => write!(f, "door_open"),
            Self::DoorClose => write!(f, "door_close"),
        }
    }
}

/// Proof that a physical transition was started; redeemed by `finish_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleTicket {
    pub kind: SettleKind,
    pub generation: u64,
}

/// Operations recorded in the transition log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleOperation {
    StartEngine,
    EngineReady,
    EngineFailed,
    StopEngine,
    BeginMove,
    BeginStop,
    FinishStop,
    BeginOpen,
    FinishOpen,
    BeginClose,
    FinishClose,
    ToggleLock,
    ArmDetection,
    AcknowledgeAlarm,
}

/// A single recorded transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub operation: VehicleOperation,
    /// State after the operation.
    pub state: VehicleDoorState,
    /// Milliseconds since the machine was created.
    pub elapsed_ms: u64,
}

/// The vehicle / door / lock / detection-arm state machine.
pub struct VehicleDoorStateMachine {
    phase: VehiclePhase,
    door: DoorPosition,
    lock: LockState,
    detection_armed: bool,
    alarm_acknowledged: bool,
    next_generation: u64,
    stop_ticket: Option<u64>,
    door_ticket: Option<u64>,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

/// Most transitions kept; older ones are dropped first.
pub const TRANSITION_HISTORY_LIMIT: usize = 512;

impl VehicleDoorStateMachine {
    /// Power-on state: engine off, door closed and unlocked.
    pub fn new() -> Self {
        Self {
            phase: VehiclePhase::EngineOff,
            door: DoorPosition::Closed,
            lock: LockState::Unlocked,
            detection_armed: false,
            alarm_acknowledged: false,
            next_generation: 0,
            stop_ticket: None,
            door_ticket: None,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn phase(&self) -> VehiclePhase {
        self.phase
    }

    pub fn door(&self) -> DoorPosition {
        self.door
    }

    pub fn lock(&self) -> LockState {
        self.lock
    }

    /// Transitions since the last power-off, oldest first, capped at
    /// [`TRANSITION_HISTORY_LIMIT`].
    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Boolean snapshot of the whole machine.
    pub fn snapshot(&self) -> VehicleDoorState {
        VehicleDoorState {
            engine_on: self.phase.engine_on(),
            vehicle_moving: self.phase == VehiclePhase::Moving,
            vehicle_fully_stopped: self.phase == VehiclePhase::StoppedFully,
            door_open: self.door == DoorPosition::Open,
            door_fully_closed: self.door == DoorPosition::Closed,
            door_locked: self.lock == LockState::Locked,
            detection_armed: self.detection_armed,
            alarm_acknowledged: self.alarm_acknowledged,
        }
    }

    /// Whether a completed door close should lead to arming detection.
    pub fn should_arm_after_close(&self) -> bool {
        self.door == DoorPosition::Closed && !self.alarm_acknowledged && !self.detection_armed
    }

    // ── Engine ──────────────────────────────────────────────────────────

    pub fn start_engine(&mut self) -> Result<(), PreconditionError> {
        if self.phase != VehiclePhase::EngineOff {
            return Err(PreconditionError::EngineAlreadyOn { phase: self.phase });
        }
        self.phase = VehiclePhase::EngineStarting;
        self.record(VehicleOperation::StartEngine);
        Ok(())
    }

    /// Complete engine start. Returns false if the engine was not starting.
    pub fn engine_ready(&mut self, ok: bool) -> bool {
        if self.phase != VehiclePhase::EngineStarting {
            return false;
        }
        if ok {
            self.phase = VehiclePhase::Idle;
            self.record(VehicleOperation::EngineReady);
        } else {
            self.phase = VehiclePhase::EngineOff;
            self.record(VehicleOperation::EngineFailed);
        }
        true
    }

    /// Check `stop_engine` without applying it.
    pub fn can_stop_engine(&self) -> Result<(), PreconditionError> {
        match self.phase {
            VehiclePhase::EngineOff | VehiclePhase::EngineStarting => {
                Err(PreconditionError::EngineNotRunning { phase: self.phase })
            }
            VehiclePhase::Moving | VehiclePhase::Stopping => {
                Err(PreconditionError::VehicleInMotion { phase: self.phase })
            }
            VehiclePhase::Idle | VehiclePhase::StoppedFully => Ok(()),
        }
    }

    /// Turn the engine off and reset everything to power-on defaults.
    pub fn stop_engine(&mut self) -> Result<(), PreconditionError> {
        self.can_stop_engine()?;
        self.power_off();
        Ok(())
    }

    /// Unconditional reset used when the application exits.
    pub fn power_off(&mut self) {
        self.phase = VehiclePhase::EngineOff;
        self.door = DoorPosition::Closed;
        self.lock = LockState::Unlocked;
        self.detection_armed = false;
        self.alarm_acknowledged = false;
        self.stop_ticket = None;
        self.door_ticket = None;
        self.transitions.clear();
        self.record(VehicleOperation::StopEngine);
    }

    // ── Motion ──────────────────────────────────────────────────────────

    /// Start driving. Clears any alarm acknowledgment: the next stop and
    /// door cycle may arm detection again.
    pub fn begin_move(&mut self) -> Result<(), PreconditionError> {
        self.can_begin_move()?;
        self.phase = VehiclePhase::Moving;
        self.detection_armed = false;
        self.alarm_acknowledged = false;
        self.record(VehicleOperation::BeginMove);
        Ok(())
    }

    /// Check `begin_move` without applying it.
    pub fn can_begin_move(&self) -> Result<(), PreconditionError> {
        match self.phase {
            VehiclePhase::Idle | VehiclePhase::StoppedFully => {}
            VehiclePhase::EngineOff | VehiclePhase::EngineStarting => {
                return Err(PreconditionError::EngineNotRunning { phase: self.phase })
            }
            VehiclePhase::Moving | VehiclePhase::Stopping => {
                return Err(PreconditionError::NotReadyToMove { phase: self.phase })
            }
        }
        if self.door != DoorPosition::Closed {
            return Err(PreconditionError::DoorNotClosed { door: self.door });
        }
        Ok(())
    }

    pub fn begin_stop(&mut self) -> Result<SettleTicket, PreconditionError> {
        if self.phase != VehiclePhase::Moving {
            return Err(PreconditionError::NotMoving { phase: self.phase });
        }
        self.phase = VehiclePhase::Stopping;
        let generation = self.bump();
        self.stop_ticket = Some(generation);
        self.record(VehicleOperation::BeginStop);
        Ok(SettleTicket {
            kind: SettleKind::VehicleStop,
            generation,
        })
    }

    /// Returns true if the ticket was current and the vehicle is now at rest.
    pub fn finish_stop(&mut self, ticket: SettleTicket) -> bool {
        if ticket.kind != SettleKind::VehicleStop
            || self.stop_ticket != Some(ticket.generation)
            || self.phase != VehiclePhase::Stopping
        {
            return false;
        }
        self.stop_ticket = None;
        self.phase = VehiclePhase::StoppedFully;
        self.record(VehicleOperation::FinishStop);
        true
    }

    // ── Door ────────────────────────────────────────────────────────────

    pub fn begin_open(&mut self) -> Result<SettleTicket, PreconditionError> {
        if self.phase != VehiclePhase::StoppedFully {
            return Err(PreconditionError::NotFullyStopped { phase: self.phase });
        }
        if self.door != DoorPosition::Closed {
            return Err(PreconditionError::DoorNotClosed { door: self.door });
        }
        if self.lock == LockState::Locked {
            return Err(PreconditionError::DoorLocked);
        }
        self.door = DoorPosition::Opening;
        let generation = self.bump();
        self.door_ticket = Some(generation);
        self.record(VehicleOperation::BeginOpen);
        Ok(SettleTicket {
            kind: SettleKind::DoorOpen,
            generation,
        })
    }

    pub fn finish_open(&mut self, ticket: SettleTicket) -> bool {
        if !self.door_ticket_current(ticket, SettleKind::DoorOpen, DoorPosition::Opening) {
            return false;
        }
        self.door_ticket = None;
        self.door = DoorPosition::Open;
        self.record(VehicleOperation::FinishOpen);
        true
    }

    /// Close the door; allowed while it is still opening.
    pub fn begin_close(&mut self) -> Result<SettleTicket, PreconditionError> {
        if !matches!(self.door, DoorPosition::Open | DoorPosition::Opening) {
            return Err(PreconditionError::DoorNotOpen { door: self.door });
        }
        self.door = DoorPosition::Closing;
        let generation = self.bump();
        self.door_ticket = Some(generation);
        self.record(VehicleOperation::BeginClose);
        Ok(SettleTicket {
            kind: SettleKind::DoorClose,
            generation,
        })
    }

    pub fn finish_close(&mut self, ticket: SettleTicket) -> bool {
        if !self.door_ticket_current(ticket, SettleKind::DoorClose, DoorPosition::Closing) {
            return false;
        }
        self.door_ticket = None;
        self.door = DoorPosition::Closed;
        self.record(VehicleOperation::FinishClose);
        true
    }

    pub fn toggle_lock(&mut self) -> Result<LockState, PreconditionError> {
        if self.door != DoorPosition::Closed {
            return Err(PreconditionError::DoorNotClosed { door: self.door });
        }
        if matches!(self.phase, VehiclePhase::Moving | VehiclePhase::Stopping) {
            return Err(PreconditionError::VehicleInMotion { phase: self.phase });
        }
        self.lock = match self.lock {
            LockState::Unlocked => LockState::Locked,
            LockState::Locked => LockState::Unlocked,
        };
        self.record(VehicleOperation::ToggleLock);
        Ok(self.lock)
    }

    // ── Detection arming ────────────────────────────────────────────────

    pub fn arm_detection(&mut self) -> Result<(), PreconditionError> {
        if self.phase != VehiclePhase::StoppedFully {
            return Err(PreconditionError::NotFullyStopped { phase: self.phase });
        }
        if self.door != DoorPosition::Closed {
            return Err(PreconditionError::DoorNotClosed { door: self.door });
        }
        if self.alarm_acknowledged {
            return Err(PreconditionError::AlarmAcknowledged);
        }
        if self.detection_armed {
            return Err(PreconditionError::AlreadyArmed);
        }
        self.detection_armed = true;
        self.record(VehicleOperation::ArmDetection);
        Ok(())
    }

    /// Operator confirmed the cabin is empty. Suppresses re-arming until the
    /// vehicle moves again.
    pub fn acknowledge_alarm(&mut self) {
        self.detection_armed = false;
        self.alarm_acknowledged = true;
        self.record(VehicleOperation::AcknowledgeAlarm);
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn door_ticket_current(
        &self,
        ticket: SettleTicket,
        kind: SettleKind,
        expected: DoorPosition,
    ) -> bool {
        ticket.kind == kind
            && self.door_ticket == Some(ticket.generation)
            && self.door == expected
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn record(&mut self, operation: VehicleOperation) {
        let state = self.snapshot();
        tracing::debug!(
            ?operation,
            phase = %self.phase,
            door = %self.door,
            locked = state.door_locked,
            armed = state.detection_armed,
            "Vehicle transition"
        );
        if self.transitions.len() >= TRANSITION_HISTORY_LIMIT {
            self.transitions.remove(0);
        }
        self.transitions.push(TransitionRecord {
            operation,
            state,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
        });
    }
}

impl Default for VehicleDoorStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Machine with engine running and vehicle fully stopped.
    fn stopped() -> VehicleDoorStateMachine {
        let mut vm = VehicleDoorStateMachine::new();
        vm.start_engine().unwrap();
        assert!(vm.engine_ready(true));
        vm.begin_move().unwrap();
        let ticket = vm.begin_stop().unwrap();
        assert!(vm.finish_stop(ticket));
        vm
    }

    fn open(vm: &mut VehicleDoorStateMachine) {
        let ticket = vm.begin_open().unwrap();
        assert!(vm.finish_open(ticket));
    }

    fn close(vm: &mut VehicleDoorStateMachine) {
        let ticket = vm.begin_close().unwrap();
        assert!(vm.finish_close(ticket));
    }

    #[test]
    fn test_initial_state() {
        let vm = VehicleDoorStateMachine::new();
        let s = vm.snapshot();
        assert!(!s.engine_on);
        assert!(s.door_fully_closed);
        assert!(!s.door_open);
        assert!(!s.door_locked);
        assert!(vm.transitions().is_empty());
    }

    #[test]
    fn test_engine_start_failure_returns_to_off() {
        let mut vm = VehicleDoorStateMachine::new();
        vm.start_engine().unwrap();
        assert!(!vm.snapshot().engine_on);
        assert!(vm.engine_ready(false));
        assert_eq!(vm.phase(), VehiclePhase::EngineOff);
        // Late readiness report is ignored
        assert!(!vm.engine_ready(true));
    }

    #[test]
    fn test_open_requires_full_stop() {
        let mut vm = VehicleDoorStateMachine::new();
        vm.start_engine().unwrap();
        vm.engine_ready(true);
        vm.begin_move().unwrap();
        vm.begin_stop().unwrap();

        let err = vm.begin_open().unwrap_err();
        assert_eq!(
            err,
            PreconditionError::NotFullyStopped {
                phase: VehiclePhase::Stopping
            }
        );
        assert_eq!(vm.door(), DoorPosition::Closed);
    }

    #[test]
    fn test_door_in_motion_is_neither_open_nor_closed() {
        let mut vm = stopped();
        let ticket = vm.begin_open().unwrap();
        let s = vm.snapshot();
        assert!(!s.door_open);
        assert!(!s.door_fully_closed);
        assert!(vm.finish_open(ticket));
        let s = vm.snapshot();
        assert!(s.door_open);
        assert!(!s.door_fully_closed);
    }

    #[test]
    fn test_stale_open_ticket_ignored_after_close() {
        let mut vm = stopped();
        let open_ticket = vm.begin_open().unwrap();
        let close_ticket = vm.begin_close().unwrap();

        assert!(!vm.finish_open(open_ticket));
        assert_eq!(vm.door(), DoorPosition::Closing);
        assert!(vm.finish_close(close_ticket));
        assert_eq!(vm.door(), DoorPosition::Closed);
    }

    #[test]
    fn test_lock_only_while_closed() {
        let mut vm = stopped();
        assert_eq!(vm.toggle_lock().unwrap(), LockState::Locked);
        assert_eq!(vm.begin_open().unwrap_err(), PreconditionError::DoorLocked);
        assert_eq!(vm.toggle_lock().unwrap(), LockState::Unlocked);

        open(&mut vm);
        assert_eq!(
            vm.toggle_lock().unwrap_err(),
            PreconditionError::DoorNotClosed {
                door: DoorPosition::Open
            }
        );
    }

    #[test]
    fn test_move_requires_closed_door_but_ignores_lock() {
        let mut vm = stopped();
        open(&mut vm);
        assert!(matches!(
            vm.begin_move(),
            Err(PreconditionError::DoorNotClosed { .. })
        ));

        close(&mut vm);
        vm.toggle_lock().unwrap();
        assert!(vm.begin_move().is_ok());
        assert!(vm.snapshot().vehicle_moving);
    }

    #[test]
    fn test_arm_guarded_by_acknowledgment() {
        let mut vm = stopped();
        open(&mut vm);
        close(&mut vm);
        assert!(vm.should_arm_after_close());
        vm.arm_detection().unwrap();
        assert_eq!(vm.arm_detection().unwrap_err(), PreconditionError::AlreadyArmed);

        vm.acknowledge_alarm();
        assert!(!vm.snapshot().detection_armed);

        open(&mut vm);
        close(&mut vm);
        assert!(!vm.should_arm_after_close());
        assert_eq!(
            vm.arm_detection().unwrap_err(),
            PreconditionError::AlarmAcknowledged
        );

        // A fresh move → stop → open → close cycle clears the guard
        vm.begin_move().unwrap();
        let t = vm.begin_stop().unwrap();
        vm.finish_stop(t);
        open(&mut vm);
        close(&mut vm);
        assert!(vm.should_arm_after_close());
    }

    #[test]
    fn test_stop_engine_resets_to_power_on_defaults() {
        let mut vm = stopped();
        vm.toggle_lock().unwrap();
        vm.arm_detection().unwrap();
        vm.stop_engine().unwrap();

        let s = vm.snapshot();
        assert_eq!(s, VehicleDoorState {
            door_fully_closed: true,
            ..VehicleDoorState::default()
        });
    }

    #[test]
    fn test_stop_engine_rejected_in_motion() {
        let mut vm = VehicleDoorStateMachine::new();
        vm.start_engine().unwrap();
        vm.engine_ready(true);
        vm.begin_move().unwrap();
        assert!(matches!(
            vm.stop_engine(),
            Err(PreconditionError::VehicleInMotion { .. })
        ));
    }

    #[test]
    fn test_transition_log() {
        let vm = stopped();
        let ops: Vec<_> = vm.transitions().iter().map(|t| t.operation).collect();
        assert_eq!(
            ops,
            vec![
                VehicleOperation::StartEngine,
                VehicleOperation::EngineReady,
                VehicleOperation::BeginMove,
                VehicleOperation::BeginStop,
                VehicleOperation::FinishStop,
            ]
        );
        assert!(vm.transitions()[4].state.vehicle_fully_stopped);
    }

    #[test]
    fn test_transition_log_is_bounded_and_reset_by_power_off() {
        let mut vm = VehicleDoorStateMachine::new();
        for _ in 0..TRANSITION_HISTORY_LIMIT {
            vm.toggle_lock().unwrap();
        }
        vm.start_engine().unwrap();
        assert_eq!(vm.transitions().len(), TRANSITION_HISTORY_LIMIT);
        assert_eq!(
            vm.transitions().last().map(|t| t.operation),
            Some(VehicleOperation::StartEngine)
        );

        vm.power_off();
        let ops: Vec<_> = vm.transitions().iter().map(|t| t.operation).collect();
        assert_eq!(ops, vec![VehicleOperation::StopEngine]);
    }
}
