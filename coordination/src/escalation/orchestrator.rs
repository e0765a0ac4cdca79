//! Escalation orchestrator
//!
//! A single loop owns the vehicle/door machine and the active session.
//! Operator commands and task results both arrive over channels and are
//! handled one at a time, so the machine is never mutated from two places:
//!
//! ```text
//!  OrchestratorHandle ──Command──▶ ┌──────────────┐ ──spawn──▶ session tasks
//!                                  │ orchestrator │                │
//!  detection feed ──▶ count cell   │     loop     │ ◀─TaskEvent────┘
//!                                  └──────────────┘
//!                                     │ watch: phase, vehicle snapshot
//!                                     ▼
//!                                 EventSink
//! ```
//!
//! Task results carry their session id; results from a session that has
//! already ended are dropped.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::phase::{EscalationPhase, SessionEnd};
use super::session::{EscalationSession, SessionId, SessionSummary};
use super::steps::{self, StepContext, TaskEvent};
use crate::config::{EscalationSettings, Timings};
use crate::detection::{DetectionCell, DetectionFeed, DetectionReporter};
use crate::error::{CoordinationError, CoordinationResult, PreconditionError, SettingField};
use crate::events::{ControlId, EventSink, Reporter};
use crate::notify::NotificationService;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::tasks::{SpawnOutcome, TaskKind, TaskRegistry, TaskSlot};
use crate::vehicle::{
    DoorPosition, LockState, SettleKind, SettleTicket, VehicleDoorState, VehicleDoorStateMachine,
    VehiclePhase,
};
use crate::worker::pause;

const COMMAND_CAPACITY: usize = 64;

/// Startup configuration.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub settings: EscalationSettings,
    pub timings: Timings,
}

/// Operator actions.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartEngine,
    StopEngine,
    BeginMove,
    BeginStop,
    OpenDoor,
    CloseDoor,
    ToggleLock,
    AlarmOff,
    /// Arm detection now instead of waiting for the post-close delay.
    ArmDetection,
    UpdateSetting { field: SettingField, text: String },
    ReplaceSettings(EscalationSettings),
    /// Shut everything down and stop the loop.
    Exit,
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<(), PreconditionError>>,
}

/// Cloneable front end to the orchestrator loop.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Request>,
    phase: watch::Receiver<EscalationPhase>,
    vehicle: watch::Receiver<VehicleDoorState>,
    session: watch::Receiver<Option<SessionSummary>>,
    registry: Arc<TaskRegistry>,
    coordinator: ShutdownCoordinator,
    detection: DetectionReporter,
}

impl OrchestratorHandle {
    /// Send a command and wait for it to be applied.
    pub async fn send(&self, command: Command) -> CoordinationResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Request { command, reply })
            .await
            .map_err(|_| CoordinationError::ChannelClosed)?;
        rx.await
            .map_err(|_| CoordinationError::ChannelClosed)?
            .map_err(CoordinationError::from)
    }

    pub async fn start_engine(&self) -> CoordinationResult<()> {
        self.send(Command::StartEngine).await
    }

    pub async fn stop_engine(&self) -> CoordinationResult<()> {
        self.send(Command::StopEngine).await
    }

    pub async fn begin_move(&self) -> CoordinationResult<()> {
        self.send(Command::BeginMove).await
    }

    pub async fn begin_stop(&self) -> CoordinationResult<()> {
        self.send(Command::BeginStop).await
    }

    pub async fn open_door(&self) -> CoordinationResult<()> {
        self.send(Command::OpenDoor).await
    }

    pub async fn close_door(&self) -> CoordinationResult<()> {
        self.send(Command::CloseDoor).await
    }

    pub async fn toggle_lock(&self) -> CoordinationResult<()> {
        self.send(Command::ToggleLock).await
    }

    pub async fn alarm_off(&self) -> CoordinationResult<()> {
        self.send(Command::AlarmOff).await
    }

    pub async fn arm_detection(&self) -> CoordinationResult<()> {
        self.send(Command::ArmDetection).await
    }

    pub async fn update_setting(&self, field: SettingField, text: &str) -> CoordinationResult<()> {
        self.send(Command::UpdateSetting {
            field,
            text: text.to_string(),
        })
        .await
    }

    pub async fn exit(&self) -> CoordinationResult<()> {
        self.send(Command::Exit).await
    }

    /// Cancel and join every task directly, without going through the loop.
    /// Safe to call from a signal handler while the loop is busy.
    pub async fn request_shutdown(&self) -> ShutdownReport {
        self.coordinator.request_shutdown().await
    }

    pub fn phase(&self) -> EscalationPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<EscalationPhase> {
        self.phase.clone()
    }

    pub fn vehicle(&self) -> VehicleDoorState {
        *self.vehicle.borrow()
    }

    pub fn subscribe_vehicle(&self) -> watch::Receiver<VehicleDoorState> {
        self.vehicle.clone()
    }

    pub fn session(&self) -> Option<SessionSummary> {
        *self.session.borrow()
    }

    /// Session task kinds currently running.
    pub fn active_tasks(&self) -> Vec<TaskKind> {
        self.registry.active_kinds()
    }

    /// Total spawns of `kind` since the orchestrator started.
    pub fn spawn_count(&self, kind: TaskKind) -> u32 {
        self.registry.spawn_count(TaskSlot::Session(kind))
    }

    /// Write side of the occupant-count cell, for hosts that feed counts
    /// directly.
    pub fn detection(&self) -> &DetectionReporter {
        &self.detection
    }

    pub fn latest_count(&self) -> u32 {
        self.detection.cell().latest()
    }

    /// Task handles the orchestrator still has to join, live or retired.
    pub fn tracked_tasks(&self) -> usize {
        self.registry.len()
    }
}

/// The loop state. Built and consumed by [`Orchestrator::spawn`].
pub struct Orchestrator {
    vm: VehicleDoorStateMachine,
    settings: EscalationSettings,
    timings: Timings,
    session: Option<EscalationSession>,
    last_session_id: SessionId,
    reporter: Reporter,
    notifier: Arc<dyn NotificationService>,
    feed: Arc<dyn DetectionFeed>,
    detection: Arc<DetectionCell>,
    detection_reporter: DetectionReporter,
    registry: Arc<TaskRegistry>,
    coordinator: ShutdownCoordinator,
    vehicle_tx: watch::Sender<VehicleDoorState>,
    vehicle_rx: watch::Receiver<VehicleDoorState>,
    phase_tx: watch::Sender<EscalationPhase>,
    session_tx: watch::Sender<Option<SessionSummary>>,
    events_tx: mpsc::UnboundedSender<TaskEvent>,
    events_rx: mpsc::UnboundedReceiver<TaskEvent>,
    commands_rx: mpsc::Receiver<Request>,
    controls: HashMap<ControlId, bool>,
}

impl Orchestrator {
    /// Start the loop. It runs until [`Command::Exit`] or until every
    /// handle is dropped.
    pub fn spawn(
        config: OrchestratorConfig,
        notifier: Arc<dyn NotificationService>,
        feed: Arc<dyn DetectionFeed>,
        sink: Arc<dyn EventSink>,
    ) -> (OrchestratorHandle, JoinHandle<()>) {
        let (orchestrator, handle) = Self::new(config, notifier, feed, sink);
        let join = tokio::spawn(orchestrator.run());
        (handle, join)
    }

    fn new(
        config: OrchestratorConfig,
        notifier: Arc<dyn NotificationService>,
        feed: Arc<dyn DetectionFeed>,
        sink: Arc<dyn EventSink>,
    ) -> (Self, OrchestratorHandle) {
        let reporter = Reporter::new(sink);
        let registry = Arc::new(TaskRegistry::new());
        let coordinator = ShutdownCoordinator::new(registry.clone());
        let detection = Arc::new(DetectionCell::new());
        let detection_reporter = DetectionReporter::new(detection.clone(), reporter.clone());

        let vm = VehicleDoorStateMachine::new();
        let (vehicle_tx, vehicle_rx) = watch::channel(vm.snapshot());
        let (phase_tx, phase_rx) = watch::channel(EscalationPhase::Idle);
        let (session_tx, session_rx) = watch::channel(None);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);

        let handle = OrchestratorHandle {
            commands: commands_tx,
            phase: phase_rx,
            vehicle: vehicle_rx.clone(),
            session: session_rx,
            registry: registry.clone(),
            coordinator: coordinator.clone(),
            detection: detection_reporter.clone(),
        };

        let orchestrator = Self {
            vm,
            settings: config.settings,
            timings: config.timings,
            session: None,
            last_session_id: 0,
            reporter,
            notifier,
            feed,
            detection,
            detection_reporter,
            registry,
            coordinator,
            vehicle_tx,
            vehicle_rx,
            phase_tx,
            session_tx,
            events_tx,
            events_rx,
            commands_rx,
            controls: HashMap::new(),
        };
        (orchestrator, handle)
    }

    async fn run(mut self) {
        info!("Orchestrator started");
        self.reporter.status("System off");
        self.refresh_controls();

        loop {
            tokio::select! {
                biased;
                Some(event) = self.events_rx.recv() => {
                    self.on_task_event(event).await;
                }
                request = self.commands_rx.recv() => {
                    let Some(Request { command, reply }) = request else {
                        debug!("All handles dropped; exiting");
                        self.exit().await;
                        break;
                    };
                    let exiting = command == Command::Exit;
                    let result = self.on_command(command).await;
                    if let Err(e) = &result {
                        self.reject(e);
                    }
                    // The caller may have stopped waiting
                    let _ = reply.send(result);
                    if exiting {
                        break;
                    }
                }
            }
        }
        info!("Orchestrator stopped");
    }

    // ── Commands ────────────────────────────────────────────────────────

    async fn on_command(&mut self, command: Command) -> Result<(), PreconditionError> {
        debug!(?command, "Command received");
        let result = match command {
            Command::StartEngine => self.start_engine(),
            Command::StopEngine => self.stop_engine().await,
            Command::BeginMove => self.begin_move().await,
            Command::BeginStop => self.begin_stop(),
            Command::OpenDoor => self.open_door(),
            Command::CloseDoor => self.close_door(),
            Command::ToggleLock => self.toggle_lock(),
            Command::AlarmOff => self.alarm_off().await,
            Command::ArmDetection => self.arm(),
            Command::UpdateSetting { field, text } => {
                self.settings.set_from_text(field, &text);
                self.report_setting(field, &text);
                Ok(())
            }
            Command::ReplaceSettings(settings) => {
                self.settings = settings;
                if let Err(e) = self.settings.validate() {
                    self.reporter
                        .warn(&format!("Setting will be rejected when used: {e}"));
                }
                Ok(())
            }
            Command::Exit => {
                self.exit().await;
                Ok(())
            }
        };
        self.refresh_controls();
        result
    }

    fn reject(&self, err: &PreconditionError) {
        self.reporter.status(&format!("Not allowed: {err}"));
        self.reporter.warn(&format!("Action rejected: {err}"));
    }

    fn report_setting(&self, field: SettingField, text: &str) {
        let check = match field {
            SettingField::AutoOpenAttempts => self.settings.auto_open_attempts().map(|_| ()),
            SettingField::SosWaitMinutes => self.settings.sos_wait().map(|_| ()),
            SettingField::AuthorityWaitMinutes => self.settings.authority_wait().map(|_| ()),
        };
        match check {
            Ok(()) => self.reporter.info(&format!("Setting {field} = {}", text.trim())),
            Err(e) => self
                .reporter
                .warn(&format!("Setting will be rejected when used: {e}")),
        }
    }

    fn start_engine(&mut self) -> Result<(), PreconditionError> {
        self.coordinator.reset();
        if self.coordinator.is_shutting_down() {
            return Err(PreconditionError::ShuttingDown);
        }
        self.vm.start_engine()?;
        self.publish_vehicle();
        self.reporter.status("Starting system...");
        self.reporter.info("Starting engine and monitoring system...");

        let feed = self.feed.clone();
        let reporter = self.detection_reporter.clone();
        let events = self.events_tx.clone();
        self.registry
            .spawn_replacing(TaskSlot::DetectionFeed, move |token| async move {
                let ok = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    ok = feed.prepare() => ok,
                };
                if events.send(TaskEvent::EngineReady { ok }).is_err() || !ok {
                    return;
                }
                feed.stream(token, reporter).await;
            });
        Ok(())
    }

    async fn stop_engine(&mut self) -> Result<(), PreconditionError> {
        self.vm.can_stop_engine()?;
        self.reporter.status("Shutting down system...");
        self.reporter.info("Engine off. Ending session.");
        self.notify(|n| n.stop_all_sounds());

        self.end_session(SessionEnd::Shutdown).await;
        let report = self.coordinator.request_shutdown().await;
        self.log_report("engine stop", &report);

        self.vm.stop_engine()?;
        self.publish_vehicle();
        self.notify(|n| n.play_engine_off());
        self.reporter.status("System off");
        Ok(())
    }

    /// Application exit: same teardown as engine stop, in any vehicle state.
    async fn exit(&mut self) {
        self.reporter.status("Shutting down system...");
        self.notify(|n| n.stop_all_sounds());
        self.end_session(SessionEnd::Shutdown).await;
        let report = self.coordinator.request_shutdown().await;
        self.log_report("exit", &report);
        if self.vm.phase() != VehiclePhase::EngineOff {
            self.vm.power_off();
            self.publish_vehicle();
        }
    }

    async fn begin_move(&mut self) -> Result<(), PreconditionError> {
        self.vm.can_begin_move()?;
        if self.session.is_some() {
            self.end_session(SessionEnd::VehicleMoved).await;
        }
        self.vm.begin_move()?;
        self.publish_vehicle();
        self.reporter.status("Vehicle moving");
        self.reporter.info("Vehicle started moving.");
        Ok(())
    }

    fn begin_stop(&mut self) -> Result<(), PreconditionError> {
        let ticket = self.vm.begin_stop()?;
        self.publish_vehicle();
        self.reporter.status("Vehicle stopping");
        self.reporter.info("Vehicle stopping...");
        self.schedule_settle(ticket, self.timings.stop_settle);
        Ok(())
    }

    fn open_door(&mut self) -> Result<(), PreconditionError> {
        let ticket = self.vm.begin_open()?;
        self.publish_vehicle();
        self.reporter.status("Door opening");
        self.reporter.info("Door opening...");

        if self.current_phase() == Some(EscalationPhase::AutoOpenRetrying) {
            self.registry.cancel(TaskSlot::Session(TaskKind::AutoOpenRetry));
            self.transition(EscalationPhase::AlertActive, Some("operator opened the door"));
            self.reporter
                .info("Automatic door opening cancelled by operator.");
        }
        self.schedule_settle(ticket, self.timings.door_settle);
        Ok(())
    }

    fn close_door(&mut self) -> Result<(), PreconditionError> {
        let ticket = self.vm.begin_close()?;
        self.publish_vehicle();
        self.reporter.status("Door closing");
        self.reporter.info("Door closing...");
        self.schedule_settle(ticket, self.timings.door_settle);
        Ok(())
    }

    fn toggle_lock(&mut self) -> Result<(), PreconditionError> {
        let lock = self.vm.toggle_lock()?;
        self.publish_vehicle();
        match lock {
            LockState::Locked => self.reporter.info("Door locked."),
            LockState::Unlocked => self.reporter.info("Door unlocked."),
        }
        Ok(())
    }

    async fn alarm_off(&mut self) -> Result<(), PreconditionError> {
        if self.session.is_none() {
            return Err(PreconditionError::NoActiveSession);
        }
        self.reporter.info("Driver pressed the alarm-off button.");
        self.end_session(SessionEnd::AlarmOff).await;
        self.reporter
            .info("Detection ended. Driver confirmed the vehicle is empty.");
        self.reporter
            .status("Alarm off. Vehicle checked empty. Engine can be turned off.");
        Ok(())
    }

    /// Arm detection and open a session. Arming twice is a no-op.
    fn arm(&mut self) -> Result<(), PreconditionError> {
        match self.vm.arm_detection() {
            Ok(()) => {}
            Err(PreconditionError::AlreadyArmed) => {
                debug!("Arm ignored; detection already armed");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.publish_vehicle();

        self.last_session_id += 1;
        let id = self.last_session_id;
        self.session = Some(EscalationSession::new(id, self.settings.clone()));
        self.registry.begin_session();
        info!(session = id, "Escalation session opened");

        self.reporter.status("Starting detection...");
        self.reporter.info("Starting occupant detection cycle.");
        if self.transition(EscalationPhase::CountdownToAlert, None) {
            self.spawn_step(TaskKind::CountdownToAlert, steps::countdown_to_alert);
        }
        Ok(())
    }

    // ── Task results ────────────────────────────────────────────────────

    async fn on_task_event(&mut self, event: TaskEvent) {
        debug!(?event, "Task event");
        match event {
            TaskEvent::EngineReady { ok } => self.on_engine_ready(ok),
            TaskEvent::Settled(ticket) => self.on_settled(ticket),
            TaskEvent::ArmDue => {
                if let Err(e) = self.arm() {
                    debug!(%e, "Scheduled arm skipped");
                }
            }
            TaskEvent::CountdownElapsed { session } if self.is_current(session) => {
                self.on_countdown_elapsed();
            }
            TaskEvent::AutoOpenReady {
                session,
                attempt,
                opened,
            } if self.is_current(session) => {
                self.on_auto_open_ready(attempt, opened);
            }
            TaskEvent::AutoOpenExhausted { session } if self.is_current(session) => {
                if self.current_phase() == Some(EscalationPhase::AutoOpenRetrying)
                    && self.transition(EscalationPhase::AllRetriesExhausted, None)
                {
                    self.start_sos_wait();
                }
            }
            TaskEvent::SosFinished { session, delivered } if self.is_current(session) => {
                self.on_sos_finished(delivered).await;
            }
            TaskEvent::AuthorityNotified { session } if self.is_current(session) => {
                self.transition(EscalationPhase::AuthorityNotified, None);
            }
            stale => debug!(?stale, "Dropping result from an ended session"),
        }
        self.refresh_controls();
    }

    fn on_engine_ready(&mut self, ok: bool) {
        if !self.vm.engine_ready(ok) {
            return;
        }
        self.publish_vehicle();
        if ok {
            self.reporter
                .status("Vehicle started; monitoring system ready");
            self.reporter.info("System started.");
            self.notify(|n| n.play_engine_start());
            self.notify(|n| n.play_engine_idle());
        } else {
            self.reporter
                .error("Could not start the camera or the detection model.");
            self.reporter.status("Error: could not start the system.");
        }
    }

    fn on_settled(&mut self, ticket: SettleTicket) {
        match ticket.kind {
            SettleKind::VehicleStop => {
                if self.vm.finish_stop(ticket) {
                    self.reporter.status("Vehicle stopped");
                    self.reporter.info("Vehicle fully stopped.");
                }
            }
            SettleKind::DoorOpen => {
                if self.vm.finish_open(ticket) {
                    self.reporter.status("Door open");
                    self.reporter.info("Door open.");
                }
            }
            SettleKind::DoorClose => {
                if self.vm.finish_close(ticket) {
                    self.reporter.status("Door closed");
                    self.reporter.info("Door closed.");
                    if self.vm.should_arm_after_close() {
                        self.schedule_arm();
                    }
                }
            }
        }
        self.publish_vehicle();
    }

    fn on_countdown_elapsed(&mut self) {
        let count = self.detection.latest();
        let door_closed = self.vm.door() == DoorPosition::Closed;
        if let Some(session) = self.session.as_mut() {
            session.record_count(count);
        }
        if !self.transition(EscalationPhase::AlertActive, None) {
            return;
        }

        self.detection.set_display(true);
        self.reporter.person_count(count);
        if !door_closed {
            self.reporter
                .warn("The door was opened before the alert sounded.");
        }

        if count >= 1 {
            self.reporter.warn(&format!(
                "Detected {count} occupant(s) remaining in the vehicle. Alarm on."
            ));
            self.spawn_step(TaskKind::AlertLoop, steps::alert_loop);
            if door_closed {
                self.start_auto_open();
            } else {
                self.reporter
                    .info("Automatic opening skipped: the door is not closed.");
            }
        } else {
            self.reporter
                .info("No occupant detected. Asking the driver to recheck the vehicle.");
            self.spawn_step(TaskKind::AlertLoop, steps::alert_loop);
        }
    }

    fn start_auto_open(&mut self) {
        let attempts = match self.session_settings().map(|s| s.auto_open_attempts()) {
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                self.reporter
                    .error(&format!("Invalid automatic open attempt count: {e}"));
                if self.transition(
                    EscalationPhase::AllRetriesExhausted,
                    Some("invalid attempt count"),
                ) {
                    self.start_sos_wait();
                }
                return;
            }
            None => return,
        };
        if self.transition(EscalationPhase::AutoOpenRetrying, None) {
            self.spawn_step(TaskKind::AutoOpenRetry, move |ctx, token| {
                steps::auto_open_retry(ctx, attempts, token)
            });
        }
    }

    /// Answers the retry task on `opened`. Dropping it without an answer
    /// ends the sequence.
    fn on_auto_open_ready(&mut self, attempt: u32, opened: oneshot::Sender<bool>) {
        if self.current_phase() != Some(EscalationPhase::AutoOpenRetrying) {
            debug!(attempt, "Automatic open result arrived after the sequence ended");
            return;
        }
        match self.vm.begin_open() {
            Ok(ticket) => {
                // The retry task may already be cancelled
                let _ = opened.send(true);
                self.publish_vehicle();
                self.reporter.info(&format!(
                    "Automatic open attempt {attempt} succeeded. Door opening."
                ));
                self.reporter.status("Door opened automatically");
                let reason = format!("attempt {attempt}");
                self.transition(EscalationPhase::DoorOpenedAutomatically, Some(&reason));
                self.schedule_settle(ticket, self.timings.door_settle);
            }
            Err(PreconditionError::DoorLocked) => {
                // Locked after the task read the snapshot; the task counts
                // this as a failed attempt and moves on
                debug!(attempt, "Door locked again before the automatic open");
                let _ = opened.send(false);
            }
            Err(e) => {
                self.reporter.warn(&format!(
                    "Automatic open attempt {attempt} could not open the door: {e}"
                ));
                if self.vm.door() == DoorPosition::Closed {
                    if self.transition(EscalationPhase::AllRetriesExhausted, Some(&e.to_string())) {
                        self.start_sos_wait();
                    }
                } else {
                    self.transition(EscalationPhase::AlertActive, Some("door already moving"));
                }
            }
        }
    }

    fn start_sos_wait(&mut self) {
        let wait = match self.session_settings().map(|s| s.sos_wait()) {
            Some(Ok(wait)) => wait,
            Some(Err(e)) => {
                self.reporter.error(&format!("Invalid SOS wait time: {e}"));
                return;
            }
            None => return,
        };
        if self.transition(EscalationPhase::SosWaiting, None) {
            self.spawn_step(TaskKind::SosWait, move |ctx, token| {
                steps::sos_wait(ctx, wait, token)
            });
        }
    }

    async fn on_sos_finished(&mut self, delivered: bool) {
        let reason = if delivered { "delivered" } else { "delivery failed" };
        if !self.transition(EscalationPhase::SosSent, Some(reason)) {
            return;
        }

        let report = self.coordinator.join(&[TaskKind::AlertLoop]).await;
        self.log_report("alert loop handover", &report);

        self.transition(EscalationPhase::AuthorityWaiting, None);
        match self.session_settings().map(|s| s.authority_wait()) {
            Some(Ok(wait)) => {
                self.spawn_step(TaskKind::AuthorityWait, move |ctx, token| {
                    steps::authority_wait(ctx, wait, token)
                });
            }
            Some(Err(e)) => {
                self.reporter
                    .error(&format!("Invalid authority wait time: {e}"));
            }
            None => return,
        }
        self.spawn_step(
            TaskKind::SafetyInstructionLoop,
            steps::safety_instruction_loop,
        );
        self.reporter.status("SOS sent. Playing safety instructions.");
    }

    // ── Session plumbing ────────────────────────────────────────────────

    fn is_current(&self, session: SessionId) -> bool {
        self.session.as_ref().is_some_and(|s| s.id() == session)
    }

    fn current_phase(&self) -> Option<EscalationPhase> {
        self.session.as_ref().map(EscalationSession::phase)
    }

    fn session_settings(&self) -> Option<&EscalationSettings> {
        self.session.as_ref().map(EscalationSession::settings)
    }

    /// Advance the active session and publish the change.
    fn transition(&mut self, to: EscalationPhase, reason: Option<&str>) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        match session.advance(to, reason) {
            Ok(from) => {
                info!(session = session.id(), from = %from, to = %to, "Escalation phase changed");
                self.reporter.phase_changed(session.id(), from, to);
                self.phase_tx.send_replace(to);
                self.session_tx.send_replace(Some(session.summary()));
                true
            }
            Err(e) => {
                warn!(session = session.id(), %e, "Escalation transition rejected");
                false
            }
        }
    }

    /// Cancel and join the session's tasks and mark the alarm acknowledged.
    async fn end_session(&mut self, end: SessionEnd) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.detection.set_display(false);

        let report = self.coordinator.end_session().await;
        self.log_report("session end", &report);
        self.notify(|n| n.stop_alert_sounds());

        self.vm.acknowledge_alarm();
        self.publish_vehicle();

        match session.acknowledge(end) {
            Ok(from) => {
                self.reporter
                    .phase_changed(session.id(), from, EscalationPhase::Acknowledged);
                self.phase_tx.send_replace(EscalationPhase::Acknowledged);
                self.session_tx.send_replace(Some(session.summary()));
            }
            Err(e) => warn!(session = session.id(), %e, "Session end not recorded"),
        }
        info!(
            session = session.id(),
            reason = %end,
            history = %session.phases().summary(),
            "Escalation session closed"
        );
    }

    fn step_context(&self) -> Option<StepContext> {
        let session = self.session.as_ref()?;
        Some(StepContext {
            session: session.id(),
            reporter: self.reporter.clone(),
            notifier: self.notifier.clone(),
            detection: self.detection.clone(),
            vehicle: self.vehicle_rx.clone(),
            timings: self.timings.clone(),
            events: self.events_tx.clone(),
        })
    }

    fn spawn_step<F, Fut>(&self, kind: TaskKind, body: F) -> SpawnOutcome
    where
        F: FnOnce(StepContext, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(ctx) = self.step_context() else {
            return SpawnOutcome::NoSession;
        };
        let session = ctx.session;
        let outcome = self
            .registry
            .spawn_session(kind, move |token| body(ctx, token));
        match outcome {
            SpawnOutcome::Spawned => info!(session, %kind, "Task started"),
            SpawnOutcome::AlreadyActive => {}
            other => debug!(session, %kind, ?other, "Task not started"),
        }
        outcome
    }

    fn schedule_settle(&self, ticket: SettleTicket, delay: Duration) {
        let events = self.events_tx.clone();
        self.registry
            .spawn_replacing(TaskSlot::Settle(ticket.kind), move |token| async move {
                if pause(&token, delay).await {
                    let _ = events.send(TaskEvent::Settled(ticket));
                }
            });
    }

    fn schedule_arm(&self) {
        let events = self.events_tx.clone();
        let delay = self.timings.arm_delay;
        self.registry
            .spawn_replacing(TaskSlot::ArmDelay, move |token| async move {
                if pause(&token, delay).await {
                    let _ = events.send(TaskEvent::ArmDue);
                }
            });
    }

    // ── Outbound ────────────────────────────────────────────────────────

    fn publish_vehicle(&self) {
        self.vehicle_tx.send_replace(self.vm.snapshot());
    }

    /// Call a synchronous notifier method, containing any panic.
    fn notify<F>(&self, call: F)
    where
        F: FnOnce(&dyn NotificationService),
    {
        let notifier = self.notifier.as_ref();
        if catch_unwind(AssertUnwindSafe(|| call(notifier))).is_err() {
            error!("Notification service panicked");
            self.reporter
                .error("Sound playback failed; continuing without it.");
        }
    }

    fn log_report(&self, context: &str, report: &ShutdownReport) {
        let panicked = report.panicked();
        if panicked > 0 {
            self.reporter.error(&format!(
                "{panicked} background task(s) failed during {context}."
            ));
        }
        debug!(context, joined = report.joined.len(), panicked, "Tasks joined");
    }

    /// Emit enablement intents that changed since the last call.
    fn refresh_controls(&mut self) {
        let phase = self.vm.phase();
        let door = self.vm.door();
        let stopped = phase == VehiclePhase::StoppedFully;
        let session_phase = self.current_phase();

        let intents = [
            (
                ControlId::Engine,
                matches!(
                    phase,
                    VehiclePhase::EngineOff | VehiclePhase::Idle | VehiclePhase::StoppedFully
                ),
            ),
            (
                ControlId::Move,
                matches!(phase, VehiclePhase::Idle | VehiclePhase::StoppedFully)
                    && door == DoorPosition::Closed,
            ),
            (ControlId::Stop, phase == VehiclePhase::Moving),
            (
                ControlId::OpenDoor,
                stopped && door == DoorPosition::Closed && self.vm.lock() == LockState::Unlocked,
            ),
            (
                ControlId::CloseDoor,
                matches!(door, DoorPosition::Open | DoorPosition::Opening),
            ),
            (ControlId::LockSwitch, stopped && door == DoorPosition::Closed),
            (
                ControlId::AlarmOff,
                session_phase.is_some_and(|p| {
                    door == DoorPosition::Open || p == EscalationPhase::DoorOpenedAutomatically
                }),
            ),
            (ControlId::DetectionOptions, session_phase.is_some()),
        ];

        for (control, enabled) in intents {
            if self.controls.insert(control, enabled) != Some(enabled) {
                self.reporter.control(control, enabled);
            }
        }
    }
}
