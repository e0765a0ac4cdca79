//! Integration tests for the escalation orchestrator
//!
//! Drives the full loop (vehicle machine, session tasks, shutdown) on
//! paused tokio time with recording collaborators, so every countdown runs
//! instantly and elapsed-time assertions are exact to the tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use cabin_coordination::{
    AlertKind, ControlId, CoordinationError, DetectionFeed, DetectionReporter, EscalationPhase,
    EscalationSettings, EventSink, GuardEvent, NotificationService, Orchestrator,
    OrchestratorConfig, OrchestratorHandle, PreconditionError, SettingField, Severity, TaskKind,
    VehicleDoorState,
};

// ── Recording collaborators ─────────────────────────────────────────────

#[derive(Default)]
struct MockNotifier {
    calls: Mutex<Vec<String>>,
    sos_delivered: bool,
    panic_on_alert: AtomicBool,
}

impl MockNotifier {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sos_delivered: true,
            ..Self::default()
        })
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }
}

#[async_trait]
impl NotificationService for MockNotifier {
    fn play_alert(&self, kind: AlertKind) {
        if self.panic_on_alert.load(Ordering::SeqCst) {
            panic!("speaker unavailable");
        }
        self.record(&format!("alert:{kind}"));
    }

    fn stop_alert_sounds(&self) {
        self.record("stop_alerts");
    }

    fn play_safety_instructions(&self) {
        self.record("safety");
    }

    fn safety_instructions_duration(&self) -> Duration {
        Duration::from_secs(8)
    }

    async fn send_sos(&self) -> bool {
        self.record("sos");
        self.sos_delivered
    }

    async fn notify_authority(&self) {
        self.record("authority");
    }

    fn is_alert_playing(&self) -> bool {
        false
    }
}

/// Feed that comes up (or not) and then idles; tests push counts through
/// the handle.
struct IdleFeed {
    ok: bool,
}

#[async_trait]
impl DetectionFeed for IdleFeed {
    async fn prepare(&self) -> bool {
        self.ok
    }

    async fn stream(&self, token: CancellationToken, _reporter: DetectionReporter) {
        token.cancelled().await;
    }
}

#[derive(Default)]
struct RecordingSink {
    logs: Mutex<Vec<(String, Severity)>>,
    ticks: Mutex<Vec<String>>,
    counts: Mutex<Vec<u32>>,
    controls: Mutex<Vec<(ControlId, bool)>>,
    phases: Mutex<Vec<EscalationPhase>>,
}

impl RecordingSink {
    fn has_log(&self, needle: &str, severity: Severity) -> bool {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .any(|(m, s)| *s == severity && m.contains(needle))
    }

    fn log_count(&self, needle: &str) -> usize {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m.contains(needle))
            .count()
    }

    fn tick_count(&self) -> usize {
        self.ticks.lock().unwrap().len()
    }

    fn control(&self, control: ControlId) -> Option<bool> {
        self.controls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(c, _)| *c == control)
            .map(|(_, enabled)| *enabled)
    }
}

impl EventSink for RecordingSink {
    fn on_status_change(&self, _text: &str) {}

    fn on_log_event(&self, message: &str, severity: Severity) {
        self.logs.lock().unwrap().push((message.to_string(), severity));
    }

    fn on_countdown_tick(&self, message: &str) {
        self.ticks.lock().unwrap().push(message.to_string());
    }

    fn on_person_count(&self, count: u32) {
        self.counts.lock().unwrap().push(count);
    }

    fn on_control_enablement(&self, control: ControlId, enabled: bool) {
        self.controls.lock().unwrap().push((control, enabled));
    }

    fn on_event(&self, event: &GuardEvent) {
        if let GuardEvent::PhaseChanged { to, .. } = event {
            self.phases.lock().unwrap().push(*to);
        }
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    handle: OrchestratorHandle,
    join: JoinHandle<()>,
    notifier: Arc<MockNotifier>,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn start(settings: EscalationSettings) -> Self {
        Self::with(settings, MockNotifier::new(), true)
    }

    fn with(settings: EscalationSettings, notifier: Arc<MockNotifier>, feed_ok: bool) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let config = OrchestratorConfig {
            settings,
            ..OrchestratorConfig::default()
        };
        let (handle, join) = Orchestrator::spawn(
            config,
            notifier.clone(),
            Arc::new(IdleFeed { ok: feed_ok }),
            sink.clone(),
        );
        Self {
            handle,
            join,
            notifier,
            sink,
        }
    }

    async fn wait_vehicle(&self, pred: impl FnMut(&VehicleDoorState) -> bool) {
        let mut rx = self.handle.subscribe_vehicle();
        timeout(Duration::from_secs(600), rx.wait_for(pred))
            .await
            .expect("vehicle state not reached")
            .unwrap();
    }

    async fn wait_phase(&self, phase: EscalationPhase) {
        let mut rx = self.handle.subscribe_phase();
        timeout(Duration::from_secs(3600), rx.wait_for(|p| *p == phase))
            .await
            .unwrap_or_else(|_| panic!("phase {phase} not reached"))
            .unwrap();
    }

    /// Engine on, drive, stop, door open.
    async fn park_with_door_open(&self) {
        self.handle.start_engine().await.unwrap();
        self.wait_vehicle(|s| s.engine_on).await;
        self.handle.begin_move().await.unwrap();
        self.handle.begin_stop().await.unwrap();
        self.wait_vehicle(|s| s.vehicle_fully_stopped).await;
        self.handle.open_door().await.unwrap();
        self.wait_vehicle(|s| s.door_open).await;
    }

    /// Close the door and wait for the pre-alert countdown to start.
    async fn close_and_arm(&self) {
        self.handle.close_door().await.unwrap();
        self.wait_phase(EscalationPhase::CountdownToAlert).await;
    }

    fn set_count(&self, count: u32) {
        self.handle.detection().report_count(count);
    }

    async fn finish(self) {
        self.handle.exit().await.unwrap();
        self.join.await.unwrap();
        assert!(self.handle.active_tasks().is_empty());
    }
}

fn settings(attempts: u32) -> EscalationSettings {
    EscalationSettings::new(attempts, 1.0, 2.0)
}

// ── Branching at alert time ─────────────────────────────────────────────

/// Test: nobody detected → "check again" prompt, never an auto-open
#[tokio::test(start_paused = true)]
async fn test_zero_count_never_starts_auto_open() {
    let h = Harness::start(settings(3));
    h.park_with_door_open().await;
    h.set_count(0);
    h.close_and_arm().await;
    h.wait_phase(EscalationPhase::AlertActive).await;

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(h.handle.phase(), EscalationPhase::AlertActive);
    assert_eq!(h.handle.spawn_count(TaskKind::AutoOpenRetry), 0);
    assert_eq!(h.handle.active_tasks(), vec![TaskKind::AlertLoop]);
    assert!(h.notifier.count("alert:check_again") > 1);
    assert_eq!(h.notifier.count("alert:alarm"), 0);
    assert_eq!(h.handle.session().unwrap().detected_count, Some(0));
    h.finish().await;
}

/// Test: occupant detected → exactly one alert loop and one auto-open,
/// however fast the feed updates
#[tokio::test(start_paused = true)]
async fn test_occupant_spawns_single_alert_and_auto_open() {
    let h = Harness::start(settings(3));
    h.park_with_door_open().await;
    h.set_count(1);

    let feed = h.handle.detection().clone();
    let flood = tokio::spawn(async move {
        for i in 0..1500u32 {
            feed.report_count(1 + i % 2);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    h.close_and_arm().await;
    h.wait_phase(EscalationPhase::AutoOpenRetrying).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    flood.await.unwrap();

    assert_eq!(h.handle.spawn_count(TaskKind::AlertLoop), 1);
    assert_eq!(h.handle.spawn_count(TaskKind::AutoOpenRetry), 1);
    let active = h.handle.active_tasks();
    assert!(active.contains(&TaskKind::AlertLoop));
    assert!(active.contains(&TaskKind::AutoOpenRetry));
    // Count changes are displayed once the alert is live
    assert!(h.sink.counts.lock().unwrap().len() > 1);
    h.finish().await;
}

/// Test: two concurrent arm signals start one countdown
#[tokio::test(start_paused = true)]
async fn test_concurrent_arm_signals_start_one_countdown() {
    let h = Harness::start(settings(3));
    h.park_with_door_open().await;
    h.handle.close_door().await.unwrap();
    h.wait_vehicle(|s| s.door_fully_closed).await;

    let (a, b) = tokio::join!(h.handle.arm_detection(), h.handle.arm_detection());
    a.unwrap();
    b.unwrap();
    // The scheduled post-close arm lands on an armed machine too
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(h.handle.spawn_count(TaskKind::CountdownToAlert), 1);
    assert_eq!(h.handle.phase(), EscalationPhase::CountdownToAlert);
    assert_eq!(h.sink.log_count("Starting occupant detection cycle"), 1);
    h.finish().await;
}

// ── Automatic opening ───────────────────────────────────────────────────

/// Test: unlocked door opens on the first attempt; SOS never starts
#[tokio::test(start_paused = true)]
async fn test_auto_open_succeeds_on_first_attempt() {
    let h = Harness::start(settings(3));
    h.park_with_door_open().await;
    h.set_count(1);
    h.close_and_arm().await;
    h.wait_phase(EscalationPhase::AutoOpenRetrying).await;

    let started = Instant::now();
    h.wait_phase(EscalationPhase::DoorOpenedAutomatically).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));

    tokio::time::sleep(Duration::from_secs(180)).await;
    assert_eq!(h.handle.phase(), EscalationPhase::DoorOpenedAutomatically);
    assert_eq!(h.handle.spawn_count(TaskKind::SosWait), 0);
    assert_eq!(h.notifier.count("sos"), 0);
    assert!(h.handle.vehicle().door_open);
    // The alarm keeps sounding until acknowledged
    assert_eq!(h.handle.active_tasks(), vec![TaskKind::AlertLoop]);
    assert_eq!(h.sink.control(ControlId::AlarmOff), Some(true));
    h.finish().await;
}

/// Test: two locked attempts take 2 × (10s + 2s) and lead to SosWaiting
#[tokio::test(start_paused = true)]
async fn test_locked_door_exhausts_attempts_then_waits_for_sos() {
    let h = Harness::start(settings(2));
    h.park_with_door_open().await;
    h.set_count(1);
    h.close_and_arm().await;
    h.handle.toggle_lock().await.unwrap();
    h.wait_phase(EscalationPhase::AutoOpenRetrying).await;

    let started = Instant::now();
    h.wait_phase(EscalationPhase::SosWaiting).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(24) && elapsed < Duration::from_secs(25));

    assert_eq!(h.sink.log_count("failed: door is locked"), 2);
    assert!(h.sink.has_log("All automatic open attempts failed", Severity::Error));
    assert!(h.handle.active_tasks().contains(&TaskKind::SosWait));
    assert!(!h.handle.active_tasks().contains(&TaskKind::AutoOpenRetry));
    h.finish().await;
}

/// Test: operator opening the door by hand abandons the retry sequence
#[tokio::test(start_paused = true)]
async fn test_manual_open_cancels_auto_open() {
    let h = Harness::start(settings(3));
    h.park_with_door_open().await;
    h.set_count(2);
    h.close_and_arm().await;
    h.wait_phase(EscalationPhase::AutoOpenRetrying).await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    h.handle.open_door().await.unwrap();
    assert_eq!(h.handle.phase(), EscalationPhase::AlertActive);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.handle.phase(), EscalationPhase::AlertActive);
    assert!(!h.handle.active_tasks().contains(&TaskKind::AutoOpenRetry));
    assert!(h.sink.has_log("cancelled by operator", Severity::Info));
    assert_eq!(h.sink.control(ControlId::AlarmOff), Some(true));
    h.finish().await;
}

// ── SOS and authority ───────────────────────────────────────────────────

/// Test: alarm off while waiting for SOS stops everything downstream
#[tokio::test(start_paused = true)]
async fn test_alarm_off_during_sos_wait_stops_escalation() {
    let h = Harness::start(settings(1));
    h.park_with_door_open().await;
    h.set_count(1);
    h.close_and_arm().await;
    h.handle.toggle_lock().await.unwrap();
    h.wait_phase(EscalationPhase::SosWaiting).await;

    tokio::time::sleep(Duration::from_secs(20)).await;
    h.handle.alarm_off().await.unwrap();
    assert_eq!(h.handle.phase(), EscalationPhase::Acknowledged);
    assert!(h.handle.active_tasks().is_empty());

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.notifier.count("sos"), 0);
    assert_eq!(h.handle.spawn_count(TaskKind::AuthorityWait), 0);
    assert_eq!(h.handle.spawn_count(TaskKind::SafetyInstructionLoop), 0);
    assert!(h.handle.vehicle().alarm_acknowledged);
    h.finish().await;
}

/// Test: full ladder through SOS, safety instructions and authority signal
#[tokio::test(start_paused = true)]
async fn test_full_escalation_reaches_authority() {
    let h = Harness::start(settings(1));
    h.park_with_door_open().await;
    h.set_count(1);
    h.close_and_arm().await;
    h.handle.toggle_lock().await.unwrap();
    h.wait_phase(EscalationPhase::SosWaiting).await;

    let sos_started = Instant::now();
    h.wait_phase(EscalationPhase::AuthorityWaiting).await;
    // One minute countdown plus the pause after sending
    let elapsed = sos_started.elapsed();
    assert!(elapsed >= Duration::from_secs(61) && elapsed < Duration::from_secs(62));
    assert_eq!(h.notifier.count("sos"), 1);
    assert!(!h.handle.active_tasks().contains(&TaskKind::AlertLoop));

    h.wait_phase(EscalationPhase::AuthorityNotified).await;
    // Let the authority task return after reporting
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.notifier.count("authority"), 1);
    assert!(h.notifier.count("safety") >= 10);
    assert_eq!(
        h.handle.active_tasks(),
        vec![TaskKind::SafetyInstructionLoop]
    );
    assert!(h.sink.has_log("signalled the authorities", Severity::Warn));
    assert!(h.sink.ticks.lock().unwrap().iter().any(|t| t == "SOS in 01:00..."));
    assert!(h
        .sink
        .ticks
        .lock()
        .unwrap()
        .iter()
        .any(|t| t == "Authority signal in 02:00..."));

    h.handle.stop_engine().await.unwrap();
    assert!(h.handle.active_tasks().is_empty());
    assert!(!h.handle.vehicle().engine_on);
    assert_eq!(h.handle.phase(), EscalationPhase::Acknowledged);
    h.finish().await;
}

/// Test: a failed SOS is logged as an error and the ladder continues
#[tokio::test(start_paused = true)]
async fn test_failed_sos_still_escalates() {
    let notifier = Arc::new(MockNotifier {
        sos_delivered: false,
        ..MockNotifier::default()
    });
    let h = Harness::with(settings(1), notifier, true);
    h.park_with_door_open().await;
    h.set_count(1);
    h.close_and_arm().await;
    h.handle.toggle_lock().await.unwrap();

    h.wait_phase(EscalationPhase::AuthorityWaiting).await;
    assert!(h.sink.has_log("could not be delivered", Severity::Error));
    h.finish().await;
}

// ── Configuration errors ────────────────────────────────────────────────

/// Test: unusable attempt count skips retries and goes to SOS
#[tokio::test(start_paused = true)]
async fn test_invalid_attempts_skip_to_sos() {
    let h = Harness::start(settings(3));
    h.handle
        .update_setting(SettingField::AutoOpenAttempts, "three")
        .await
        .unwrap();
    h.park_with_door_open().await;
    h.set_count(1);
    h.close_and_arm().await;

    h.wait_phase(EscalationPhase::SosWaiting).await;
    assert_eq!(h.handle.spawn_count(TaskKind::AutoOpenRetry), 0);
    assert!(h.sink.has_log("Invalid automatic open attempt count", Severity::Error));
    h.finish().await;
}

/// Test: unusable SOS wait leaves the alarm sounding without an SOS task
#[tokio::test(start_paused = true)]
async fn test_invalid_sos_wait_is_not_spawned() {
    let h = Harness::start(settings(1));
    h.handle
        .update_setting(SettingField::SosWaitMinutes, "-1")
        .await
        .unwrap();
    h.park_with_door_open().await;
    h.set_count(1);
    h.close_and_arm().await;
    h.handle.toggle_lock().await.unwrap();

    h.wait_phase(EscalationPhase::AllRetriesExhausted).await;
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.handle.phase(), EscalationPhase::AllRetriesExhausted);
    assert_eq!(h.handle.spawn_count(TaskKind::SosWait), 0);
    assert_eq!(h.handle.active_tasks(), vec![TaskKind::AlertLoop]);
    assert!(h.sink.has_log("Invalid SOS wait time", Severity::Error));
    h.finish().await;
}

/// Test: unusable authority wait still starts the safety instructions
#[tokio::test(start_paused = true)]
async fn test_invalid_authority_wait_keeps_safety_loop() {
    let h = Harness::start(settings(1));
    h.handle
        .update_setting(SettingField::AuthorityWaitMinutes, "soon")
        .await
        .unwrap();
    h.park_with_door_open().await;
    h.set_count(1);
    h.close_and_arm().await;
    h.handle.toggle_lock().await.unwrap();

    h.wait_phase(EscalationPhase::AuthorityWaiting).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.handle.spawn_count(TaskKind::AuthorityWait), 0);
    assert_eq!(
        h.handle.active_tasks(),
        vec![TaskKind::SafetyInstructionLoop]
    );
    assert!(h.sink.has_log("Invalid authority wait time", Severity::Error));
    h.finish().await;
}

// ── Acknowledgment and re-arming ────────────────────────────────────────

/// Test: after alarm off, closing the door again does not re-arm until the
/// vehicle has moved and stopped again
#[tokio::test(start_paused = true)]
async fn test_rearm_suppressed_until_next_stop() {
    let h = Harness::start(settings(3));
    h.park_with_door_open().await;
    h.set_count(0);
    h.close_and_arm().await;
    h.wait_phase(EscalationPhase::AlertActive).await;
    h.handle.alarm_off().await.unwrap();

    h.handle.open_door().await.unwrap();
    h.wait_vehicle(|s| s.door_open).await;
    h.handle.close_door().await.unwrap();
    h.wait_vehicle(|s| s.door_fully_closed).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(h.handle.phase(), EscalationPhase::Acknowledged);
    assert_eq!(h.handle.spawn_count(TaskKind::CountdownToAlert), 1);
    assert!(!h.handle.vehicle().detection_armed);

    h.handle.begin_move().await.unwrap();
    h.handle.begin_stop().await.unwrap();
    h.wait_vehicle(|s| s.vehicle_fully_stopped).await;
    h.handle.open_door().await.unwrap();
    h.wait_vehicle(|s| s.door_open).await;
    h.close_and_arm().await;
    assert_eq!(h.handle.spawn_count(TaskKind::CountdownToAlert), 2);
    assert_eq!(h.handle.session().unwrap().id, 2);
    h.finish().await;
}

/// Test: repeated door cycles do not pile up finished task handles
#[tokio::test(start_paused = true)]
async fn test_door_cycles_keep_task_handles_bounded() {
    let h = Harness::start(settings(3));
    h.park_with_door_open().await;
    h.set_count(0);
    h.close_and_arm().await;
    h.wait_phase(EscalationPhase::AlertActive).await;
    h.handle.alarm_off().await.unwrap();

    for _ in 0..50 {
        h.handle.open_door().await.unwrap();
        h.wait_vehicle(|s| s.door_open).await;
        h.handle.close_door().await.unwrap();
        h.wait_vehicle(|s| s.door_fully_closed).await;
    }

    // Feed plus at most one entry per settle and arm-delay slot
    let tracked = h.handle.tracked_tasks();
    assert!(tracked <= 6, "{tracked} task handles after 50 door cycles");
    h.finish().await;
}

/// Test: driving off ends the session
#[tokio::test(start_paused = true)]
async fn test_moving_vehicle_ends_session() {
    let h = Harness::start(settings(3));
    h.park_with_door_open().await;
    h.set_count(0);
    h.close_and_arm().await;
    h.wait_phase(EscalationPhase::AlertActive).await;

    h.handle.begin_move().await.unwrap();
    assert_eq!(h.handle.phase(), EscalationPhase::Acknowledged);
    assert!(h.handle.active_tasks().is_empty());
    let vehicle = h.handle.vehicle();
    assert!(vehicle.vehicle_moving);
    assert!(!vehicle.alarm_acknowledged);
    assert!(h.notifier.count("stop_alerts") >= 1);
    h.finish().await;
}

/// Test: opening the door during the countdown still sounds the alert,
/// without automatic opening
#[tokio::test(start_paused = true)]
async fn test_door_opened_during_countdown_still_alerts() {
    let h = Harness::start(settings(3));
    h.park_with_door_open().await;
    h.set_count(1);
    h.close_and_arm().await;
    h.handle.open_door().await.unwrap();

    h.wait_phase(EscalationPhase::AlertActive).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.handle.phase(), EscalationPhase::AlertActive);
    assert_eq!(h.handle.spawn_count(TaskKind::AutoOpenRetry), 0);
    assert!(h.sink.has_log("opened before the alert", Severity::Warn));
    assert_eq!(h.sink.control(ControlId::AlarmOff), Some(true));
    h.handle.alarm_off().await.unwrap();
    h.finish().await;
}

// ── Rejections ──────────────────────────────────────────────────────────

/// Test: operator actions in the wrong state are rejected without change
#[tokio::test(start_paused = true)]
async fn test_preconditions_rejected() {
    let h = Harness::start(settings(3));
    h.handle.start_engine().await.unwrap();
    h.wait_vehicle(|s| s.engine_on).await;

    let err = h.handle.alarm_off().await.unwrap_err();
    assert!(matches!(
        err,
        CoordinationError::Precondition(PreconditionError::NoActiveSession)
    ));

    let err = h.handle.open_door().await.unwrap_err();
    assert!(matches!(
        err,
        CoordinationError::Precondition(PreconditionError::NotFullyStopped { .. })
    ));

    h.handle.begin_move().await.unwrap();
    let err = h.handle.stop_engine().await.unwrap_err();
    assert!(err.is_precondition());
    assert!(h.handle.vehicle().vehicle_moving);
    assert!(h.sink.has_log("Action rejected", Severity::Warn));
    h.finish().await;
}

/// Test: feed that cannot start leaves the engine off
#[tokio::test(start_paused = true)]
async fn test_engine_start_failure() {
    let h = Harness::with(settings(3), MockNotifier::new(), false);
    h.handle.start_engine().await.unwrap();

    timeout(Duration::from_secs(5), async {
        while !h.sink.has_log("Could not start", Severity::Error) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!h.handle.vehicle().engine_on);
    assert_eq!(h.sink.control(ControlId::Engine), Some(true));

    // A second start is allowed
    h.handle.start_engine().await.unwrap();
    h.finish().await;
}

// ── Shutdown ────────────────────────────────────────────────────────────

/// Test: shutdown joins every task; nothing ticks or sends afterwards
#[tokio::test(start_paused = true)]
async fn test_shutdown_is_terminal_and_reentrant() {
    let h = Harness::start(settings(1));
    h.park_with_door_open().await;
    h.set_count(1);
    h.close_and_arm().await;
    h.handle.toggle_lock().await.unwrap();
    h.wait_phase(EscalationPhase::SosWaiting).await;

    let (first, second) = tokio::join!(
        h.handle.request_shutdown(),
        h.handle.request_shutdown()
    );
    assert!(!first.reentrant);
    assert!(second.reentrant);
    assert_eq!(first.panicked(), 0);
    assert!(h.handle.active_tasks().is_empty());

    let ticks = h.sink.tick_count();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.sink.tick_count(), ticks);
    assert_eq!(h.notifier.count("sos"), 0);
    h.finish().await;
}

/// Test: a panicking notifier inside a task does not block shutdown
#[tokio::test(start_paused = true)]
async fn test_panicking_alert_is_isolated() {
    let notifier = MockNotifier::new();
    notifier.panic_on_alert.store(true, Ordering::SeqCst);
    let h = Harness::with(settings(3), notifier, true);
    h.park_with_door_open().await;
    h.set_count(1);
    h.close_and_arm().await;
    h.wait_phase(EscalationPhase::AutoOpenRetrying).await;

    let report = h.handle.request_shutdown().await;
    assert_eq!(report.panicked(), 1);
    assert!(h.handle.active_tasks().is_empty());
    h.finish().await;
}
