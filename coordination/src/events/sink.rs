//! Outbound sink interface and the tracing-mirroring reporter

use std::sync::Arc;

use chrono::Utc;

use super::types::{ControlId, GuardEvent, Severity};
use crate::escalation::{EscalationPhase, SessionId};

/// Receiver of everything the core reports. Implementations must be cheap
/// and non-blocking; they are called from the orchestrator loop and from
/// task bodies.
pub trait EventSink: Send + Sync {
    fn on_status_change(&self, text: &str);

    fn on_log_event(&self, message: &str, severity: Severity);

    fn on_countdown_tick(&self, message: &str);

    fn on_person_count(&self, count: u32);

    fn on_control_enablement(&self, control: ControlId, enabled: bool);

    /// Structured events with no dedicated callback (phase changes).
    fn on_event(&self, _event: &GuardEvent) {}
}

/// Sink that drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn on_status_change(&self, _text: &str) {}
    fn on_log_event(&self, _message: &str, _severity: Severity) {}
    fn on_countdown_tick(&self, _message: &str) {}
    fn on_person_count(&self, _count: u32) {}
    fn on_control_enablement(&self, _control: ControlId, _enabled: bool) {}
}

/// Fan-out to several sinks (e.g. the bus and a session log file).
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn on_status_change(&self, text: &str) {
        self.sinks.iter().for_each(|s| s.on_status_change(text));
    }

    fn on_log_event(&self, message: &str, severity: Severity) {
        self.sinks.iter().for_each(|s| s.on_log_event(message, severity));
    }

    fn on_countdown_tick(&self, message: &str) {
        self.sinks.iter().for_each(|s| s.on_countdown_tick(message));
    }

    fn on_person_count(&self, count: u32) {
        self.sinks.iter().for_each(|s| s.on_person_count(count));
    }

    fn on_control_enablement(&self, control: ControlId, enabled: bool) {
        self.sinks
            .iter()
            .for_each(|s| s.on_control_enablement(control, enabled));
    }

    fn on_event(&self, event: &GuardEvent) {
        self.sinks.iter().for_each(|s| s.on_event(event));
    }
}

/// Cloneable handle the orchestrator and its tasks report through. Log
/// events are mirrored into `tracing` at the matching level.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn EventSink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub fn status(&self, text: &str) {
        tracing::debug!(status = text, "Status changed");
        self.sink.on_status_change(text);
    }

    pub fn info(&self, message: &str) {
        tracing::info!("{}", message);
        self.sink.on_log_event(message, Severity::Info);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!("{}", message);
        self.sink.on_log_event(message, Severity::Warn);
    }

    pub fn error(&self, message: &str) {
        tracing::error!("{}", message);
        self.sink.on_log_event(message, Severity::Error);
    }

    pub fn countdown(&self, message: &str) {
        self.sink.on_countdown_tick(message);
    }

    pub fn person_count(&self, count: u32) {
        self.sink.on_person_count(count);
    }

    pub fn control(&self, control: ControlId, enabled: bool) {
        self.sink.on_control_enablement(control, enabled);
    }

    pub fn phase_changed(&self, session_id: SessionId, from: EscalationPhase, to: EscalationPhase) {
        self.sink.on_event(&GuardEvent::PhaseChanged {
            session_id,
            from,
            to,
            timestamp: Utc::now(),
        });
    }
}
