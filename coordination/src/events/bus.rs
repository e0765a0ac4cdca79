//! Broadcast bus for presentation subscribers
//!
//! Every sink callback becomes a timestamped [`GuardEvent`] on a tokio
//! broadcast channel. Publishing never blocks the orchestrator: with no
//! subscribers the event is dropped, and a slow subscriber lags and loses
//! its oldest events.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::trace;

use super::sink::EventSink;
use super::types::{ControlId, GuardEvent, Severity};

/// Events buffered per subscriber before it starts lagging.
const BUS_CAPACITY: usize = 1024;

pub type SharedEventBus = Arc<EventBus>;

pub struct EventBus {
    tx: broadcast::Sender<GuardEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(BUS_CAPACITY).0,
        }
    }

    /// Wrap in an `Arc` for handing to the orchestrator as a sink.
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    pub fn publish(&self, event: GuardEvent) {
        let kind = event.event_type();
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(kind, delivered, "Guard event");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.tx.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver {
            rx: self.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for EventBus {
    fn on_status_change(&self, text: &str) {
        self.publish(GuardEvent::StatusChanged {
            text: text.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn on_log_event(&self, message: &str, severity: Severity) {
        self.publish(GuardEvent::Log {
            message: message.to_string(),
            severity,
            timestamp: Utc::now(),
        });
    }

    fn on_countdown_tick(&self, message: &str) {
        self.publish(GuardEvent::CountdownTick {
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn on_person_count(&self, count: u32) {
        self.publish(GuardEvent::PersonCount {
            count,
            timestamp: Utc::now(),
        });
    }

    fn on_control_enablement(&self, control: ControlId, enabled: bool) {
        self.publish(GuardEvent::ControlEnablement {
            control,
            enabled,
            timestamp: Utc::now(),
        });
    }

    fn on_event(&self, event: &GuardEvent) {
        // Only phase changes arrive here; the rest come through the
        // dedicated callbacks above
        if matches!(event, GuardEvent::PhaseChanged { .. }) {
            self.publish(event.clone());
        }
    }
}

/// Subscriber-side selection by event type and log severity. The default
/// passes everything.
#[derive(Debug, Default, Clone)]
pub struct EventFilter {
    kinds: Option<Vec<&'static str>>,
    min_severity: Option<Severity>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only these [`GuardEvent::event_type`] names.
    pub fn types(mut self, kinds: Vec<&'static str>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Drop log events below `severity`. Non-log events are unaffected.
    pub fn min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn matches(&self, event: &GuardEvent) -> bool {
        let kind_ok = self
            .kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&event.event_type()));
        let severity_ok = match (self.min_severity, event) {
            (Some(min), GuardEvent::Log { severity, .. }) => rank(*severity) >= rank(min),
            _ => true,
        };
        kind_ok && severity_ok
    }
}

fn rank(severity: Severity) -> u8 {
    match severity {
        Severity::Info => 0,
        Severity::Warn => 1,
        Severity::Error => 2,
    }
}

/// A bus subscription that skips events its filter rejects.
pub struct FilteredReceiver {
    rx: broadcast::Receiver<GuardEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub async fn recv(&mut self) -> Result<GuardEvent, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(severity: Severity) -> GuardEvent {
        GuardEvent::Log {
            message: "automatic open attempt 1 failed".into(),
            severity,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_sink_callbacks_become_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.on_status_change("Vehicle stopped");
        bus.on_person_count(2);

        assert_eq!(rx.recv().await.unwrap().event_type(), "status_changed");
        assert!(matches!(
            rx.recv().await.unwrap(),
            GuardEvent::PersonCount { count: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_each_event() {
        let bus = EventBus::new().shared();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.on_countdown_tick("SOS in 00:42...");
        assert_eq!(first.recv().await.unwrap(), second.recv().await.unwrap());
    }

    #[test]
    fn test_publish_with_no_subscribers() {
        let bus = EventBus::new();
        bus.on_log_event("nobody listening", Severity::Info);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_filter_by_type_and_severity() {
        let filter = EventFilter::new()
            .types(vec!["log"])
            .min_severity(Severity::Warn);

        assert!(filter.matches(&log(Severity::Warn)));
        assert!(filter.matches(&log(Severity::Error)));
        assert!(!filter.matches(&log(Severity::Info)));
        assert!(!filter.matches(&GuardEvent::CountdownTick {
            message: "Alert sounds in 5s".into(),
            timestamp: Utc::now(),
        }));
        assert!(EventFilter::new().matches(&log(Severity::Info)));
    }

    #[tokio::test]
    async fn test_filtered_receiver_skips_rejected() {
        let bus = EventBus::new().shared();
        let mut counts = bus.subscribe_filtered(EventFilter::new().types(vec!["person_count"]));

        bus.on_countdown_tick("Alert sounds in 3s");
        bus.on_log_event("Door closed.", Severity::Info);
        bus.on_person_count(1);

        let event = counts.recv().await.unwrap();
        assert!(matches!(event, GuardEvent::PersonCount { count: 1, .. }));
    }
}
