//! Terminal rendering of orchestrator events.
//!
//! Log events already reach the tracing subscriber through the core's
//! reporter; this sink prints what an operator panel would show: status
//! line, countdowns, occupant count, phase changes and control changes.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use cabin_coordination::{ControlId, EventSink, GuardEvent, Severity};
use tracing::debug;

pub struct TerminalDisplay {
    out: Mutex<Box<dyn Write + Send>>,
    controls: Mutex<BTreeMap<String, bool>>,
}

impl TerminalDisplay {
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            controls: Mutex::new(BTreeMap::new()),
        }
    }

    /// Controls currently enabled, by name.
    pub fn enabled_controls(&self) -> Vec<String> {
        self.controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn line(&self, text: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        // A closed stdout is not worth failing the orchestrator over
        let _ = writeln!(out, "{text}");
        let _ = out.flush();
    }
}

fn control_name(control: ControlId) -> String {
    serde_json::to_value(control)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{control:?}"))
}

impl EventSink for TerminalDisplay {
    fn on_status_change(&self, text: &str) {
        self.line(&format!("[status] {text}"));
    }

    fn on_log_event(&self, message: &str, severity: Severity) {
        if severity != Severity::Info {
            self.line(&format!("[{severity}] {message}"));
        }
    }

    fn on_countdown_tick(&self, message: &str) {
        self.line(&format!("  ... {message}"));
    }

    fn on_person_count(&self, count: u32) {
        self.line(&format!("[camera] occupants: {count}"));
    }

    fn on_control_enablement(&self, control: ControlId, enabled: bool) {
        let name = control_name(control);
        debug!(control = %name, enabled, "Control enablement");
        self.controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, enabled);
    }

    fn on_event(&self, event: &GuardEvent) {
        if let GuardEvent::PhaseChanged { from, to, .. } = event {
            self.line(&format!("[phase] {from} -> {to}"));
        }
    }
}
