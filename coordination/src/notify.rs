//! Notification service contract
//!
//! Sound playback and outbound messaging live outside the core. The
//! orchestrator only calls these capabilities and reads their results.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which alert clip to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Occupant detected: full alarm
    Alarm,
    /// Nobody detected: milder "please check the vehicle" prompt
    CheckAgain,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alarm => write!(f, "alarm"),
            Self::CheckAgain => write!(f, "check_again"),
        }
    }
}

/// Capabilities the escalation core depends on.
///
/// Synchronous methods must return promptly. A panic in any of them is
/// contained and logged. `send_sos` and `notify_authority` may take as long
/// as they like; cancellation abandons them mid-call.
#[async_trait]
pub trait NotificationService: Send + Sync {
    /// Start an alert clip (non-blocking).
    fn play_alert(&self, kind: AlertKind);

    fn stop_alert_sounds(&self);

    /// Start the safety-instruction clip (non-blocking). Stops alert sounds.
    fn play_safety_instructions(&self);

    /// Length of the safety-instruction clip.
    fn safety_instructions_duration(&self) -> Duration;

    /// Send the emergency message. Returns whether it was delivered.
    async fn send_sos(&self) -> bool;

    async fn notify_authority(&self);

    fn is_alert_playing(&self) -> bool;

    fn play_engine_start(&self) {}

    fn play_engine_idle(&self) {}

    fn play_engine_off(&self) {}

    fn stop_all_sounds(&self) {
        self.stop_alert_sounds();
    }
}
