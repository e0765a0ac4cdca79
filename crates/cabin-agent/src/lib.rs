//! Cabin guard host agent
//!
//! Wires the escalation core to the outside world: configuration, tracing
//! with a per-run session log, a simulated camera feed, a notification
//! service (simulated sounds, Slack SOS, authority webhook) and an
//! operator console.

pub mod config;
pub mod console;
pub mod display;
pub mod feed;
pub mod notifier;
pub mod telemetry;

pub use config::{AgentConfig, Args};
pub use console::{Console, ConsoleCommand, Scenario};
pub use display::TerminalDisplay;
pub use feed::SimulatedFeed;
pub use notifier::AgentNotifier;
