//! Outbound reporting for the escalation core
//!
//! The core never touches a presentation layer. It reports through the
//! [`EventSink`] trait (status text, log lines, countdown ticks, person count,
//! control enablement). Two implementations ship here:
//!
//! 1. **Event Bus** (`bus.rs`): Tokio broadcast fan-out of [`GuardEvent`]s
//!    for any number of subscribers.
//!
//! 2. **Fanout / Null sinks** (`sink.rs`): composition helpers.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Orchestrator │────▶│   Reporter   │────▶│  EventSink   │
//! │   + tasks    │     │ (+ tracing)  │     │ (bus, file)  │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```

pub mod bus;
pub mod sink;
pub mod types;

pub use bus::{EventBus, EventFilter, FilteredReceiver, SharedEventBus};
pub use sink::{EventSink, FanoutSink, NullSink, Reporter};
pub use types::{ControlId, GuardEvent, Severity};
