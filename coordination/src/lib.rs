//! Cabin Guard Coordination Library
//!
//! The escalation core of a left-behind occupant monitor. After the driver
//! stops the vehicle and closes the door, the core watches the occupant
//! count reported by a detection feed and, if someone is still inside,
//! drives an escalating response:
//! countdown, audible alert, automatic door-release retries, an emergency
//! message, and finally a signal to the authorities.
//!
//! # Modules
//!
//! - [`timer`]: `CancellableTimer`, the countdown behind every wait
//! - [`worker`]: `RepeatingWorker`, the loop behind alert and safety clips
//! - [`vehicle`]: engine / motion / door / lock state machine
//! - [`escalation`]: phase machine, session and the orchestrator loop
//! - [`tasks`] and [`shutdown`]: one-task-per-kind registry and ordered joins
//! - [`notify`] and [`detection`]: collaborator contracts
//! - [`events`]: outbound reporting (sink trait, broadcast bus)
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use cabin_coordination::{Orchestrator, OrchestratorConfig};
//! # use cabin_coordination::{DetectionFeed, NotificationService, EventBus};
//! # async fn demo(notifier: Arc<dyn NotificationService>, feed: Arc<dyn DetectionFeed>) {
//! let bus = EventBus::new().shared();
//! let (handle, join) = Orchestrator::spawn(OrchestratorConfig::default(), notifier, feed, bus);
//! handle.start_engine().await.ok();
//! handle.exit().await.ok();
//! join.await.ok();
//! # }
//! ```

pub mod config;
pub mod detection;
pub mod error;
pub mod escalation;
pub mod events;
pub mod notify;
pub mod shutdown;
pub mod tasks;
pub mod timer;
pub mod vehicle;
pub mod worker;

pub use config::{EscalationSettings, SettingValue, Timings};
pub use detection::{DetectionCell, DetectionFeed, DetectionReporter, DetectionUpdate};
pub use error::{ConfigError, CoordinationError, CoordinationResult, PreconditionError, SettingField};
pub use escalation::{
    Command, EscalationPhase, Orchestrator, OrchestratorConfig, OrchestratorHandle, SessionEnd,
    SessionId, SessionSummary,
};
pub use events::{
    ControlId, EventBus, EventSink, FanoutSink, GuardEvent, NullSink, Reporter, Severity,
};
pub use notify::{AlertKind, NotificationService};
pub use shutdown::{JoinStatus, ShutdownCoordinator, ShutdownPhase, ShutdownReport};
pub use tasks::{TaskKind, TaskRegistry, TaskSlot};
pub use timer::{CancellableTimer, TimerOutcome};
pub use vehicle::{DoorPosition, LockState, VehicleDoorState, VehicleDoorStateMachine, VehiclePhase};
pub use worker::RepeatingWorker;
