//! Tracing setup: stderr plus a per-run session log file.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use cabin_coordination::events::{EventFilter, FilteredReceiver};
use cabin_coordination::EventBus;
use chrono::{DateTime, Local};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// `noc_session_<YYYY-mm-dd_HH-MM-SS>.log`
pub fn session_log_name(started: DateTime<Local>) -> String {
    started
        .format("noc_session_%Y-%m-%d_%H-%M-%S.log")
        .to_string()
}

/// Create the session log file under `log_dir`.
pub fn create_session_log(log_dir: &Path, started: DateTime<Local>) -> Result<(PathBuf, File)> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let path = log_dir.join(session_log_name(started));
    let file = File::create(&path)
        .with_context(|| format!("Failed to create session log {}", path.display()))?;
    Ok((path, file))
}

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Target of the mirrored bus events.
pub const EVENTS_TARGET: &str = "cabin_agent::events";

/// Install the global subscriber. `RUST_LOG` overrides [`DEFAULT_FILTER`].
pub fn init(log_dir: &Path) -> Result<PathBuf> {
    let (path, file) = create_session_log(log_dir, Local::now())?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(path)
}

/// Event types mirrored into the session log as JSON.
pub const RECORDED_EVENTS: &[&str] = &["phase_changed", "person_count", "control_enablement"];

/// Mirror bus events into the log as one JSON line each, until the bus is
/// dropped.
pub fn record_events(bus: &EventBus) -> JoinHandle<u64> {
    let events = bus.subscribe_filtered(EventFilter::new().types(RECORDED_EVENTS.to_vec()));
    tokio::spawn(drain(events))
}

async fn drain(mut events: FilteredReceiver) -> u64 {
    let mut recorded = 0;
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => {
                    info!(target: EVENTS_TARGET, %json, "Guard event");
                    recorded += 1;
                }
                Err(e) => warn!("Could not serialize event: {e}"),
            },
            Err(RecvError::Lagged(missed)) => warn!(missed, "Event recorder lagged"),
            Err(RecvError::Closed) => return recorded,
        }
    }
}
