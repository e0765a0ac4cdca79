//! Detection feed contract and the latest-count cell
//!
//! The feed runs in its own task and pushes `(occupant_count,
//! frame_available)` pairs at whatever rate it manages. The core keeps only
//! the most recent count in an atomic cell: the feed path is its only writer,
//! the alert logic only reads it, and nothing is buffered.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::events::{EventSink, Reporter};

/// One update from the detection feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionUpdate {
    pub occupant_count: u32,
    pub frame_available: bool,
}

/// Source of occupant counts (camera + detector in production).
#[async_trait]
pub trait DetectionFeed: Send + Sync + 'static {
    /// Bring the feed up (open camera, warm up model). Called on every
    /// engine start; `false` aborts the start.
    async fn prepare(&self) -> bool;

    /// Push updates through `reporter` until `token` is cancelled.
    async fn stream(&self, token: CancellationToken, reporter: DetectionReporter);
}

/// Last-value-wins occupant count.
#[derive(Debug, Default)]
pub struct DetectionCell {
    latest: AtomicU32,
    updates: AtomicU64,
    frames_missing: AtomicU64,
    display: AtomicBool,
}

impl DetectionCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest recorded occupant count.
    pub fn latest(&self) -> u32 {
        self.latest.load(Ordering::Acquire)
    }

    /// Total updates received since start.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Updates that arrived without a frame.
    pub fn frames_missing(&self) -> u64 {
        self.frames_missing.load(Ordering::Relaxed)
    }

    /// Whether count changes are currently forwarded to the sink.
    pub fn is_displayed(&self) -> bool {
        self.display.load(Ordering::Acquire)
    }

    pub(crate) fn set_display(&self, on: bool) {
        self.display.store(on, Ordering::Release);
    }
}

/// Write side of the cell, handed to the feed.
#[derive(Clone)]
pub struct DetectionReporter {
    cell: Arc<DetectionCell>,
    events: Reporter,
}

impl DetectionReporter {
    pub(crate) fn new(cell: Arc<DetectionCell>, events: Reporter) -> Self {
        Self { cell, events }
    }

    /// A reporter with its own cell, for driving a feed outside an
    /// orchestrator.
    pub fn for_sink(sink: Arc<dyn EventSink>) -> Self {
        Self::new(Arc::new(DetectionCell::new()), Reporter::new(sink))
    }

    /// Record an update. Count changes are forwarded to the sink only while
    /// the session is past its pre-alert countdown.
    pub fn report(&self, update: DetectionUpdate) {
        let previous = self.cell.latest.swap(update.occupant_count, Ordering::AcqRel);
        self.cell.updates.fetch_add(1, Ordering::Relaxed);
        if !update.frame_available {
            self.cell.frames_missing.fetch_add(1, Ordering::Relaxed);
        }
        if self.cell.is_displayed() && previous != update.occupant_count {
            self.events.person_count(update.occupant_count);
        }
    }

    /// Shorthand for a frame-backed count.
    pub fn report_count(&self, occupant_count: u32) {
        self.report(DetectionUpdate {
            occupant_count,
            frame_available: true,
        });
    }

    pub fn cell(&self) -> &Arc<DetectionCell> {
        &self.cell
    }
}
