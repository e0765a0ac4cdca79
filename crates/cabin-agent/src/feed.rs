//! Simulated camera feed.
//!
//! Stands in for the camera plus person-detection model: the operator sets
//! the occupant count from the console and the feed republishes it at a
//! fixed rate, as a real detector would on every frame.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cabin_coordination::{DetectionFeed, DetectionReporter, DetectionUpdate};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;

/// Accepted publish rates; anything outside falls back to the default.
const RATE_RANGE_HZ: std::ops::RangeInclusive<f64> = 0.1..=1000.0;

fn publish_period(rate_hz: f64) -> Duration {
    let fallback = || Duration::from_secs_f64(1.0 / FeedConfig::default().rate_hz);
    if !RATE_RANGE_HZ.contains(&rate_hz) {
        warn!(rate_hz, "Feed rate out of range; using the default");
        return fallback();
    }
    Duration::try_from_secs_f64(1.0 / rate_hz).unwrap_or_else(|_| fallback())
}

#[derive(Debug, Clone)]
pub struct SimulatedFeed {
    count: Arc<AtomicU32>,
    camera_ok: Arc<AtomicBool>,
    warmup: Duration,
    period: Duration,
}

impl SimulatedFeed {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            count: Arc::new(AtomicU32::new(config.initial_count)),
            camera_ok: Arc::new(AtomicBool::new(true)),
            warmup: Duration::from_millis(config.warmup_ms),
            period: publish_period(config.rate_hz),
        }
    }

    /// Occupant count the feed reports from now on.
    pub fn set_count(&self, count: u32) {
        self.count.store(count, Ordering::Relaxed);
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Make the next `prepare` fail, as an unplugged camera would.
    pub fn set_camera_available(&self, ok: bool) {
        self.camera_ok.store(ok, Ordering::Relaxed);
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

#[async_trait]
impl DetectionFeed for SimulatedFeed {
    async fn prepare(&self) -> bool {
        tokio::time::sleep(self.warmup).await;
        let ok = self.camera_ok.load(Ordering::Relaxed);
        info!(ok, "Camera and detection model warm-up finished");
        ok
    }

    async fn stream(&self, token: CancellationToken, reporter: DetectionReporter) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    reporter.report(DetectionUpdate {
                        occupant_count: self.count(),
                        frame_available: true,
                    });
                }
            }
        }
        debug!("Simulated feed stopped");
    }
}
