//! Bodies of the session-scoped background tasks.
//!
//! Each body owns a clone of [`StepContext`] and reports back to the
//! orchestrator loop through [`TaskEvent`]s tagged with its session id. No
//! body touches the vehicle state machine; they read the published
//! snapshot and let the orchestrator apply any change.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::session::SessionId;
use crate::config::Timings;
use crate::detection::DetectionCell;
use crate::events::Reporter;
use crate::notify::{AlertKind, NotificationService};
use crate::timer::{format_mm_ss, whole_seconds, CancellableTimer, TimerOutcome};
use crate::vehicle::{SettleTicket, VehicleDoorState};
use crate::worker::{pause, RepeatingWorker};

/// Results flowing from tasks back into the orchestrator loop.
#[derive(Debug)]
pub(crate) enum TaskEvent {
    /// The feed came up (or failed to).
    EngineReady { ok: bool },
    /// A stop / door settle delay elapsed.
    Settled(SettleTicket),
    /// The post-close arm delay elapsed.
    ArmDue,
    CountdownElapsed { session: SessionId },
    /// The door was unlocked when attempt `attempt` expired. The loop
    /// answers on `opened` whether it actually started opening the door;
    /// dropping it ends the sequence.
    AutoOpenReady {
        session: SessionId,
        attempt: u32,
        opened: oneshot::Sender<bool>,
    },
    AutoOpenExhausted { session: SessionId },
    /// SOS call returned and the post-SOS pause elapsed.
    SosFinished { session: SessionId, delivered: bool },
    AuthorityNotified { session: SessionId },
}

/// Everything a task body needs, cheap to clone.
#[derive(Clone)]
pub(crate) struct StepContext {
    pub session: SessionId,
    pub reporter: Reporter,
    pub notifier: Arc<dyn NotificationService>,
    pub detection: Arc<DetectionCell>,
    pub vehicle: watch::Receiver<VehicleDoorState>,
    pub timings: Timings,
    pub events: mpsc::UnboundedSender<TaskEvent>,
}

impl StepContext {
    fn send(&self, event: TaskEvent) {
        // The loop only drops its receiver on exit, after joining us.
        if self.events.send(event).is_err() {
            debug!(session = self.session, "Orchestrator gone; task result dropped");
        }
    }

    fn timer(&self, duration: Duration) -> CancellableTimer {
        CancellableTimer::new(duration).with_tick(self.timings.tick)
    }
}

/// Pre-alert countdown.
pub(crate) async fn countdown_to_alert(ctx: StepContext, token: CancellationToken) {
    let outcome = ctx
        .timer(ctx.timings.pre_alert)
        .run(&token, |remaining| {
            ctx.reporter
                .countdown(&format!("Alert sounds in {}s", whole_seconds(remaining)))
        })
        .await;
    if outcome == TimerOutcome::Completed {
        ctx.send(TaskEvent::CountdownElapsed {
            session: ctx.session,
        });
    }
}

/// Keep an alert clip playing until cancelled. The clip follows the latest
/// count: alarm while someone is detected, the milder prompt otherwise.
pub(crate) async fn alert_loop(ctx: StepContext, token: CancellationToken) {
    RepeatingWorker::new("alert_loop")
        .run(token, |tok| alert_iteration(&ctx, tok))
        .await;
}

async fn alert_iteration(ctx: &StepContext, token: CancellationToken) {
    if !ctx.notifier.is_alert_playing() {
        let kind = if ctx.detection.latest() >= 1 {
            AlertKind::Alarm
        } else {
            AlertKind::CheckAgain
        };
        ctx.notifier.play_alert(kind);
        if !pause(&token, ctx.timings.alert_replay_gap).await {
            return;
        }
    }
    pause(&token, ctx.timings.poll_interval).await;
}

/// Up to `attempts` countdowns; the lock state seen at each expiry decides
/// the attempt.
pub(crate) async fn auto_open_retry(ctx: StepContext, attempts: u32, token: CancellationToken) {
    for attempt in 1..=attempts {
        let outcome = ctx
            .timer(ctx.timings.auto_open_countdown)
            .run(&token, |remaining| {
                ctx.reporter.countdown(&format!(
                    "Automatic open attempt {attempt} in {}s...",
                    whole_seconds(remaining)
                ))
            })
            .await;
        if outcome == TimerOutcome::Cancelled {
            return;
        }

        let locked = ctx.vehicle.borrow().door_locked;
        if !locked {
            let (opened, verdict) = oneshot::channel();
            ctx.send(TaskEvent::AutoOpenReady {
                session: ctx.session,
                attempt,
                opened,
            });
            let opened = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                verdict = verdict => verdict,
            };
            match opened {
                Ok(true) | Err(_) => return,
                // Locked again before the loop got to it
                Ok(false) => {}
            }
        }

        ctx.reporter
            .warn(&format!("Automatic open attempt {attempt} failed: door is locked."));
        if !pause(&token, ctx.timings.retry_cooldown).await {
            return;
        }
    }

    ctx.reporter.error("All automatic open attempts failed.");
    ctx.send(TaskEvent::AutoOpenExhausted {
        session: ctx.session,
    });
}

/// Count down to the emergency message, send it, then hold briefly before
/// handing over to the authority wait.
pub(crate) async fn sos_wait(ctx: StepContext, wait: Duration, token: CancellationToken) {
    let outcome = ctx
        .timer(wait)
        .run(&token, |remaining| {
            ctx.reporter
                .countdown(&format!("SOS in {}...", format_mm_ss(remaining)))
        })
        .await;
    if outcome == TimerOutcome::Cancelled {
        return;
    }

    ctx.reporter.info("Sending SOS message...");
    let delivered = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        delivered = ctx.notifier.send_sos() => delivered,
    };
    if delivered {
        ctx.reporter.info("SOS message sent.");
    } else {
        ctx.reporter.error("SOS message could not be delivered.");
    }

    if !pause(&token, ctx.timings.post_sos_pause).await {
        return;
    }
    ctx.send(TaskEvent::SosFinished {
        session: ctx.session,
        delivered,
    });
}

/// Count down to the authority signal and send it.
pub(crate) async fn authority_wait(ctx: StepContext, wait: Duration, token: CancellationToken) {
    let outcome = ctx
        .timer(wait)
        .run(&token, |remaining| {
            ctx.reporter.countdown(&format!(
                "Authority signal in {}...",
                format_mm_ss(remaining)
            ))
        })
        .await;
    if outcome == TimerOutcome::Cancelled {
        return;
    }

    tokio::select! {
        biased;
        _ = token.cancelled() => return,
        _ = ctx.notifier.notify_authority() => {}
    }
    ctx.reporter.warn("The system has signalled the authorities.");
    ctx.send(TaskEvent::AuthorityNotified {
        session: ctx.session,
    });
}

/// Replay the safety-instruction clip until cancelled.
pub(crate) async fn safety_instruction_loop(ctx: StepContext, token: CancellationToken) {
    let iterations = RepeatingWorker::new("safety_instructions")
        .run(token, |tok| safety_iteration(&ctx, tok))
        .await;
    info!(session = ctx.session, iterations, "Safety instructions stopped");
}

async fn safety_iteration(ctx: &StepContext, token: CancellationToken) {
    ctx.notifier.play_safety_instructions();
    let wait = ctx.notifier.safety_instructions_duration() + ctx.timings.safety_pad;
    if !pause(&token, wait).await {
        ctx.notifier.stop_alert_sounds();
    }
}
