//! Notification service for the agent
//!
//! Sounds are simulated: each clip is logged and occupies its channel for
//! its configured length, which is what `is_alert_playing` reports. The SOS
//! goes out over Slack `chat.postMessage`, one task per recipient, each
//! repeating the message `spam_count` times. The authority signal is an
//! optional JSON webhook.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cabin_coordination::{AlertKind, NotificationService};
use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, AuthorityConfig, SlackConfig, SoundConfig};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clip {
    Alarm,
    CheckAgain,
    SafetyInstructions,
    EngineStart,
    EngineIdle,
    EngineOff,
}

impl Clip {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Alarm => "alert.mp3",
            Self::CheckAgain => "check_again.mp3",
            Self::SafetyInstructions => "safety_instructions.mp3",
            Self::EngineStart => "start_engine.wav",
            Self::EngineIdle => "car_idle.wav",
            Self::EngineOff => "turnoff_engine.wav",
        }
    }
}

/// Simulated mixer with an alert channel and an engine channel.
#[derive(Debug)]
pub struct SoundBoard {
    lengths: SoundConfig,
    alert_until: Mutex<Option<Instant>>,
    engine_idle: Mutex<bool>,
}

impl SoundBoard {
    pub fn new(lengths: SoundConfig) -> Self {
        Self {
            lengths,
            alert_until: Mutex::new(None),
            engine_idle: Mutex::new(false),
        }
    }

    pub fn length(&self, clip: Clip) -> Duration {
        let ms = match clip {
            Clip::Alarm => self.lengths.alarm_ms,
            Clip::CheckAgain => self.lengths.check_again_ms,
            Clip::SafetyInstructions => self.lengths.safety_instructions_ms,
            Clip::EngineStart => self.lengths.engine_start_ms,
            // Loops until replaced
            Clip::EngineIdle => 0,
            Clip::EngineOff => self.lengths.engine_off_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn play(&self, clip: Clip) {
        info!(clip = clip.file_name(), "Playing sound");
        match clip {
            Clip::Alarm | Clip::CheckAgain | Clip::SafetyInstructions => {
                let until = Instant::now() + self.length(clip);
                *self
                    .alert_until
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(until);
            }
            Clip::EngineIdle => self.set_idle(true),
            Clip::EngineStart | Clip::EngineOff => self.set_idle(false),
        }
    }

    pub fn stop_alerts(&self) {
        let mut until = self
            .alert_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if until.take().is_some() {
            debug!("Alert channel stopped");
        }
    }

    pub fn stop_all(&self) {
        self.stop_alerts();
        self.set_idle(false);
    }

    pub fn is_alert_playing(&self) -> bool {
        self.alert_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|until| Instant::now() < until)
    }

    pub fn is_engine_idling(&self) -> bool {
        *self
            .engine_idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_idle(&self, on: bool) {
        *self
            .engine_idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = on;
    }
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Minimal Slack Web API client.
#[derive(Debug, Clone)]
pub struct SlackClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl SlackClient {
    pub fn new(http: reqwest::Client, api_url: &str, token: &str) -> Self {
        Self {
            http,
            api_url: api_url.to_string(),
            token: token.to_string(),
        }
    }

    /// Post one message. `true` when Slack answered `ok: true`.
    pub async fn post_message(&self, channel: &str, text: &str) -> bool {
        match self.try_post(channel, text).await {
            Ok(resp) if resp.ok => true,
            Ok(resp) => {
                warn!(
                    channel,
                    error = resp.error.as_deref().unwrap_or("unknown"),
                    "Slack rejected the message"
                );
                false
            }
            Err(e) => {
                warn!(channel, "Slack request failed: {e:#}");
                false
            }
        }
    }

    async fn try_post(&self, channel: &str, text: &str) -> Result<SlackResponse> {
        self.http
            .post(&self.api_url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "channel": channel, "text": text }))
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .context("sending chat.postMessage")?
            .error_for_status()
            .context("chat.postMessage status")?
            .json::<SlackResponse>()
            .await
            .context("decoding chat.postMessage response")
    }
}

/// The agent's [`NotificationService`].
pub struct AgentNotifier {
    sounds: Arc<SoundBoard>,
    slack: SlackConfig,
    authority: AuthorityConfig,
    http: reqwest::Client,
}

impl AgentNotifier {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        if config.slack.bot_token.is_none() {
            warn!("SLACK_BOT_TOKEN is not set; SOS messages will not be sent");
        }
        Ok(Self {
            sounds: Arc::new(SoundBoard::new(config.sounds.clone())),
            slack: config.slack.clone(),
            authority: config.authority.clone(),
            http,
        })
    }

    pub fn sounds(&self) -> &Arc<SoundBoard> {
        &self.sounds
    }

    /// Start one sender per recipient and wait for each first attempt.
    /// Later repeats continue in the background.
    async fn broadcast_sos(&self, client: SlackClient) -> bool {
        let count = self.slack.spam_count;
        let delay = Duration::from_millis(self.slack.spam_delay_ms);

        let firsts = self.slack.recipients.iter().map(move |recipient| {
            let (first_tx, first_rx) = oneshot::channel();
            let client = client.clone();
            let recipient = recipient.clone();
            let text = self.slack.message.clone();
            tokio::spawn(async move {
                let mut first_tx = Some(first_tx);
                for attempt in 1..=count {
                    info!(%recipient, attempt, of = count, "Sending SOS");
                    let ok = client.post_message(&recipient, &text).await;
                    if let Some(tx) = first_tx.take() {
                        let _ = tx.send(ok);
                    }
                    if attempt < count {
                        tokio::time::sleep(delay).await;
                    }
                }
                debug!(%recipient, "Finished repeated SOS sending");
            });
            first_rx
        });

        join_all(firsts)
            .await
            .into_iter()
            .any(|first| matches!(first, Ok(true)))
    }
}

#[async_trait]
impl NotificationService for AgentNotifier {
    fn play_alert(&self, kind: AlertKind) {
        match kind {
            AlertKind::Alarm => self.sounds.play(Clip::Alarm),
            AlertKind::CheckAgain => self.sounds.play(Clip::CheckAgain),
        }
    }

    fn stop_alert_sounds(&self) {
        self.sounds.stop_alerts();
    }

    fn play_safety_instructions(&self) {
        self.sounds.play(Clip::SafetyInstructions);
    }

    fn safety_instructions_duration(&self) -> Duration {
        self.sounds.length(Clip::SafetyInstructions)
    }

    async fn send_sos(&self) -> bool {
        let Some(token) = self.slack.bot_token.as_deref() else {
            error!("SLACK_BOT_TOKEN is not configured");
            return false;
        };
        if self.slack.recipients.is_empty() {
            error!("SOS recipient list is empty");
            return false;
        }
        let client = SlackClient::new(self.http.clone(), &self.slack.api_url, token);
        self.broadcast_sos(client).await
    }

    async fn notify_authority(&self) {
        let Some(url) = self.authority.webhook_url.as_deref() else {
            info!("Signal sent to the authorities");
            return;
        };
        let payload = serde_json::json!({
            "event": "occupant_left_behind",
            "message": self.slack.message,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        match self.http.post(url).json(&payload).send().await {
            Ok(resp) => info!(status = %resp.status(), "Authority webhook notified"),
            Err(e) => error!("Authority webhook failed: {e}"),
        }
    }

    fn is_alert_playing(&self) -> bool {
        self.sounds.is_alert_playing()
    }

    fn play_engine_start(&self) {
        self.sounds.play(Clip::EngineStart);
    }

    fn play_engine_idle(&self) {
        self.sounds.play(Clip::EngineIdle);
    }

    fn play_engine_off(&self) {
        self.sounds.play(Clip::EngineOff);
    }

    fn stop_all_sounds(&self) {
        self.sounds.stop_all();
    }
}
