//! Agent configuration: TOML file, then environment, then CLI flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cabin_coordination::{EscalationSettings, Timings};
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory for session log files (overrides `log_dir`)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Replay a scripted scenario instead of reading commands from stdin
    #[arg(long)]
    pub scenario: Option<PathBuf>,

    /// Automatic door-open attempts before falling back to SOS
    #[arg(long)]
    pub auto_open_attempts: Option<u32>,

    /// Minutes between exhausted retries and the SOS message
    #[arg(long)]
    pub sos_wait_minutes: Option<f64>,

    /// Minutes between the SOS message and the authority signal
    #[arg(long)]
    pub authority_wait_minutes: Option<f64>,
}

/// Slack SOS delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    /// Bot token (`SLACK_BOT_TOKEN`)
    pub bot_token: Option<String>,
    /// User or channel ids (`CABIN_SOS_RECIPIENTS`, comma separated)
    pub recipients: Vec<String>,
    pub message: String,
    /// Messages sent to each recipient
    pub spam_count: u32,
    /// Spacing between repeated messages
    pub spam_delay_ms: u64,
    pub api_url: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            recipients: Vec::new(),
            message: "Emergency alert from the cabin guard! Someone is trapped inside. \
                      Please check immediately!"
                .to_string(),
            spam_count: 5,
            spam_delay_ms: 3_000,
            api_url: "https://slack.com/api/chat.postMessage".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Webhook receiving the authority signal (`CABIN_AUTHORITY_WEBHOOK`).
    /// Without one the signal is only logged.
    pub webhook_url: Option<String>,
}

/// Simulated camera feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Updates per second
    pub rate_hz: f64,
    /// Camera/model warm-up before the engine reports ready
    pub warmup_ms: u64,
    /// Occupant count before the operator sets one
    pub initial_count: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            rate_hz: 15.0,
            warmup_ms: 500,
            initial_count: 0,
        }
    }
}

/// Simulated clip lengths, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundConfig {
    pub alarm_ms: u64,
    pub check_again_ms: u64,
    pub safety_instructions_ms: u64,
    pub engine_start_ms: u64,
    pub engine_off_ms: u64,
}

impl Default for SoundConfig {
    fn default() -> Self {
        Self {
            alarm_ms: 3_000,
            check_again_ms: 4_000,
            safety_instructions_ms: 8_000,
            engine_start_ms: 2_000,
            engine_off_ms: 2_000,
        }
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub log_dir: PathBuf,
    pub escalation: EscalationSettings,
    pub timings: Timings,
    pub slack: SlackConfig,
    pub authority: AuthorityConfig,
    pub feed: FeedConfig,
    pub sounds: SoundConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("noc_logs"),
            escalation: EscalationSettings::default(),
            timings: Timings::default(),
            slack: SlackConfig::default(),
            authority: AuthorityConfig::default(),
            feed: FeedConfig::default(),
            sounds: SoundConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Resolve the full configuration for a run.
    pub fn load(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.apply_args(args);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Overlay environment variables, looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(token) = var("SLACK_BOT_TOKEN").filter(|t| !t.trim().is_empty()) {
            self.slack.bot_token = Some(token.trim().to_string());
        }
        if let Some(list) = var("CABIN_SOS_RECIPIENTS") {
            self.slack.recipients = list
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(url) = var("CABIN_AUTHORITY_WEBHOOK").filter(|u| !u.trim().is_empty()) {
            self.authority.webhook_url = Some(url.trim().to_string());
        }
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(dir) = &args.log_dir {
            self.log_dir = dir.clone();
        }
        if let Some(n) = args.auto_open_attempts {
            self.escalation.auto_open_attempts = n.into();
        }
        if let Some(m) = args.sos_wait_minutes {
            self.escalation.sos_wait_minutes = m.into();
        }
        if let Some(m) = args.authority_wait_minutes {
            self.escalation.authority_wait_minutes = m.into();
        }
    }
}
