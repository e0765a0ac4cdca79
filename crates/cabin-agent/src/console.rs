//! Operator console
//!
//! Turns typed lines (or a scripted scenario) into orchestrator commands.
//! Rejected actions are reported by the core itself; the console only stops
//! when the orchestrator is gone or the operator quits.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use cabin_coordination::{CoordinationError, OrchestratorHandle, SettingField};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info};

use crate::feed::SimulatedFeed;

pub const HELP: &str = "commands: engine | move | stop | open | close | lock | alarm-off | \
count <n> | set <attempts|sos|authority> <value> | status | help | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// Toggle the engine
    Engine,
    Move,
    Stop,
    Open,
    Close,
    Lock,
    AlarmOff,
    /// Set the simulated occupant count
    Count(u32),
    Set(SettingField, String),
    Status,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let verb = words
            .next()
            .ok_or_else(|| anyhow!("empty command"))?
            .to_ascii_lowercase();
        let command = match verb.as_str() {
            "engine" => Self::Engine,
            "move" => Self::Move,
            "stop" => Self::Stop,
            "open" => Self::Open,
            "close" => Self::Close,
            "lock" => Self::Lock,
            "alarm-off" | "alarm_off" => Self::AlarmOff,
            "count" => {
                let n = words.next().ok_or_else(|| anyhow!("usage: count <n>"))?;
                Self::Count(n.parse().with_context(|| format!("invalid count '{n}'"))?)
            }
            "set" => {
                let field = match words.next() {
                    Some("attempts") => SettingField::AutoOpenAttempts,
                    Some("sos") => SettingField::SosWaitMinutes,
                    Some("authority") => SettingField::AuthorityWaitMinutes,
                    _ => bail!("usage: set <attempts|sos|authority> <value>"),
                };
                let value = words.by_ref().collect::<Vec<_>>().join(" ");
                if value.is_empty() {
                    bail!("usage: set <attempts|sos|authority> <value>");
                }
                // Validation happens when the setting is used
                Self::Set(field, value)
            }
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command '{other}'"),
        };
        if !matches!(command, Self::Set(..)) && words.next().is_some() {
            bail!("unexpected arguments after '{verb}'");
        }
        Ok(command)
    }
}

/// Whether the console keeps reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// One scripted step: wait `after_ms` after the previous step, then run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioStep {
    #[serde(default)]
    pub after_ms: u64,
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub steps: Vec<ScenarioStep>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid scenario {}", path.display()))
    }

    /// Parse and check every command up front.
    pub fn parse(text: &str) -> Result<Self> {
        let scenario: Self = toml::from_str(text)?;
        for (i, step) in scenario.steps.iter().enumerate() {
            step.command
                .parse::<ConsoleCommand>()
                .with_context(|| format!("step {}", i + 1))?;
        }
        Ok(scenario)
    }
}

pub struct Console {
    handle: OrchestratorHandle,
    feed: SimulatedFeed,
}

impl Console {
    pub fn new(handle: OrchestratorHandle, feed: SimulatedFeed) -> Self {
        Self { handle, feed }
    }

    pub async fn execute(&self, command: ConsoleCommand) -> Result<Flow> {
        debug!(?command, "Console command");
        let result = match command {
            ConsoleCommand::Engine => {
                if self.handle.vehicle().engine_on {
                    self.handle.stop_engine().await
                } else {
                    self.handle.start_engine().await
                }
            }
            ConsoleCommand::Move => self.handle.begin_move().await,
            ConsoleCommand::Stop => self.handle.begin_stop().await,
            ConsoleCommand::Open => self.handle.open_door().await,
            ConsoleCommand::Close => self.handle.close_door().await,
            ConsoleCommand::Lock => self.handle.toggle_lock().await,
            ConsoleCommand::AlarmOff => self.handle.alarm_off().await,
            ConsoleCommand::Count(n) => {
                self.feed.set_count(n);
                info!(count = n, "Simulated occupant count set");
                Ok(())
            }
            ConsoleCommand::Set(field, value) => self.handle.update_setting(field, &value).await,
            ConsoleCommand::Status => {
                println!("{}", self.status()?);
                Ok(())
            }
            ConsoleCommand::Help => {
                println!("{HELP}");
                Ok(())
            }
            ConsoleCommand::Quit => return Ok(Flow::Quit),
        };
        match result {
            Ok(()) => Ok(Flow::Continue),
            // Already reported by the orchestrator
            Err(CoordinationError::Precondition(_)) => Ok(Flow::Continue),
            Err(e) => Err(e).context("orchestrator unavailable"),
        }
    }

    /// JSON snapshot of vehicle, phase, session and running tasks.
    pub fn status(&self) -> Result<String> {
        let status = serde_json::json!({
            "vehicle": self.handle.vehicle(),
            "phase": self.handle.phase(),
            "session": self.handle.session(),
            "tasks": self.handle.active_tasks(),
            "occupants": self.handle.latest_count(),
        });
        serde_json::to_string_pretty(&status).context("rendering status")
    }

    /// Read commands line by line until `quit` or end of input.
    pub async fn run_lines<R>(&self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.context("reading console input")? {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.parse::<ConsoleCommand>() {
                Ok(command) => {
                    if self.execute(command).await? == Flow::Quit {
                        break;
                    }
                }
                Err(e) => println!("{e}. {HELP}"),
            }
        }
        Ok(())
    }

    pub async fn run_interactive(&self) -> Result<()> {
        println!("{HELP}");
        self.run_lines(tokio::io::BufReader::new(tokio::io::stdin()))
            .await
    }

    pub async fn run_scenario(&self, scenario: &Scenario) -> Result<()> {
        info!(steps = scenario.steps.len(), "Replaying scenario");
        for step in &scenario.steps {
            tokio::time::sleep(Duration::from_millis(step.after_ms)).await;
            let command = step.command.parse::<ConsoleCommand>()?;
            info!(command = %step.command, "Scenario step");
            if self.execute(command).await? == Flow::Quit {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("engine".parse::<ConsoleCommand>().unwrap(), ConsoleCommand::Engine);
        assert_eq!(
            "  Alarm-Off ".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::AlarmOff
        );
        assert_eq!(
            "count 2".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Count(2)
        );
        assert_eq!(
            "set sos 0.5".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Set(SettingField::SosWaitMinutes, "0.5".into())
        );
        // Bad values still parse; the orchestrator rejects them when used
        assert_eq!(
            "set attempts three".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Set(SettingField::AutoOpenAttempts, "three".into())
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<ConsoleCommand>().is_err());
        assert!("fly".parse::<ConsoleCommand>().is_err());
        assert!("count".parse::<ConsoleCommand>().is_err());
        assert!("count -1".parse::<ConsoleCommand>().is_err());
        assert!("set speed 3".parse::<ConsoleCommand>().is_err());
        assert!("set sos".parse::<ConsoleCommand>().is_err());
        assert!("open now".parse::<ConsoleCommand>().is_err());
    }

    #[test]
    fn test_scenario_parse() {
        let scenario = Scenario::parse(
            r#"
[[steps]]
command = "engine"

[[steps]]
after_ms = 1500
command = "move"
"#,
        )
        .unwrap();
        assert_eq!(scenario.steps.len(), 2);
        assert_eq!(scenario.steps[0].after_ms, 0);
        assert_eq!(scenario.steps[1].after_ms, 1500);

        let err = Scenario::parse("[[steps]]\ncommand = \"jump\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("step 1"));
    }
}
