//! Escalation settings and fixed timing constants
//!
//! `EscalationSettings` hold the three operator-adjustable values exactly as
//! entered. They are validated only when the task that depends on them is
//! about to spawn, so a bad value degrades one step of the escalation instead
//! of rejecting the whole session.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, SettingField};

/// Upper bound for any wait setting (one day).
const MAX_WAIT_MINUTES: f64 = 24.0 * 60.0;

/// A setting as entered by the operator or read from a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Number(f64),
    /// Text that did not parse as a number; kept so validation can report it.
    Text(String),
}

impl SettingValue {
    /// Parse operator-entered text. Never fails: unparseable input is kept
    /// verbatim and rejected later by validation.
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        match trimmed.parse::<f64>() {
            Ok(v) => Self::Number(v),
            Err(_) => Self::Text(trimmed.to_string()),
        }
    }

    fn number(&self, field: SettingField) -> Result<f64, ConfigError> {
        match self {
            Self::Number(v) => Ok(*v),
            Self::Text(raw) => Err(ConfigError::NotANumber {
                field,
                raw: raw.clone(),
            }),
        }
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<u32> for SettingValue {
    fn from(v: u32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl std::fmt::Display for SettingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{:?}", s),
        }
    }
}

/// Operator-adjustable escalation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationSettings {
    /// Number of automatic door-open attempts before falling back to SOS
    pub auto_open_attempts: SettingValue,
    /// Minutes to wait after retries are exhausted before sending SOS
    pub sos_wait_minutes: SettingValue,
    /// Minutes to wait after SOS before notifying the authorities
    pub authority_wait_minutes: SettingValue,
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            auto_open_attempts: SettingValue::Number(3.0),
            sos_wait_minutes: SettingValue::Number(1.0),
            authority_wait_minutes: SettingValue::Number(2.0),
        }
    }
}

impl EscalationSettings {
    /// Build settings from already-numeric values.
    pub fn new(auto_open_attempts: u32, sos_wait_minutes: f64, authority_wait_minutes: f64) -> Self {
        Self {
            auto_open_attempts: auto_open_attempts.into(),
            sos_wait_minutes: sos_wait_minutes.into(),
            authority_wait_minutes: authority_wait_minutes.into(),
        }
    }

    /// Replace one field from operator text.
    pub fn set_from_text(&mut self, field: SettingField, text: &str) {
        let value = SettingValue::from_text(text);
        match field {
            SettingField::AutoOpenAttempts => self.auto_open_attempts = value,
            SettingField::SosWaitMinutes => self.sos_wait_minutes = value,
            SettingField::AuthorityWaitMinutes => self.authority_wait_minutes = value,
        }
    }

    /// Validated number of automatic open attempts.
    pub fn auto_open_attempts(&self) -> Result<u32, ConfigError> {
        let field = SettingField::AutoOpenAttempts;
        let value = self.auto_open_attempts.number(field)?;
        if !value.is_finite() || value < 1.0 || value.fract() != 0.0 {
            return Err(ConfigError::NotPositiveInteger { field, value });
        }
        if value > f64::from(u32::MAX) {
            return Err(ConfigError::OutOfRange { field, value });
        }
        Ok(value as u32)
    }

    /// Validated SOS wait.
    pub fn sos_wait(&self) -> Result<Duration, ConfigError> {
        minutes(SettingField::SosWaitMinutes, &self.sos_wait_minutes)
    }

    /// Validated authority-notify wait.
    pub fn authority_wait(&self) -> Result<Duration, ConfigError> {
        minutes(
            SettingField::AuthorityWaitMinutes,
            &self.authority_wait_minutes,
        )
    }

    /// Validate every field, returning the first failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.auto_open_attempts()?;
        self.sos_wait()?;
        self.authority_wait()?;
        Ok(())
    }
}

fn minutes(field: SettingField, raw: &SettingValue) -> Result<Duration, ConfigError> {
    let value = raw.number(field)?;
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::NotPositiveFinite { field, value });
    }
    if value > MAX_WAIT_MINUTES {
        return Err(ConfigError::OutOfRange { field, value });
    }
    Ok(Duration::from_secs_f64(value * 60.0))
}

/// Fixed durations of the escalation sequence and simulated physical
/// transitions. Serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Pre-alert countdown after detection is armed
    #[serde(with = "duration_ms")]
    pub pre_alert: Duration,
    /// Countdown before each automatic open attempt
    #[serde(with = "duration_ms")]
    pub auto_open_countdown: Duration,
    /// Pause after a failed automatic open attempt
    #[serde(with = "duration_ms")]
    pub retry_cooldown: Duration,
    /// Time for the vehicle to come to rest after `begin_stop`
    #[serde(with = "duration_ms")]
    pub stop_settle: Duration,
    /// Door travel time for open and close
    #[serde(with = "duration_ms")]
    pub door_settle: Duration,
    /// Sensor settle time between door closed and detection armed
    #[serde(with = "duration_ms")]
    pub arm_delay: Duration,
    /// Gap after (re)starting an alert clip before checking it again
    #[serde(with = "duration_ms")]
    pub alert_replay_gap: Duration,
    /// Poll granularity of repeating workers
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Extra wait after each safety-instruction clip
    #[serde(with = "duration_ms")]
    pub safety_pad: Duration,
    /// Pause between the SOS result and the authority/safety fan-out
    #[serde(with = "duration_ms")]
    pub post_sos_pause: Duration,
    /// Countdown tick resolution
    #[serde(with = "duration_ms")]
    pub tick: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            pre_alert: Duration::from_secs(5),
            auto_open_countdown: Duration::from_secs(10),
            retry_cooldown: Duration::from_secs(2),
            stop_settle: Duration::from_secs(2),
            door_settle: Duration::from_secs(2),
            arm_delay: Duration::from_secs(1),
            alert_replay_gap: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            safety_pad: Duration::from_secs(2),
            post_sos_pause: Duration::from_secs(1),
            tick: Duration::from_secs(1),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = EscalationSettings::default();
        assert_eq!(settings.auto_open_attempts().unwrap(), 3);
        assert_eq!(settings.sos_wait().unwrap(), Duration::from_secs(60));
        assert_eq!(settings.authority_wait().unwrap(), Duration::from_secs(120));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_fractional_minutes() {
        let settings = EscalationSettings::new(1, 0.5, 0.25);
        assert_eq!(settings.sos_wait().unwrap(), Duration::from_secs(30));
        assert_eq!(settings.authority_wait().unwrap(), Duration::from_secs(15));
    }

    #[test]
    fn test_attempts_rejects_fraction_and_zero() {
        let mut settings = EscalationSettings::default();
        settings.set_from_text(SettingField::AutoOpenAttempts, "2.5");
        assert!(matches!(
            settings.auto_open_attempts(),
            Err(ConfigError::NotPositiveInteger { .. })
        ));

        settings.set_from_text(SettingField::AutoOpenAttempts, "0");
        assert!(settings.auto_open_attempts().is_err());
    }

    #[test]
    fn test_text_value_kept_for_reporting() {
        let mut settings = EscalationSettings::default();
        settings.set_from_text(SettingField::SosWaitMinutes, " soon ");
        let err = settings.sos_wait().unwrap_err();
        assert_eq!(
            err,
            ConfigError::NotANumber {
                field: SettingField::SosWaitMinutes,
                raw: "soon".into()
            }
        );
        // Other fields are unaffected
        assert!(settings.auto_open_attempts().is_ok());
    }

    #[test]
    fn test_minutes_reject_non_finite_and_negative() {
        for bad in [f64::NAN, f64::INFINITY, -1.0, 0.0] {
            let settings = EscalationSettings::new(3, bad, 1.0);
            assert!(settings.sos_wait().is_err(), "{bad} should be rejected");
        }
        let settings = EscalationSettings::new(3, 1.0, 1e9);
        assert!(matches!(
            settings.authority_wait(),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_settings_from_json_mixed_values() {
        let json = r#"{"auto_open_attempts": 2, "sos_wait_minutes": "later"}"#;
        let settings: EscalationSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.auto_open_attempts().unwrap(), 2);
        assert!(settings.sos_wait().is_err());
        assert_eq!(settings.authority_wait().unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn test_timings_serialize_as_millis() {
        let timings = Timings::default();
        let json = serde_json::to_value(&timings).unwrap();
        assert_eq!(json["pre_alert"], 5000);
        assert_eq!(json["poll_interval"], 100);

        let partial: Timings = serde_json::from_str(r#"{"door_settle": 500}"#).unwrap();
        assert_eq!(partial.door_settle, Duration::from_millis(500));
        assert_eq!(partial.pre_alert, Duration::from_secs(5));
    }
}
