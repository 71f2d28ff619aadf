use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Act name the relay protocol reserves for the emergency stop record.
pub const KILLSWITCH_ACT: &str = "KILLSWITCH";

/// Number of PWM channels on a single PCA9685 board.
pub const PWM_CHANNELS: u8 = 16;

/// Motion of a single actuator, or the aggregate target of the whole hand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionState {
    /// Holding pulse; the servo does not turn.
    #[default]
    Stop,
    /// Turning in the direction that opens the finger.
    Open,
    /// Turning in the direction that closes the finger.
    Close,
}

/// The last aggregate state commanded to the hand.
///
/// Same value space as [`MotionState`]; a separate name keeps signatures
/// explicit about whether they talk about one actuator or the whole hand.
pub type HandState = MotionState;

impl fmt::Display for MotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionState::Stop => write!(f, "stop"),
            MotionState::Open => write!(f, "open"),
            MotionState::Close => write!(f, "close"),
        }
    }
}

/// One mental-command sample: the detected action and its power.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEvent {
    /// Action name as reported upstream, e.g. `"push"`, `"pull"`, `"neutral"`.
    pub act: String,
    /// Detection power in `[0, 1]`.
    pub pow: f64,
    pub timestamp: DateTime<Utc>,
}

impl CommandEvent {
    /// Build an event stamped with the current wall-clock time.
    pub fn new(act: impl Into<String>, pow: f64) -> Self {
        Self::at(act, pow, Utc::now())
    }

    pub fn at(act: impl Into<String>, pow: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            act: act.into(),
            pow,
            timestamp,
        }
    }
}

/// A decoded relay record.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// A forwarded mental command.
    Command(CommandEvent),
    /// Operator abort: hard-stop every actuator and end the session.
    Killswitch,
}

fn default_brake_on_stop_from_open() -> bool {
    true
}
fn default_brake_us() -> u16 {
    1000
}
fn default_brake_time_s() -> f64 {
    0.10
}

/// Static configuration of one servo channel.
///
/// Pulse widths are in microseconds. The brake pulse is a short counter-pulse
/// written before the hold pulse when the servo stops after opening, which
/// absorbs the momentum that otherwise makes the finger overshoot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub channel: u8,
    pub stop_us: u16,
    pub open_us: u16,
    pub close_us: u16,
    #[serde(default = "default_brake_on_stop_from_open")]
    pub brake_on_stop_from_open: bool,
    #[serde(default = "default_brake_us")]
    pub brake_us: u16,
    #[serde(default = "default_brake_time_s")]
    pub brake_time_s: f64,
}

impl MotorConfig {
    /// Motor with the default brake sequence (1000 µs for 100 ms).
    pub fn new(channel: u8, stop_us: u16, open_us: u16, close_us: u16) -> Self {
        Self {
            channel,
            stop_us,
            open_us,
            close_us,
            brake_on_stop_from_open: default_brake_on_stop_from_open(),
            brake_us: default_brake_us(),
            brake_time_s: default_brake_time_s(),
        }
    }

    /// Builder-style override of the brake sequence.
    pub fn with_brake(mut self, enabled: bool, brake_us: u16, brake_time_s: f64) -> Self {
        self.brake_on_stop_from_open = enabled;
        self.brake_us = brake_us;
        self.brake_time_s = brake_time_s;
        self
    }

    /// Brake duration as a [`Duration`]. Only meaningful after [`validate`].
    ///
    /// [`validate`]: MotorConfig::validate
    pub fn brake_duration(&self) -> Duration {
        Duration::from_secs_f64(self.brake_time_s.max(0.0))
    }

    /// Check the channel, pulse widths and brake time against a PWM signal
    /// of `frequency_hz`.
    ///
    /// # Errors
    ///
    /// Returns [`NeoError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self, frequency_hz: u16) -> Result<(), NeoError> {
        if frequency_hz == 0 {
            return Err(NeoError::InvalidConfig(
                "PWM frequency must be greater than 0 Hz".to_string(),
            ));
        }
        if self.channel >= PWM_CHANNELS {
            return Err(NeoError::InvalidConfig(format!(
                "channel {} out of range (0..{PWM_CHANNELS})",
                self.channel
            )));
        }
        let period_us = 1_000_000 / u32::from(frequency_hz);
        let pulses = [
            ("stop_us", self.stop_us),
            ("open_us", self.open_us),
            ("close_us", self.close_us),
            ("brake_us", self.brake_us),
        ];
        for (field, us) in pulses {
            if us == 0 || u32::from(us) >= period_us {
                return Err(NeoError::InvalidConfig(format!(
                    "{field} = {us}µs on channel {} must be within (0, {period_us})µs at {frequency_hz}Hz",
                    self.channel
                )));
            }
        }
        if !self.brake_time_s.is_finite() || self.brake_time_s < 0.0 {
            return Err(NeoError::InvalidConfig(format!(
                "brake_time_s = {} on channel {} must be a finite value >= 0",
                self.brake_time_s, self.channel
            )));
        }
        Ok(())
    }
}

/// Workspace-wide error type spanning the upstream protocol, the relay link,
/// configuration and hardware.
#[derive(Error, Debug)]
pub enum NeoError {
    /// The upstream service answered a request with an error payload.
    #[error("Protocol error in {method}: {payload}")]
    Protocol { method: String, payload: String },

    /// `requestAccess` succeeded but the user has not granted access yet.
    #[error("Access not granted: approve this application in the Emotiv launcher")]
    AccessDenied,

    /// A session step was invoked before its predecessor completed.
    #[error("Invalid session phase: {step} requires {expected}, client is {actual}")]
    InvalidPhase {
        step: &'static str,
        expected: String,
        actual: String,
    },

    #[error("No headset detected")]
    NoHeadset,

    #[error("Headsets detected but none is connected")]
    NoConnectedHeadset,

    /// The requested profile cannot be loaded because another application
    /// owns the active one.
    #[error("Profile '{active}' is loaded by another application")]
    ProfileConflict { active: String },

    /// Transport read/write failure or closed connection.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// A relay line that is not a valid command or killswitch record.
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for NeoError {
    fn from(e: std::io::Error) -> Self {
        NeoError::Connectivity(e.to_string())
    }
}

impl From<serde_json::Error> for NeoError {
    fn from(e: serde_json::Error) -> Self {
        NeoError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&MotionState::Open).unwrap(), "\"open\"");
        let back: MotionState = serde_json::from_str("\"close\"").unwrap();
        assert_eq!(back, MotionState::Close);
        assert_eq!(MotionState::default(), MotionState::Stop);
        assert_eq!(MotionState::Stop.to_string(), "stop");
    }

    #[test]
    fn motor_config_brake_fields_default_when_absent() {
        let json = r#"{"channel":3,"stop_us":2000,"open_us":3000,"close_us":1000}"#;
        let cfg: MotorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg, MotorConfig::new(3, 2000, 3000, 1000));
        assert!(cfg.brake_on_stop_from_open);
        assert_eq!(cfg.brake_us, 1000);
        assert_eq!(cfg.brake_duration(), Duration::from_millis(100));
    }

    #[test]
    fn motor_config_accepts_defaults_at_330hz() {
        MotorConfig::new(15, 2000, 3000, 1000).validate(330).unwrap();
    }

    #[test]
    fn motor_config_rejects_pulse_longer_than_period() {
        // 400 Hz → 2500µs period, so a 3000µs open pulse cannot be produced.
        let err = MotorConfig::new(0, 2000, 3000, 1000).validate(400).unwrap_err();
        assert!(matches!(err, NeoError::InvalidConfig(_)));
        assert!(err.to_string().contains("open_us"));
    }

    #[test]
    fn motor_config_rejects_bad_channel_and_brake_time() {
        let err = MotorConfig::new(16, 2000, 3000, 1000).validate(330).unwrap_err();
        assert!(err.to_string().contains("channel 16"));

        let cfg = MotorConfig::new(1, 2000, 3000, 1000).with_brake(true, 1000, -0.5);
        assert!(matches!(cfg.validate(330), Err(NeoError::InvalidConfig(_))));

        let cfg = MotorConfig::new(1, 2000, 3000, 1000).with_brake(true, 1000, f64::NAN);
        assert!(matches!(cfg.validate(330), Err(NeoError::InvalidConfig(_))));
    }

    #[test]
    fn motor_config_rejects_zero_frequency() {
        assert!(MotorConfig::new(0, 2000, 3000, 1000).validate(0).is_err());
    }

    #[test]
    fn command_event_new_stamps_now() {
        let before = Utc::now();
        let ev = CommandEvent::new("push", 0.6);
        assert_eq!(ev.act, "push");
        assert!(ev.timestamp >= before);
    }

    #[test]
    fn neo_error_display() {
        let err = NeoError::Protocol {
            method: "authorize".to_string(),
            payload: r#"{"code":-32019}"#.to_string(),
        };
        assert!(err.to_string().contains("authorize"));
        assert!(err.to_string().contains("-32019"));

        let err = NeoError::HardwareFault {
            component: "pca9685".to_string(),
            details: "nack".to_string(),
        };
        assert!(err.to_string().contains("pca9685"));
    }

    #[test]
    fn io_error_maps_to_connectivity() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        assert!(matches!(NeoError::from(io), NeoError::Connectivity(_)));

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(NeoError::from(json), NeoError::Serialization(_)));
    }
}
