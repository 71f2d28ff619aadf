//! Configuration file – reads/writes `~/.neogrip/config.toml`.
//!
//! Every field has a default, so a missing file or a partial file still
//! yields the stock five-finger hand. Deployment settings can be overridden
//! from the environment:
//!
//! | Variable | Config field |
//! |---|---|
//! | `CORTEX_URL` | `cortex.url` |
//! | `EMOTIV_CLIENT_ID` | `cortex.client_id` |
//! | `EMOTIV_CLIENT_SECRET` | `cortex.client_secret` |
//! | `EMOTIV_DEBIT` | `cortex.debit` |
//! | `EMOTIV_PROFILE` | `cortex.profile` |
//! | `EMOTIV_LOAD_PROFILE` | `cortex.load_profile` (`1`/`0`) |
//! | `EMOTIV_POW_ON` | `hand.pow_on` |
//! | `EMOTIV_POW_OFF` | `hand.pow_off` |
//! | `MIN_CMD_INTERVAL` | `hand.min_interval_s` |
//! | `PCA_FREQUENCY_HZ` | `hardware.frequency_hz` |
//! | `NEOGRIP_DEV=1` | `hardware.backend = "sim"` |
//! | `NEOGRIP_HOST` | `relay.host` |
//! | `NEOGRIP_PORT` | `relay.port` |

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use neogrip_hal::DriverKind;
use neogrip_kernel::{ActuationMode, HandControllerConfig};
use neogrip_runtime::SessionConfig;
use neogrip_types::{MotorConfig, NeoError};
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroizing;

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// `[cortex]` – the Emotiv Cortex service and the application credentials.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CortexSection {
    pub url: String,
    pub client_id: String,
    /// Wiped from memory when the section is dropped.
    #[serde(skip_serializing_if = "is_unset")]
    pub client_secret: Zeroizing<String>,
    pub debit: u32,
    pub profile: Option<String>,
    pub load_profile: bool,
    pub connect_headset: bool,
    /// Accept the self-signed certificate of a local Cortex.
    pub insecure_tls: bool,
}

impl Default for CortexSection {
    fn default() -> Self {
        Self {
            url: "wss://localhost:6868".to_string(),
            client_id: String::new(),
            client_secret: Zeroizing::default(),
            debit: 10,
            profile: None,
            load_profile: false,
            connect_headset: false,
            insecure_tls: true,
        }
    }
}

fn is_unset(secret: &Zeroizing<String>) -> bool {
    secret.is_empty()
}

/// `[hand]` – command translation thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandSection {
    pub pow_on: f64,
    pub pow_off: f64,
    pub min_interval_s: f64,
    /// Drive only this motor instead of the whole hand.
    pub active_actuator: Option<String>,
}

impl Default for HandSection {
    fn default() -> Self {
        let defaults = HandControllerConfig::default();
        Self {
            pow_on: defaults.pow_on,
            pow_off: defaults.pow_off,
            min_interval_s: defaults.min_interval.as_secs_f64(),
            active_actuator: None,
        }
    }
}

/// Servo output backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Sim,
    #[default]
    Pca9685,
}

/// `[hardware]` – the PWM driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareSection {
    pub backend: Backend,
    pub frequency_hz: u16,
    pub i2c_bus: String,
    pub i2c_address: u8,
}

impl Default for HardwareSection {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            frequency_hz: 330,
            i2c_bus: "/dev/i2c-1".to_string(),
            i2c_address: neogrip_hal::DEFAULT_PCA9685_ADDRESS,
        }
    }
}

/// `[relay]` – the signal host → actuator host link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    /// Actuator host the relay client connects to.
    pub host: String,
    pub port: u16,
    /// Interface the relay server listens on.
    pub bind: String,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            host: "192.168.1.50".to_string(),
            port: 8764,
            bind: "0.0.0.0".to_string(),
        }
    }
}

/// The five fingers of the stock hand, each a continuous-rotation servo.
fn default_motors() -> BTreeMap<String, MotorConfig> {
    [("thumb", 0), ("index", 3), ("middle", 7), ("ring", 11), ("pinky", 15)]
        .into_iter()
        .map(|(name, channel)| (name.to_string(), MotorConfig::new(channel, 2000, 3000, 1000)))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

/// Persisted configuration stored in `~/.neogrip/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cortex: CortexSection,
    pub hand: HandSection,
    pub hardware: HardwareSection,
    pub motors: BTreeMap<String, MotorConfig>,
    pub relay: RelaySection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cortex: CortexSection::default(),
            hand: HandSection::default(),
            hardware: HardwareSection::default(),
            motors: default_motors(),
            relay: RelaySection::default(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = &self.cortex;
        f.debug_struct("Config")
            .field("cortex.url", &c.url)
            .field("cortex.client_id", &c.client_id)
            .field(
                "cortex.client_secret",
                if c.client_secret.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("cortex.profile", &c.profile)
            .field("hand", &self.hand)
            .field("hardware", &self.hardware)
            .field("motors", &self.motors)
            .field("relay", &self.relay)
            .finish()
    }
}

impl Config {
    /// Session parameters for the Cortex client.
    pub fn session_config(&self) -> SessionConfig {
        let c = &self.cortex;
        SessionConfig {
            client_id: c.client_id.clone(),
            client_secret: c.client_secret.clone(),
            debit: c.debit,
            profile: c.profile.clone().filter(|p| !p.is_empty()),
            load_profile: c.load_profile,
            connect_headset: c.connect_headset,
            ..SessionConfig::default()
        }
    }

    /// Hand controller settings.
    ///
    /// # Errors
    ///
    /// [`NeoError::InvalidConfig`] for a negative or non-finite interval or
    /// thresholds the controller rejects.
    pub fn hand_config(&self) -> Result<HandControllerConfig, NeoError> {
        let h = &self.hand;
        if !h.min_interval_s.is_finite() || h.min_interval_s < 0.0 {
            return Err(NeoError::InvalidConfig(format!(
                "hand.min_interval_s = {} must be a finite value >= 0",
                h.min_interval_s
            )));
        }
        let config = HandControllerConfig {
            pow_on: h.pow_on,
            pow_off: h.pow_off,
            min_interval: Duration::from_nanos((h.min_interval_s * 1e9).round() as u64),
            mode: match &h.active_actuator {
                Some(name) if !name.is_empty() => ActuationMode::Single(name.clone()),
                _ => ActuationMode::Aggregate,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn driver_kind(&self) -> DriverKind {
        match self.hardware.backend {
            Backend::Sim => DriverKind::Simulated,
            Backend::Pca9685 => DriverKind::Pca9685 {
                bus: self.hardware.i2c_bus.clone(),
                address: self.hardware.i2c_address,
            },
        }
    }

    pub fn motors(&self) -> impl Iterator<Item = (String, MotorConfig)> + '_ {
        self.motors.iter().map(|(name, m)| (name.clone(), m.clone()))
    }

    /// `host:port` of the actuator host.
    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay.host, self.relay.port)
    }

    /// `bind:port` the relay server listens on.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.relay.bind, self.relay.port)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Files
// ─────────────────────────────────────────────────────────────────────────────

/// Return the path to `~/.neogrip/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".neogrip").join("config.toml")
}

/// Load the config from `path`. Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Load `path` (defaults when it is missing) and apply environment
/// overrides. The flag tells whether the file existed.
pub fn load_or_default(path: &Path) -> Result<(Config, bool), String> {
    let loaded = load_from(path)?;
    let found = loaded.is_some();
    let mut cfg = loaded.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok((cfg, found))
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

/// Apply overrides from `lookup`. Unparsable values are logged and ignored.
pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("CORTEX_URL") {
        cfg.cortex.url = v;
    }
    if let Some(v) = lookup("EMOTIV_CLIENT_ID") {
        cfg.cortex.client_id = v;
    }
    if let Some(v) = lookup("EMOTIV_CLIENT_SECRET") {
        cfg.cortex.client_secret = Zeroizing::new(v);
    }
    parse_into(&lookup, "EMOTIV_DEBIT", &mut cfg.cortex.debit);
    if let Some(v) = lookup("EMOTIV_PROFILE") {
        cfg.cortex.profile = Some(v).filter(|p| !p.is_empty());
    }
    if let Some(v) = lookup("EMOTIV_LOAD_PROFILE") {
        cfg.cortex.load_profile = is_truthy(&v);
    }
    parse_into(&lookup, "EMOTIV_POW_ON", &mut cfg.hand.pow_on);
    parse_into(&lookup, "EMOTIV_POW_OFF", &mut cfg.hand.pow_off);
    parse_into(&lookup, "MIN_CMD_INTERVAL", &mut cfg.hand.min_interval_s);
    parse_into(&lookup, "PCA_FREQUENCY_HZ", &mut cfg.hardware.frequency_hz);
    if lookup("NEOGRIP_DEV").is_some_and(|v| is_truthy(&v)) {
        cfg.hardware.backend = Backend::Sim;
    }
    if let Some(v) = lookup("NEOGRIP_HOST") {
        cfg.relay.host = v;
    }
    parse_into(&lookup, "NEOGRIP_PORT", &mut cfg.relay.port);
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) {
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => warn!(variable = name, value = %raw, "ignoring unparsable override"),
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Save the config to `path`, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Restrict the config directory to the owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = Zeroizing::new(
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?,
    );
    // The file may hold the client secret: owner-only read/write on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw.as_bytes())
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
