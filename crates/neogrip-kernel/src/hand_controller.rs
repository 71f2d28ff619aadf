//! [`HandController`] – turns mental-command events into finger motion.
//!
//! Every event goes through the same gates, in order:
//!
//! 1. **Killswitch** – once tripped, nothing moves any more.
//! 2. **Debounce** – an accepted transition starts a `min_interval` window in
//!    which further events are dropped, so a servo is never reversed faster
//!    than it can physically follow.
//! 3. **Hysteresis** – [`hysteresis::decide`] maps `(act, pow)` to a target.
//! 4. **Idempotence** – a target equal to the current state writes nothing.
//! 5. **Fan-out** – the target is driven on every actuator (or the single
//!    active one) concurrently, and the controller waits for all of them,
//!    brake delays included, before committing the new state.
//!
//! # Example
//!
//! ```
//! use neogrip_hal::{SimDriver, shared};
//! use neogrip_kernel::{HandController, HandControllerConfig, KillSwitch};
//! use neogrip_types::{CommandEvent, MotionState, MotorConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let motors = [("index".to_string(), MotorConfig::new(3, 2000, 3000, 1000))];
//! let mut hand = HandController::new(
//!     HandControllerConfig::default(),
//!     motors,
//!     shared(SimDriver::new(330)),
//!     330,
//!     KillSwitch::new(),
//! )
//! .unwrap();
//!
//! let next = hand.apply_command(&CommandEvent::new("push", 0.8)).await.unwrap();
//! assert_eq!(next, Some(MotionState::Open));
//! # }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::future::join_all;
use neogrip_hal::driver::{self, SharedDriver};
use neogrip_types::{CommandEvent, HandState, MotionState, MotorConfig, NeoError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::hysteresis;
use crate::killswitch::KillSwitch;
use crate::sequencer::MotionSequencer;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Which actuators a transition is sent to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ActuationMode {
    /// Every finger moves together.
    #[default]
    Aggregate,
    /// Only the named actuator moves; the others are never written.
    Single(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandControllerConfig {
    /// Power at or above which `push`/`pull` start a motion.
    pub pow_on: f64,
    /// Power at or below which any action stops the hand.
    pub pow_off: f64,
    /// Minimum time between two accepted transitions.
    pub min_interval: Duration,
    pub mode: ActuationMode,
}

impl Default for HandControllerConfig {
    fn default() -> Self {
        Self {
            pow_on: 0.55,
            pow_off: 0.45,
            min_interval: Duration::from_millis(120),
            mode: ActuationMode::Aggregate,
        }
    }
}

impl HandControllerConfig {
    /// # Errors
    ///
    /// [`NeoError::InvalidConfig`] unless `0 <= pow_off < pow_on <= 1`.
    pub fn validate(&self) -> Result<(), NeoError> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.pow_on) || !in_unit(self.pow_off) {
            return Err(NeoError::InvalidConfig(format!(
                "pow_on ({}) and pow_off ({}) must both be within [0, 1]",
                self.pow_on, self.pow_off
            )));
        }
        if self.pow_on <= self.pow_off {
            return Err(NeoError::InvalidConfig(format!(
                "pow_on ({}) must be greater than pow_off ({})",
                self.pow_on, self.pow_off
            )));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// HandController
// ────────────────────────────────────────────────────────────────────────────

pub struct HandController {
    config: HandControllerConfig,
    sequencers: BTreeMap<String, MotionSequencer>,
    driver: SharedDriver,
    killswitch: KillSwitch,
    state: HandState,
    last_command_time: Option<Instant>,
}

impl HandController {
    /// Build a controller with one [`MotionSequencer`] per named motor, all
    /// writing through `driver`.
    ///
    /// # Errors
    ///
    /// [`NeoError::InvalidConfig`] if the thresholds are invalid, a motor
    /// does not fit the PWM period at `frequency_hz`, no motor is given, or
    /// the single-mode actuator is unknown.
    pub fn new(
        config: HandControllerConfig,
        motors: impl IntoIterator<Item = (String, MotorConfig)>,
        driver: SharedDriver,
        frequency_hz: u16,
        killswitch: KillSwitch,
    ) -> Result<Self, NeoError> {
        config.validate()?;

        let mut sequencers = BTreeMap::new();
        for (name, motor) in motors {
            motor.validate(frequency_hz)?;
            let seq = MotionSequencer::new(name.clone(), motor, driver.clone(), killswitch.clone());
            sequencers.insert(name, seq);
        }
        if sequencers.is_empty() {
            return Err(NeoError::InvalidConfig(
                "at least one motor must be configured".to_string(),
            ));
        }
        if let ActuationMode::Single(name) = &config.mode {
            if !sequencers.contains_key(name) {
                return Err(NeoError::InvalidConfig(format!(
                    "active actuator '{name}' is not a configured motor"
                )));
            }
        }

        info!(
            actuators = sequencers.len(),
            pow_on = config.pow_on,
            pow_off = config.pow_off,
            min_interval_ms = config.min_interval.as_millis() as u64,
            mode = ?config.mode,
            "hand controller ready"
        );

        Ok(Self {
            config,
            sequencers,
            driver,
            killswitch,
            state: MotionState::Stop,
            last_command_time: None,
        })
    }

    /// The last commanded aggregate state.
    pub fn state(&self) -> HandState {
        self.state
    }

    pub fn config(&self) -> &HandControllerConfig {
        &self.config
    }

    pub fn killswitch(&self) -> &KillSwitch {
        &self.killswitch
    }

    pub fn sequencer(&self, name: &str) -> Option<&MotionSequencer> {
        self.sequencers.get(name)
    }

    /// Actuator names in a stable order.
    pub fn actuators(&self) -> impl Iterator<Item = &str> {
        self.sequencers.keys().map(String::as_str)
    }

    /// Translate one event into at most one hand transition.
    ///
    /// Returns the new state when a transition happened and `None` when the
    /// event was dropped or changed nothing.
    ///
    /// # Errors
    ///
    /// The first actuator failure, reported after every actuator finished.
    /// The hand state is not updated in that case.
    pub async fn apply_command(
        &mut self,
        event: &CommandEvent,
    ) -> Result<Option<HandState>, NeoError> {
        if self.killswitch.is_tripped() {
            debug!(act = %event.act, "killswitch tripped, command ignored");
            return Ok(None);
        }

        let now = Instant::now();
        if let Some(last) = self.last_command_time {
            if now.duration_since(last) < self.config.min_interval {
                debug!(act = %event.act, pow = event.pow, "debounced");
                return Ok(None);
            }
        }

        let target = hysteresis::decide(
            self.state,
            &event.act,
            event.pow,
            self.config.pow_on,
            self.config.pow_off,
        );
        if target == self.state {
            return Ok(None);
        }

        self.fan_out(target).await?;

        info!(
            from = %self.state,
            to = %target,
            act = %event.act,
            pow = event.pow,
            "hand transition"
        );
        self.state = target;
        self.last_command_time = Some(now);
        Ok(Some(target))
    }

    /// Stop every actuator, braking those that were opening, and reset the
    /// hand state to `stop`.
    pub async fn stop_all(&mut self) -> Result<(), NeoError> {
        let results = join_all(self.sequencers.values_mut().map(|s| s.stop())).await;
        self.state = MotionState::Stop;
        first_error(results)
    }

    /// Write the hold pulse on every actuator right now, no brake.
    ///
    /// Every actuator is attempted even if an earlier one fails.
    pub fn hard_stop_all(&mut self) -> Result<(), NeoError> {
        let results: Vec<_> = self.sequencers.values_mut().map(|s| s.hard_stop()).collect();
        self.state = MotionState::Stop;
        first_error(results)
    }

    /// Release the underlying driver (all outputs off).
    pub fn release(&self) -> Result<(), NeoError> {
        driver::release(&self.driver)
    }

    async fn fan_out(&mut self, target: MotionState) -> Result<(), NeoError> {
        let results = match &self.config.mode {
            ActuationMode::Aggregate => {
                join_all(self.sequencers.values_mut().map(|s| s.drive(target))).await
            }
            ActuationMode::Single(name) => match self.sequencers.get_mut(name) {
                Some(seq) => vec![seq.drive(target).await],
                None => vec![Err(NeoError::InvalidConfig(format!(
                    "active actuator '{name}' is not a configured motor"
                )))],
            },
        };
        first_error(results)
    }
}

fn first_error(results: Vec<Result<(), NeoError>>) -> Result<(), NeoError> {
    let mut errors = results.into_iter().filter_map(Result::err);
    let first = errors.next();
    for extra in errors {
        warn!(error = %extra, "additional actuator failure");
    }
    first.map_or(Ok(()), Err)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
