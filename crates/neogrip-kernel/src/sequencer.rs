//! [`MotionSequencer`] – motion state and brake timing of one servo.
//!
//! Continuous-rotation servos keep turning while they receive an `open` or
//! `close` pulse and hold while they receive the `stop` pulse. When a finger
//! stops after opening, its momentum carries it past the target; a short
//! counter-pulse (`brake_us` for `brake_time_s`) before the hold pulse absorbs
//! that. Stopping from `close` or from `stop` writes the hold pulse directly.
//!
//! The brake delay is the only place a sequencer suspends, and it ends early
//! when the [`KillSwitch`] trips.

use neogrip_hal::driver::{self, SharedDriver};
use neogrip_types::{MotionState, MotorConfig, NeoError};
use tracing::{debug, warn};

use crate::killswitch::KillSwitch;

pub struct MotionSequencer {
    name: String,
    config: MotorConfig,
    driver: SharedDriver,
    killswitch: KillSwitch,
    state: MotionState,
}

impl MotionSequencer {
    /// Create a sequencer in the [`MotionState::Stop`] state. No pulse is
    /// written until the first command.
    pub fn new(
        name: impl Into<String>,
        config: MotorConfig,
        driver: SharedDriver,
        killswitch: KillSwitch,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            driver,
            killswitch,
            state: MotionState::Stop,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MotorConfig {
        &self.config
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    /// Start turning in the opening direction.
    pub fn open(&mut self) -> Result<(), NeoError> {
        self.write(self.config.open_us)?;
        self.state = MotionState::Open;
        Ok(())
    }

    /// Start turning in the closing direction.
    pub fn close(&mut self) -> Result<(), NeoError> {
        self.write(self.config.close_us)?;
        self.state = MotionState::Close;
        Ok(())
    }

    /// Stop, braking first when coming from [`MotionState::Open`].
    ///
    /// # Errors
    ///
    /// Propagates driver failures. The state is left unchanged if the hold
    /// pulse could not be written.
    pub async fn stop(&mut self) -> Result<(), NeoError> {
        let brake = self.config.brake_on_stop_from_open
            && self.state == MotionState::Open
            && !self.killswitch.is_tripped();

        if brake {
            let duration = self.config.brake_duration();
            debug!(
                actuator = %self.name,
                brake_us = self.config.brake_us,
                ?duration,
                "brake"
            );
            self.write(self.config.brake_us)?;
            tokio::select! {
                biased;
                _ = self.killswitch.tripped() => {
                    warn!(actuator = %self.name, "brake cut short by killswitch");
                }
                _ = tokio::time::sleep(duration) => {}
            }
        }

        self.write(self.config.stop_us)?;
        self.state = MotionState::Stop;
        Ok(())
    }

    /// Write the hold pulse immediately, without braking.
    pub fn hard_stop(&mut self) -> Result<(), NeoError> {
        self.write(self.config.stop_us)?;
        self.state = MotionState::Stop;
        Ok(())
    }

    /// Move to `target` using [`open`], [`close`] or [`stop`].
    ///
    /// [`open`]: MotionSequencer::open
    /// [`close`]: MotionSequencer::close
    /// [`stop`]: MotionSequencer::stop
    pub async fn drive(&mut self, target: MotionState) -> Result<(), NeoError> {
        match target {
            MotionState::Open => self.open(),
            MotionState::Close => self.close(),
            MotionState::Stop => self.stop().await,
        }
    }

    fn write(&self, pulse_us: u16) -> Result<(), NeoError> {
        driver::write_pulse(&self.driver, self.config.channel, pulse_us).map_err(|e| match e {
            NeoError::HardwareFault { component, details } => NeoError::HardwareFault {
                component: format!("{component}/{}", self.name),
                details,
            },
            other => other,
        })
    }
}

impl std::fmt::Debug for MotionSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionSequencer")
            .field("name", &self.name)
            .field("channel", &self.config.channel)
            .field("state", &self.state)
            .finish()
    }
}
