//! Generic `PulseDriver` trait for PWM servo outputs.
//!
//! Drivers implement this trait and are handed to the motion sequencers as a
//! [`SharedDriver`]. The rest of the system only ever talks to the trait, so
//! the simulated and the real backend can be swapped without touching the
//! command translation logic.

use std::sync::{Arc, Mutex};

use neogrip_types::NeoError;

/// A multi-channel PWM output that drives continuous-rotation servos.
pub trait PulseDriver: Send {
    /// Stable identifier used in fault reports, e.g. `"pca9685@0x40"`.
    fn id(&self) -> &str;

    /// Emit a pulse of `pulse_us` microseconds on `channel` every PWM period
    /// until told otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`NeoError::HardwareFault`] if the command cannot be applied.
    fn set_pulse_width(&mut self, channel: u8, pulse_us: u16) -> Result<(), NeoError>;

    /// The last pulse width written to `channel`, if any.
    fn last_pulse(&self, channel: u8) -> Option<u16>;

    /// Stop all outputs and release the device.
    ///
    /// # Errors
    ///
    /// Returns [`NeoError::HardwareFault`] if the device rejects the command.
    fn release(&mut self) -> Result<(), NeoError>;
}

/// One driver shared by every sequencer of the hand.
///
/// The lock is only ever held for the duration of a single register write and
/// never across an `.await`.
pub type SharedDriver = Arc<Mutex<Box<dyn PulseDriver>>>;

/// Wrap a driver into a [`SharedDriver`].
pub fn shared(driver: impl PulseDriver + 'static) -> SharedDriver {
    Arc::new(Mutex::new(Box::new(driver)))
}

/// Write one pulse through a [`SharedDriver`].
///
/// # Errors
///
/// Propagates the driver's error, or returns [`NeoError::HardwareFault`] if
/// a previous writer panicked while holding the lock.
pub fn write_pulse(driver: &SharedDriver, channel: u8, pulse_us: u16) -> Result<(), NeoError> {
    let mut guard = driver.lock().map_err(|_| poisoned())?;
    guard.set_pulse_width(channel, pulse_us)
}

/// Release the device behind a [`SharedDriver`].
///
/// # Errors
///
/// Same as [`write_pulse`].
pub fn release(driver: &SharedDriver) -> Result<(), NeoError> {
    let mut guard = driver.lock().map_err(|_| poisoned())?;
    guard.release()
}

fn poisoned() -> NeoError {
    NeoError::HardwareFault {
        component: "driver".to_string(),
        details: "driver lock poisoned".to_string(),
    }
}
