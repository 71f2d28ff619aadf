//! PCA9685 16-channel, 12-bit PWM controller.
//!
//! The driver is generic over any [`embedded_hal::i2c::I2c`] bus so the same
//! code runs on a Raspberry Pi (through `linux-embedded-hal`) and against an
//! in-memory bus in tests.
//!
//! Pulse widths are converted to 12-bit "off" tick counts relative to the PWM
//! period: at 330 Hz one period is ~3030 µs, so a 2000 µs hold pulse becomes
//! `round(2000 / 3030.3 * 4096) = 2703` ticks.

use std::collections::HashMap;
use std::time::Duration;

use embedded_hal::i2c::{Error as _, I2c};
use neogrip_types::{NeoError, PWM_CHANNELS};
use tracing::{debug, info};

const MODE1: u8 = 0x00;
const MODE2: u8 = 0x01;
const LED0_ON_L: u8 = 0x06;
const ALL_LED_OFF_H: u8 = 0xFD;
const PRESCALE: u8 = 0xFE;

const MODE1_RESTART: u8 = 0x80;
const MODE1_AUTO_INCREMENT: u8 = 0x20;
const MODE1_SLEEP: u8 = 0x10;
const MODE1_ALLCALL: u8 = 0x01;
const MODE2_OUTDRV: u8 = 0x04;
const LED_FULL_OFF: u8 = 0x10;

const OSCILLATOR_HZ: f64 = 25_000_000.0;
const TICKS_PER_PERIOD: f64 = 4096.0;
const MAX_TICKS: u16 = 4095;

/// Convert a pulse width to the 12-bit tick count at `frequency_hz`.
///
/// Saturates at the last tick of the period.
pub fn pulse_to_ticks(pulse_us: u16, frequency_hz: u16) -> u16 {
    let period_us = 1_000_000.0 / f64::from(frequency_hz.max(1));
    let ticks = (f64::from(pulse_us) / period_us * TICKS_PER_PERIOD).round();
    (ticks as u16).min(MAX_TICKS)
}

/// Prescaler register value for the requested output frequency.
///
/// The chip accepts values in `3..=255` (roughly 1526 Hz down to 24 Hz).
pub fn prescale_for(frequency_hz: u16) -> u8 {
    let raw = (OSCILLATOR_HZ / (TICKS_PER_PERIOD * f64::from(frequency_hz.max(1)))).round() - 1.0;
    raw.clamp(3.0, 255.0) as u8
}

/// Register-level PCA9685 driver.
pub struct Pca9685<I2C> {
    i2c: I2C,
    address: u8,
    frequency_hz: u16,
    id: String,
    last: HashMap<u8, u16>,
}

impl<I2C: I2c> Pca9685<I2C> {
    /// Reset the chip, program the prescaler for `frequency_hz`, and enable
    /// register auto-increment.
    ///
    /// # Errors
    ///
    /// Returns [`NeoError::HardwareFault`] if any I2C transfer fails.
    pub fn new(i2c: I2C, address: u8, frequency_hz: u16) -> Result<Self, NeoError> {
        let mut pca = Self {
            i2c,
            address,
            frequency_hz,
            id: format!("pca9685@{address:#04x}"),
            last: HashMap::new(),
        };
        pca.write_register(MODE2, MODE2_OUTDRV)?;
        pca.write_register(MODE1, MODE1_AUTO_INCREMENT | MODE1_ALLCALL)?;

        // The prescaler can only be written while the oscillator sleeps.
        let prescale = prescale_for(frequency_hz);
        pca.write_register(MODE1, MODE1_AUTO_INCREMENT | MODE1_SLEEP)?;
        pca.write_register(PRESCALE, prescale)?;
        pca.write_register(MODE1, MODE1_AUTO_INCREMENT | MODE1_ALLCALL)?;
        std::thread::sleep(Duration::from_micros(500));
        pca.write_register(MODE1, MODE1_AUTO_INCREMENT | MODE1_ALLCALL | MODE1_RESTART)?;

        info!(driver = %pca.id, frequency_hz, prescale, "PCA9685 initialised");
        Ok(pca)
    }

    /// Give the bus back, e.g. to inspect a mock in tests.
    pub fn into_inner(self) -> I2C {
        self.i2c
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), NeoError> {
        self.write_bytes(&[register, value])
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), NeoError> {
        let address = self.address;
        self.i2c
            .write(address, bytes)
            .map_err(|e| NeoError::HardwareFault {
                component: self.id.clone(),
                details: format!("i2c write to register {:#04x}: {:?}", bytes[0], e.kind()),
            })
    }
}

impl<I2C: I2c + Send> crate::driver::PulseDriver for Pca9685<I2C> {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_pulse_width(&mut self, channel: u8, pulse_us: u16) -> Result<(), NeoError> {
        if channel >= PWM_CHANNELS {
            return Err(NeoError::HardwareFault {
                component: self.id.clone(),
                details: format!("channel {channel} does not exist"),
            });
        }
        let off = pulse_to_ticks(pulse_us, self.frequency_hz);
        let register = LED0_ON_L + 4 * channel;
        let [off_l, off_h] = off.to_le_bytes();
        self.write_bytes(&[register, 0x00, 0x00, off_l, off_h])?;
        debug!(driver = %self.id, channel, pulse_us, ticks = off, "pulse");
        self.last.insert(channel, pulse_us);
        Ok(())
    }

    fn last_pulse(&self, channel: u8) -> Option<u16> {
        self.last.get(&channel).copied()
    }

    fn release(&mut self) -> Result<(), NeoError> {
        self.write_register(ALL_LED_OFF_H, LED_FULL_OFF)?;
        self.write_register(MODE1, MODE1_SLEEP)?;
        self.last.clear();
        info!(driver = %self.id, "PCA9685 released");
        Ok(())
    }
}
