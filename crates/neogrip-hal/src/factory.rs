//! Backend selection.

use neogrip_types::NeoError;
use tracing::info;

use crate::driver::{SharedDriver, shared};
use crate::sim::SimDriver;

/// Factory-default I2C address of a PCA9685 with no address jumpers set.
pub const DEFAULT_PCA9685_ADDRESS: u8 = 0x40;

/// Which servo driver backs the hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverKind {
    /// In-memory driver; no hardware required.
    Simulated,
    /// PCA9685 on a Linux I2C character device such as `/dev/i2c-1`.
    Pca9685 { bus: String, address: u8 },
}

impl Default for DriverKind {
    fn default() -> Self {
        DriverKind::Pca9685 {
            bus: "/dev/i2c-1".to_string(),
            address: DEFAULT_PCA9685_ADDRESS,
        }
    }
}

/// Construct the driver for `kind` running its outputs at `frequency_hz`.
///
/// # Errors
///
/// Returns [`NeoError::HardwareFault`] when the device cannot be opened or
/// initialised, or when the binary was built without the `linux-i2c`
/// feature and a PCA9685 is requested.
pub fn make_driver(kind: &DriverKind, frequency_hz: u16) -> Result<SharedDriver, NeoError> {
    match kind {
        DriverKind::Simulated => {
            info!(frequency_hz, "using simulated servo driver");
            Ok(shared(SimDriver::new(frequency_hz)))
        }
        DriverKind::Pca9685 { bus, address } => open_pca9685(bus, *address, frequency_hz),
    }
}

#[cfg(feature = "linux-i2c")]
fn open_pca9685(bus: &str, address: u8, frequency_hz: u16) -> Result<SharedDriver, NeoError> {
    use linux_embedded_hal::I2cdev;

    let dev = I2cdev::new(bus).map_err(|e| NeoError::HardwareFault {
        component: bus.to_string(),
        details: e.to_string(),
    })?;
    let pca = crate::pca9685::Pca9685::new(dev, address, frequency_hz)?;
    Ok(shared(pca))
}

#[cfg(not(feature = "linux-i2c"))]
fn open_pca9685(bus: &str, address: u8, _frequency_hz: u16) -> Result<SharedDriver, NeoError> {
    Err(NeoError::HardwareFault {
        component: format!("pca9685@{address:#04x}"),
        details: format!(
            "cannot open {bus}: built without the `linux-i2c` feature (use --sim or rebuild)"
        ),
    })
}
