//! `neogrip-hal` – Servo output layer
//!
//! Everything above this crate speaks in pulse widths (microseconds) on a
//! numbered PWM channel. How that pulse reaches a servo is the driver's
//! business.
//!
//! # Modules
//!
//! - [`driver`] – the [`PulseDriver`] trait and the [`SharedDriver`] handle
//!   every motion sequencer writes through.
//! - [`sim`] – [`SimDriver`][sim::SimDriver]: records writes instead of
//!   touching hardware, with a [`PulseJournal`][sim::PulseJournal] tests can
//!   inspect.
//! - [`pca9685`] – [`Pca9685`][pca9685::Pca9685]: register-level driver for
//!   the PCA9685 16-channel PWM controller over any `embedded-hal` I2C bus.
//! - [`factory`] – [`make_driver`][factory::make_driver]: picks the backend
//!   from a runtime flag.

pub mod driver;
pub mod factory;
pub mod pca9685;
pub mod sim;

pub use driver::{PulseDriver, SharedDriver, shared};
pub use factory::{DEFAULT_PCA9685_ADDRESS, DriverKind, make_driver};
pub use pca9685::Pca9685;
pub use sim::{PulseJournal, PulseWrite, SimDriver};
