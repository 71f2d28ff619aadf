//! `neogrip-kernel` – Command translation & motion safety
//!
//! The part of NeoGrip that decides when a finger may move. It knows nothing
//! about where commands come from (a local Cortex session or the relay link);
//! it only sees [`CommandEvent`][neogrip_types::CommandEvent]s.
//!
//! # Modules
//!
//! - [`killswitch`] – [`KillSwitch`][killswitch::KillSwitch]: one-way
//!   operator abort, the only value shared with non-async threads.
//! - [`hysteresis`] – [`decide`][hysteresis::decide]: the two-threshold
//!   `(act, pow)` → target mapping with its dead zone.
//! - [`sequencer`] – [`MotionSequencer`][sequencer::MotionSequencer]: motion
//!   state of one servo plus the brake pulse used when stopping from `open`.
//! - [`hand_controller`] – [`HandController`][hand_controller::HandController]:
//!   killswitch, debounce, hysteresis and the join-barrier fan-out to every
//!   sequencer of the hand.

pub mod hand_controller;
pub mod hysteresis;
pub mod killswitch;
pub mod sequencer;

pub use hand_controller::{ActuationMode, HandController, HandControllerConfig};
pub use killswitch::KillSwitch;
pub use sequencer::MotionSequencer;
