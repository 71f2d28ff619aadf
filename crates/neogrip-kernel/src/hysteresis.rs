//! Two-threshold translation from a mental command to a hand target.
//!
//! A single threshold makes the hand flicker whenever the detection power
//! hovers around it. With two thresholds the band between `pow_off` and
//! `pow_on` is a dead zone that keeps whatever the hand is already doing.

use neogrip_types::{HandState, MotionState};

/// Action that opens the hand.
pub const ACT_OPEN: &str = "push";
/// Action that closes the hand.
pub const ACT_CLOSE: &str = "pull";

/// Target state for `(act, pow)` given the current state.
///
/// | condition | target |
/// |---|---|
/// | `act == "push"` and `pow >= pow_on` | open |
/// | `act == "pull"` and `pow >= pow_on` | close |
/// | otherwise `pow <= pow_off` | stop |
/// | otherwise | `current` |
///
/// A `NaN` power never changes the state.
pub fn decide(current: HandState, act: &str, pow: f64, pow_on: f64, pow_off: f64) -> HandState {
    if pow >= pow_on {
        match act {
            ACT_OPEN => return MotionState::Open,
            ACT_CLOSE => return MotionState::Close,
            _ => {}
        }
    }
    if pow <= pow_off {
        return MotionState::Stop;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    const ON: f64 = 0.55;
    const OFF: f64 = 0.45;

    #[test]
    fn strong_push_and_pull_drive_the_hand() {
        assert_eq!(decide(MotionState::Stop, "push", 0.60, ON, OFF), MotionState::Open);
        assert_eq!(decide(MotionState::Open, "pull", 0.55, ON, OFF), MotionState::Close);
    }

    #[test]
    fn weak_signal_stops_regardless_of_action() {
        for act in ["push", "pull", "neutral", "lift"] {
            assert_eq!(decide(MotionState::Open, act, 0.10, ON, OFF), MotionState::Stop);
            assert_eq!(decide(MotionState::Close, act, 0.45, ON, OFF), MotionState::Stop);
        }
    }

    #[test]
    fn push_below_pow_off_never_opens() {
        for pow in [0.0, 0.2, 0.44, 0.45] {
            assert_ne!(decide(MotionState::Stop, "push", pow, ON, OFF), MotionState::Open);
        }
    }

    #[test]
    fn dead_zone_keeps_current_state() {
        for current in [MotionState::Stop, MotionState::Open, MotionState::Close] {
            for act in ["push", "pull", "neutral"] {
                for pow in [0.46, 0.50, 0.54] {
                    assert_eq!(decide(current, act, pow, ON, OFF), current);
                }
            }
        }
    }

    #[test]
    fn strong_unknown_action_keeps_current_state() {
        assert_eq!(decide(MotionState::Open, "neutral", 0.9, ON, OFF), MotionState::Open);
    }

    #[test]
    fn nan_power_is_ignored() {
        assert_eq!(decide(MotionState::Close, "push", f64::NAN, ON, OFF), MotionState::Close);
    }
}
