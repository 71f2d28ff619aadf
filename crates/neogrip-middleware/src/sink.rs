//! The seam between the relay transport and whatever moves the hand.
//!
//! The relay server never talks to a [`HandController`] directly; it drives a
//! [`CommandSink`]. That keeps the transport testable with a recording sink
//! and lets other actuator backends plug in later.

use async_trait::async_trait;
use neogrip_kernel::HandController;
use neogrip_types::{CommandEvent, HandState, NeoError};

/// Consumer of relayed commands.
///
/// # Contract
///
/// * `apply` – translate one command; returns the new hand state if it
///   changed.
/// * `stop_all` – orderly stop after a client went away (brakes apply).
/// * `hard_stop_all` – immediate stop after a killswitch; must not suspend.
#[async_trait]
pub trait CommandSink: Send {
    async fn apply(&mut self, event: &CommandEvent) -> Result<Option<HandState>, NeoError>;

    async fn stop_all(&mut self) -> Result<(), NeoError>;

    fn hard_stop_all(&mut self) -> Result<(), NeoError>;
}

#[async_trait]
impl CommandSink for HandController {
    async fn apply(&mut self, event: &CommandEvent) -> Result<Option<HandState>, NeoError> {
        self.apply_command(event).await
    }

    async fn stop_all(&mut self) -> Result<(), NeoError> {
        HandController::stop_all(self).await
    }

    fn hard_stop_all(&mut self) -> Result<(), NeoError> {
        HandController::hard_stop_all(self)
    }
}
