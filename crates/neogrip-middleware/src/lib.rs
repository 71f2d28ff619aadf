//! `neogrip-middleware` – The relay link
//!
//! Carries command events from the signal host (where the Cortex session
//! runs) to the actuator host (where the hand is wired), over a plain TCP
//! connection carrying newline-delimited JSON.
//!
//! # Modules
//!
//! - [`codec`] – [`encode_line`][codec::encode_line] /
//!   [`decode_line`][codec::decode_line] for command and killswitch records.
//! - [`sink`] – [`CommandSink`][sink::CommandSink]: what the server drives;
//!   implemented for [`HandController`][neogrip_kernel::HandController].
//! - [`relay_client`] – [`RelayClient`][relay_client::RelayClient]: single
//!   writer task with killswitch priority.
//! - [`relay_server`] – [`RelayServer`][relay_server::RelayServer]: serves
//!   one client at a time and ends on a killswitch.

pub mod codec;
pub mod relay_client;
pub mod relay_server;
pub mod sink;

pub use codec::{decode_line, encode_line};
pub use relay_client::RelayClient;
pub use relay_server::RelayServer;
pub use sink::CommandSink;
