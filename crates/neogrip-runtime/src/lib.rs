//! `neogrip-runtime` – Cortex session, run loops & telemetry
//!
//! Everything that talks to the outside world on the signal side: the
//! Cortex JSON-RPC session over a WebSocket, the loops that feed its command
//! stream into a local hand or the relay link, and the process-wide tracing
//! setup shared by every NeoGrip binary.
//!
//! # Modules
//!
//! - [`transport`] – [`RpcTransport`][transport::RpcTransport] and its
//!   WebSocket implementation.
//! - [`session`] – [`SessionClient`][session::SessionClient]: the
//!   negotiation state machine, the mental-command stream and teardown.
//! - [`pipeline`] – [`run_local`][pipeline::run_local] and
//!   [`run_forwarder`][pipeline::run_forwarder].
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing].

pub mod pipeline;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use pipeline::{StopReason, run_forwarder, run_local};
pub use session::{Phase, SessionClient, SessionConfig};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
pub use transport::{RpcTransport, WsTransport};
