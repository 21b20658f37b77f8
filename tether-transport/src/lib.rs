//! Tether Transport
//!
//! Async WebSocket transport for the tether tunnel. This crate wraps
//! `tether-core` and drives a session over a real relay socket.
//!
//! Two layers are exposed:
//!
//! - [`Tunnel`]: open, send, close; events for open, message and close.
//! - [`Bridge`]: request/response correlation, version queries and path
//!   subscriptions on top of a connected tunnel.
//!
//! # Failure Model
//!
//! Every failure after configuration ends the tunnel in a terminal state
//! (`FailedNoDesktop`, `FailedDesktopDeny` or `Disconnected`) with exactly
//! one Close event. Tunnels are never reused; pairing again means a new
//! tunnel with a new code.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod bridge;
pub mod config;
pub mod error;
mod relay;
pub mod session;

pub use bridge::{Bridge, PendingRequests, Subscription};
pub use config::{mobile_url, TransportConfig, DEFAULT_HANDSHAKE_TIMEOUT};
pub use error::TransportError;
pub use session::{Tunnel, TunnelEvent, TunnelEvents};
