//! Transport errors.

use tether_core::{ConnectionState, ProtocolError};
use thiserror::Error;

/// Errors that can occur during transport operations.
///
/// Connection-level failures are also reflected in the tunnel's state and
/// its Close event; the state is the source of truth for "connected".
#[derive(Debug, Error)]
pub enum TransportError {
    // --- Configuration ---
    /// Relay URL or pairing code unusable.
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    /// Missing or unparseable configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    // --- Connection & Setup ---
    /// Failed to establish the WebSocket connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// WebSocket error on a live socket.
    #[error("websocket error: {0}")]
    WebSocket(String),
    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    // --- Protocol ---
    /// Protocol-level error from tether-core.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // --- Lifecycle ---
    /// The tunnel has not reached CONNECTED.
    #[error("tunnel not connected ({0})")]
    NotConnected(ConnectionState),
    /// The tunnel reached a terminal state.
    #[error("tunnel closed ({0})")]
    Closed(ConnectionState),
    /// Relay closed the socket.
    #[error("relay disconnected")]
    RelayDisconnected,
    /// A request id is already awaiting its response.
    #[error("request id {0} already in flight")]
    DuplicateRequestId(u64),
}
