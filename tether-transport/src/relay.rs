//! WebSocket relay socket.
//!
//! Internal module for WebSocket communication with the relay.
//!
//! # Frame Handling Invariants
//!
//! - Strict 1:1 mapping: one WS text message = one relay frame
//! - No buffering, no message combining/splitting
//! - Each `send_frame()` = exactly one `ws.send(Text(...))`
//! - Each `recv_frame()` = exactly one text message → parse → frame
//! - Binary, ping and pong messages are ignored

use futures_util::{SinkExt, StreamExt};
use tether_core::{ProtocolError, RelayFrame};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace};
use url::Url;

use crate::error::TransportError;

/// What arrived on the socket.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// A well-formed relay frame.
    Frame(RelayFrame),
    /// A text message that is not a valid relay frame.
    Invalid(ProtocolError),
}

/// Internal WebSocket relay socket.
///
/// Does not implement `Clone` to prevent socket duplication.
pub(crate) struct RelaySocket {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    url: Url,
}

impl std::fmt::Debug for RelaySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySocket")
            .field("host", &self.url.host_str())
            .finish()
    }
}

impl RelaySocket {
    /// Open the WebSocket to the relay's mobile endpoint.
    pub async fn connect(url: &Url) -> Result<Self, TransportError> {
        debug!(host = ?url.host_str(), "connecting to relay");
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            ws,
            url: url.clone(),
        })
    }

    /// Send one relay frame.
    pub async fn send_frame(&mut self, frame: &RelayFrame) -> Result<(), TransportError> {
        trace!(opcode = frame.opcode(), "relay frame out");
        self.ws
            .send(WsMessage::Text(frame.to_wire()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    /// Receive one relay frame.
    ///
    /// Cancel-safe: a dropped call loses no frame.
    pub async fn recv_frame(&mut self) -> Result<Inbound, TransportError> {
        loop {
            match self.ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(match RelayFrame::parse(&text) {
                        Ok(frame) => {
                            trace!(opcode = frame.opcode(), "relay frame in");
                            Inbound::Frame(frame)
                        }
                        Err(e) => Inbound::Invalid(e),
                    });
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(TransportError::RelayDisconnected)
                }
                Some(Ok(_)) => continue, // Ignore Binary, Ping, Pong
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
            }
        }
    }

    /// Close the connection. Best effort.
    pub async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
