//! Connection state machine.
//!
//! States: CONNECTING → HANDSHAKING → CONNECTED → DISCONNECTED
//!
//! ```text
//! CONNECTING  ──pubkey──▶ HANDSHAKING ──accepted──▶ CONNECTED
//!     │                       │   │                     │
//!     │ null / socket loss    │   │ denied              │ close / socket loss
//!     │ / deadline            │   ▼                     ▼
//!     ▼                       │ FAILED_DESKTOP_DENY   DISCONNECTED
//! FAILED_NO_DESKTOP           └── close / loss / deadline ──▶ DISCONNECTED
//! ```
//!
//! FAILED_NO_DESKTOP, FAILED_DESKTOP_DENY and DISCONNECTED are terminal.
//! A terminal session drops its key; a new pairing needs a new `Session`.
//!
//! The session does no I/O. Every input returns the [`SessionOutput`]s to act
//! on, in order: frames to transmit and events to surface.

use std::fmt;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::crypto::{self, SessionKey};
use crate::error::ProtocolError;
use crate::frame::{HandshakeFrame, RelayFrame};
use crate::handshake::{DeviceIdentity, Handshake};
use crate::message::AppMessage;

/// Externally observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Socket opening or CONNECT sent, waiting for the desktop's key.
    Connecting,
    /// SECRET sent, waiting for SECRET_RESPONSE.
    Handshaking,
    /// Handshake accepted, encrypted traffic flowing.
    Connected,
    /// No desktop answered for the pairing code. Terminal.
    FailedNoDesktop,
    /// Desktop refused the handshake. Terminal.
    FailedDesktopDeny,
    /// Connection ended after it got going. Terminal.
    Disconnected,
}

impl ConnectionState {
    /// Whether no transition leaves this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::FailedNoDesktop | Self::FailedDesktopDeny | Self::Disconnected
        )
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Connecting, FailedNoDesktop)
                | (Connecting, Disconnected)
                | (Handshaking, Connected)
                | (Handshaking, FailedDesktopDeny)
                | (Handshaking, Disconnected)
                | (Connected, Disconnected)
        )
    }

    /// Stable upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Handshaking => "HANDSHAKING",
            Self::Connected => "CONNECTED",
            Self::FailedNoDesktop => "FAILED_NO_DESKTOP",
            Self::FailedDesktopDeny => "FAILED_DESKTOP_DENY",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the driver must do after feeding the session an input.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    /// Write this frame to the relay socket.
    Transmit(RelayFrame),
    /// Handshake accepted. Emitted exactly once per session, if ever.
    Open,
    /// A decrypted, decoded application message.
    Message(AppMessage),
    /// Terminal state reached. Emitted exactly once per session.
    Close(ConnectionState),
}

/// One pairing attempt over one socket.
///
/// Owns the session key exclusively. Does not implement `Clone`.
pub struct Session {
    state: ConnectionState,
    pairing_code: String,
    device: DeviceIdentity,
    handshake: Option<Handshake>,
    key: Option<SessionKey>,
    encrypted: bool,
    connect_sent: bool,
    opened: bool,
    closed: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("encrypted", &self.encrypted)
            .field("device", &self.device.identity)
            .finish()
    }
}

impl Session {
    /// Create a session for a pairing code.
    pub fn new(pairing_code: impl Into<String>, device: DeviceIdentity) -> Self {
        Self {
            state: ConnectionState::Connecting,
            pairing_code: pairing_code.into(),
            device,
            handshake: None,
            key: None,
            encrypted: false,
            connect_sent: false,
            opened: false,
            closed: false,
        }
    }

    /// Get current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether application traffic is encrypted (CONNECTED).
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Whether the handshake deadline still applies.
    pub fn awaiting_handshake(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Handshaking
        )
    }

    /// The pairing code this session was created for.
    pub fn pairing_code(&self) -> &str {
        &self.pairing_code
    }

    /// Socket is open: send CONNECT.
    pub fn on_socket_open(&mut self) -> Vec<SessionOutput> {
        if self.state != ConnectionState::Connecting || self.connect_sent {
            warn!(state = %self.state, "socket open ignored");
            return Vec::new();
        }
        self.connect_sent = true;
        debug!("sending CONNECT");
        vec![SessionOutput::Transmit(RelayFrame::Connect(
            self.pairing_code.clone(),
        ))]
    }

    /// Process an inbound relay frame.
    ///
    /// Protocol errors on individual frames are logged and the frame dropped;
    /// only handshake outcomes change state.
    pub fn on_relay_frame(&mut self, frame: RelayFrame) -> Vec<SessionOutput> {
        if self.state.is_terminal() {
            debug!(opcode = frame.opcode(), "frame after close ignored");
            return Vec::new();
        }

        match frame {
            RelayFrame::ConnectPubkey(key) => self.on_connect_pubkey(key),
            RelayFrame::Receive(payload) => self.on_receive(payload),
            other => {
                warn!(opcode = other.opcode(), "client-only relay opcode from relay dropped");
                Vec::new()
            }
        }
    }

    /// Record a frame that failed to parse.
    pub fn on_invalid_frame(&self, err: &ProtocolError) {
        warn!(state = %self.state, error = %err, "dropping malformed relay frame");
    }

    fn on_connect_pubkey(&mut self, key: Option<String>) -> Vec<SessionOutput> {
        if self.state != ConnectionState::Connecting {
            warn!(state = %self.state, "unexpected CONNECT_PUBKEY dropped");
            return Vec::new();
        }

        let Some(key) = key else {
            info!("no desktop for pairing code");
            return self.finish(ConnectionState::FailedNoDesktop);
        };

        self.transition(ConnectionState::Handshaking);

        match Handshake::begin(&key, &self.device) {
            Ok((handshake, secret)) => {
                self.handshake = Some(handshake);
                debug!("sending SECRET");
                vec![SessionOutput::Transmit(RelayFrame::Send(secret.to_value()))]
            }
            Err(e) => {
                error!(error = %e, "handshake aborted");
                self.finish(ConnectionState::Disconnected)
            }
        }
    }

    fn on_receive(&mut self, payload: Value) -> Vec<SessionOutput> {
        if self.encrypted {
            return self.on_encrypted(payload);
        }

        if self.state != ConnectionState::Handshaking {
            warn!(state = %self.state, "payload before handshake dropped");
            return Vec::new();
        }

        match HandshakeFrame::from_value(payload) {
            Ok(HandshakeFrame::SecretResponse(accepted)) => self.on_secret_response(accepted),
            Ok(HandshakeFrame::Secret(_)) => {
                warn!("SECRET from desktop dropped");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "dropping handshake payload");
                Vec::new()
            }
        }
    }

    fn on_secret_response(&mut self, accepted: bool) -> Vec<SessionOutput> {
        let Some(handshake) = self.handshake.take() else {
            warn!("SECRET_RESPONSE without a pending handshake dropped");
            return Vec::new();
        };

        match handshake.finish(accepted) {
            Ok(key) => {
                self.key = Some(key);
                self.encrypted = true;
                self.transition(ConnectionState::Connected);
                let mut out = Vec::new();
                if !self.opened {
                    self.opened = true;
                    out.push(SessionOutput::Open);
                }
                out
            }
            Err(e) => {
                info!(error = %e, "desktop denied pairing");
                self.finish(ConnectionState::FailedDesktopDeny)
            }
        }
    }

    fn on_encrypted(&mut self, payload: Value) -> Vec<SessionOutput> {
        match self.open_envelope(payload) {
            Ok(message) => {
                debug!(opcode = message.opcode(), "received application frame");
                vec![SessionOutput::Message(message)]
            }
            Err(e) => {
                warn!(error = %e, "dropping application frame");
                Vec::new()
            }
        }
    }

    fn open_envelope(&self, payload: Value) -> Result<AppMessage, ProtocolError> {
        let Value::String(envelope) = payload else {
            return Err(ProtocolError::UnexpectedFrame("CONNECTED"));
        };
        let key = self.key.as_ref().ok_or(ProtocolError::NotConnected)?;
        let plaintext = crypto::decrypt(key, &envelope)?;
        AppMessage::decode(&plaintext)
    }

    /// Encrypt an application message into a SEND frame.
    pub fn seal(&self, message: &AppMessage) -> Result<RelayFrame, ProtocolError> {
        self.seal_text(&message.encode())
    }

    /// Encrypt raw plaintext into a SEND frame.
    ///
    /// # Errors
    ///
    /// Returns error unless CONNECTED, or if encryption fails.
    pub fn seal_text(&self, plaintext: &str) -> Result<RelayFrame, ProtocolError> {
        if self.state.is_terminal() {
            return Err(ProtocolError::SessionTerminated);
        }
        if self.state != ConnectionState::Connected || !self.encrypted {
            return Err(ProtocolError::NotConnected);
        }
        let key = self.key.as_ref().ok_or(ProtocolError::NotConnected)?;
        let envelope = crypto::encrypt(key, plaintext)?;
        Ok(RelayFrame::Send(Value::String(envelope)))
    }

    /// Socket errored or closed.
    ///
    /// Before the desktop's key arrives this means no desktop; afterwards the
    /// connection is simply gone.
    pub fn on_transport_lost(&mut self) -> Vec<SessionOutput> {
        match self.state {
            ConnectionState::Connecting => self.finish(ConnectionState::FailedNoDesktop),
            ConnectionState::Handshaking | ConnectionState::Connected => {
                self.finish(ConnectionState::Disconnected)
            }
            _ => Vec::new(),
        }
    }

    /// The handshake deadline passed.
    pub fn on_handshake_timeout(&mut self) -> Vec<SessionOutput> {
        match self.state {
            ConnectionState::Connecting => {
                info!("no CONNECT_PUBKEY before deadline");
                self.finish(ConnectionState::FailedNoDesktop)
            }
            ConnectionState::Handshaking => {
                info!("no SECRET_RESPONSE before deadline");
                self.finish(ConnectionState::Disconnected)
            }
            _ => Vec::new(),
        }
    }

    /// Local close. Idempotent.
    pub fn close(&mut self) -> Vec<SessionOutput> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.finish(ConnectionState::Disconnected)
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "illegal transition refused");
            return false;
        }
        info!(from = %self.state, to = %next, "state transition");
        self.state = next;
        true
    }

    /// Move to a terminal state, drop key material and emit Close once.
    fn finish(&mut self, terminal: ConnectionState) -> Vec<SessionOutput> {
        if !self.transition(terminal) {
            return Vec::new();
        }
        self.handshake = None;
        self.key = None;
        self.encrypted = false;

        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        vec![SessionOutput::Close(terminal)]
    }
}
