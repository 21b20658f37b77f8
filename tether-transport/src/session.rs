//! Tunnel API.
//!
//! The public interface for pairing with a desktop through the relay.
//!
//! A driver task owns the socket and the core [`Session`]. It is the only
//! place session state changes, so no locking is needed around the key or the
//! state machine. Callers talk to it through a command channel and observe it
//! through [`TunnelEvents`] and a state watch.
//!
//! # Guarantees
//!
//! - `Open` is delivered at most once, and only once encrypted
//! - `Message` is delivered only for frames that decrypt and decode
//! - `Close` is delivered exactly once, and nothing follows it
//! - `close()` is idempotent; a handshake cancelled by it never opens

use std::future::pending;

use tether_core::{AppMessage, ConnectionState, Session, SessionOutput};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::relay::{Inbound, RelaySocket};

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Events surfaced by a tunnel, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelEvent {
    /// Handshake accepted; the tunnel is CONNECTED.
    Open,
    /// A decrypted application message from the desktop.
    Message(AppMessage),
    /// The tunnel reached a terminal state.
    Close(ConnectionState),
}

/// Receiving half of a tunnel's events.
#[derive(Debug)]
pub struct TunnelEvents {
    rx: mpsc::UnboundedReceiver<TunnelEvent>,
}

impl TunnelEvents {
    /// Next event, or `None` once the Close event has been consumed.
    pub async fn next(&mut self) -> Option<TunnelEvent> {
        self.rx.recv().await
    }
}

enum Command {
    Send {
        plaintext: String,
        done: oneshot::Sender<Result<(), TransportError>>,
    },
    Close,
}

/// Handle to a running tunnel.
///
/// Cheap to clone; every clone drives the same session. Dropping the last
/// handle closes the tunnel.
#[derive(Debug, Clone)]
pub struct Tunnel {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl Tunnel {
    /// Start a tunnel on the current tokio runtime.
    ///
    /// Only configuration errors are returned here. Everything after that
    /// (no desktop, denial, socket loss) is reported through state and the
    /// Close event.
    pub fn open(config: TransportConfig) -> Result<(Self, TunnelEvents), TransportError> {
        let url = config.mobile_url()?;
        let session = Session::new(config.pairing_code.clone(), config.device.clone());
        let deadline = Instant::now() + config.handshake_timeout;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let driver = Driver {
            session,
            events: event_tx,
            state: state_tx,
        };
        tokio::spawn(driver.run(url, deadline, command_rx));

        Ok((
            Self {
                commands: command_tx,
                state: state_rx,
            },
            TunnelEvents { rx: event_rx },
        ))
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the tunnel reaches a terminal state and return it.
    pub async fn closed(&self) -> ConnectionState {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return *state.borrow();
            }
        }
    }

    /// Encrypt and send an application message.
    pub async fn send(&self, message: &AppMessage) -> Result<(), TransportError> {
        self.send_text(message.encode()).await
    }

    /// Encrypt and send raw plaintext.
    ///
    /// Resolves once the encrypted frame was written to the socket. Sends
    /// from one caller are written in the order they were issued.
    pub async fn send_text(&self, plaintext: impl Into<String>) -> Result<(), TransportError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(TransportError::Closed(state));
        }

        let (done, result) = oneshot::channel();
        self.commands
            .send(Command::Send {
                plaintext: plaintext.into(),
                done,
            })
            .await
            .map_err(|_| TransportError::Closed(self.state()))?;
        result
            .await
            .map_err(|_| TransportError::Closed(self.state()))?
    }

    /// Close the tunnel. Idempotent and safe in any state.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
        self.closed().await;
    }
}

struct Driver {
    session: Session,
    events: mpsc::UnboundedSender<TunnelEvent>,
    state: watch::Sender<ConnectionState>,
}

impl Driver {
    async fn run(
        mut self,
        url: Url,
        deadline: Instant,
        mut commands: mpsc::Receiver<Command>,
    ) {
        if let Some(mut socket) = self.connect(&url, deadline, &mut commands).await {
            self.serve(&mut socket, deadline, &mut commands).await;
            socket.close().await;
        }

        // Answer sends queued behind the close.
        commands.close();
        while let Some(command) = commands.recv().await {
            if let Command::Send { done, .. } = command {
                let _ = done.send(Err(TransportError::Closed(self.session.state())));
            }
        }
    }

    /// Open the socket and send CONNECT. A local close while the socket is
    /// still being established ends the session here.
    async fn connect(
        &mut self,
        url: &Url,
        deadline: Instant,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Option<RelaySocket> {
        let connecting = timeout_at(deadline, RelaySocket::connect(url));
        tokio::pin!(connecting);

        loop {
            tokio::select! {
                connected = &mut connecting => {
                    let out = match connected {
                        Ok(Ok(mut socket)) => {
                            let out = self.session.on_socket_open();
                            self.apply(&mut socket, out).await;
                            return Some(socket);
                        }
                        Ok(Err(e)) => {
                            warn!(error = %e, "relay unreachable");
                            self.session.on_transport_lost()
                        }
                        Err(_) => self.session.on_handshake_timeout(),
                    };
                    self.apply_local(out);
                    return None;
                }
                command = commands.recv() => match command {
                    Some(Command::Send { done, .. }) => {
                        let _ = done.send(Err(TransportError::NotConnected(self.session.state())));
                    }
                    Some(Command::Close) | None => {
                        debug!("local close while connecting");
                        let out = self.session.close();
                        self.apply_local(out);
                        return None;
                    }
                },
            }
        }
    }

    /// Drive a live socket until the session reaches a terminal state.
    async fn serve(
        &mut self,
        socket: &mut RelaySocket,
        deadline: Instant,
        commands: &mut mpsc::Receiver<Command>,
    ) {
        while !self.session.state().is_terminal() {
            let awaiting = self.session.awaiting_handshake();
            tokio::select! {
                inbound = socket.recv_frame() => match inbound {
                    Ok(Inbound::Frame(frame)) => {
                        let out = self.session.on_relay_frame(frame);
                        self.apply(socket, out).await;
                    }
                    Ok(Inbound::Invalid(e)) => self.session.on_invalid_frame(&e),
                    Err(e) => {
                        info!(error = %e, "relay socket lost");
                        let out = self.session.on_transport_lost();
                        self.apply_local(out);
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Send { plaintext, done }) => {
                        let result = self.send(socket, &plaintext).await;
                        let _ = done.send(result);
                    }
                    Some(Command::Close) | None => {
                        debug!("local close");
                        let out = self.session.close();
                        self.apply_local(out);
                    }
                },
                _ = deadline_or_never(deadline, awaiting) => {
                    let out = self.session.on_handshake_timeout();
                    self.apply_local(out);
                }
            }
        }
    }

    async fn send(
        &mut self,
        socket: &mut RelaySocket,
        plaintext: &str,
    ) -> Result<(), TransportError> {
        let state = self.session.state();
        let frame = self.session.seal_text(plaintext).map_err(|e| match state {
            ConnectionState::Connected => TransportError::Protocol(e),
            s if s.is_terminal() => TransportError::Closed(s),
            s => TransportError::NotConnected(s),
        })?;

        if let Err(e) = socket.send_frame(&frame).await {
            warn!(error = %e, "send failed");
            let out = self.session.on_transport_lost();
            self.apply_local(out);
            return Err(e);
        }
        Ok(())
    }

    /// Act on session outputs, transmitting frames.
    async fn apply(&mut self, socket: &mut RelaySocket, outputs: Vec<SessionOutput>) {
        for output in outputs {
            match output {
                SessionOutput::Transmit(frame) => {
                    if let Err(e) = socket.send_frame(&frame).await {
                        warn!(error = %e, "relay write failed");
                        let out = self.session.on_transport_lost();
                        self.apply_local(out);
                        return;
                    }
                }
                other => self.surface(other),
            }
        }
        self.publish_state();
    }

    /// Act on session outputs that carry no frames (terminal transitions).
    fn apply_local(&mut self, outputs: Vec<SessionOutput>) {
        for output in outputs {
            match output {
                SessionOutput::Transmit(frame) => {
                    debug!(opcode = frame.opcode(), "frame discarded, socket unavailable");
                }
                other => self.surface(other),
            }
        }
        self.publish_state();
    }

    fn surface(&mut self, output: SessionOutput) {
        let event = match output {
            SessionOutput::Open => TunnelEvent::Open,
            SessionOutput::Message(message) => TunnelEvent::Message(message),
            SessionOutput::Close(state) => TunnelEvent::Close(state),
            SessionOutput::Transmit(_) => return,
        };
        // Update state before the event is observable.
        self.publish_state();
        let _ = self.events.send(event);
    }

    fn publish_state(&self) {
        let state = self.session.state();
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

async fn deadline_or_never(deadline: Instant, armed: bool) {
    if armed {
        sleep_until(deadline).await;
    } else {
        pending::<()>().await;
    }
}
