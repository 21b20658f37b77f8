//! Request and subscription bridge.
//!
//! The consuming layer on top of a [`Tunnel`]: allocates REQUEST ids and
//! matches RESPONSE frames back to their callers, pairs VERSION with
//! VERSION_RESPONSE, and fans UPDATE frames out to subscribers.
//!
//! Responses may arrive in any order and interleaved with updates. Unknown or
//! duplicate response ids are dropped with a warning; the reader never fails
//! on them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tether_core::{AppMessage, ConnectionState, Request, Response, Update, VersionInfo};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::session::{Tunnel, TunnelEvent, TunnelEvents};

/// Outstanding requests keyed by id.
#[derive(Debug, Default)]
pub struct PendingRequests {
    waiting: HashMap<u64, oneshot::Sender<Response>>,
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request id. Returns `None` if the id is already in flight.
    pub fn register(&mut self, id: u64) -> Option<oneshot::Receiver<Response>> {
        if self.waiting.contains_key(&id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id, tx);
        Some(rx)
    }

    /// Deliver a response to its caller.
    ///
    /// Returns `false` for an unknown or already-answered id.
    pub fn resolve(&mut self, response: Response) -> bool {
        match self.waiting.remove(&response.id) {
            // The caller may have given up; that still consumes the id.
            Some(tx) => {
                let _ = tx.send(response);
                true
            }
            None => false,
        }
    }

    /// Forget a request (timeout or failed send).
    pub fn cancel(&mut self, id: u64) {
        self.waiting.remove(&id);
    }

    /// Number of requests in flight.
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Whether no request is in flight.
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Drop every waiter; their callers observe a closed channel.
    pub fn clear(&mut self) {
        self.waiting.clear();
    }
}

/// A stream of UPDATE frames for one path.
#[derive(Debug)]
pub struct Subscription {
    path: String,
    rx: mpsc::UnboundedReceiver<Update>,
}

impl Subscription {
    /// Subscribed path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next update, or `None` once unsubscribed or closed.
    pub async fn next(&mut self) -> Option<Update> {
        self.rx.recv().await
    }
}

#[derive(Debug, Default)]
struct Shared {
    pending: PendingRequests,
    version_waiters: VecDeque<oneshot::Sender<VersionInfo>>,
    subscriptions: HashMap<String, Vec<mpsc::UnboundedSender<Update>>>,
    closed: Option<ConnectionState>,
}

impl Shared {
    fn dispatch(&mut self, message: AppMessage) {
        match message {
            AppMessage::Response(response) => {
                let id = response.id;
                if !self.pending.resolve(response) {
                    warn!(id, "dropping response for unknown or answered request");
                }
            }
            AppMessage::VersionResponse(mut info) => {
                // Skip callers that timed out or failed to send.
                while let Some(waiter) = self.version_waiters.pop_front() {
                    match waiter.send(info) {
                        Ok(()) => return,
                        Err(unclaimed) => info = unclaimed,
                    }
                }
                warn!("unsolicited VERSION_RESPONSE dropped");
            }
            AppMessage::Update(update) => {
                let Some(subscribers) = self.subscriptions.get_mut(&update.path) else {
                    debug!(path = %update.path, "update for unsubscribed path dropped");
                    return;
                };
                subscribers.retain(|tx| tx.send(update.clone()).is_ok());
            }
            other => debug!(opcode = other.opcode(), "desktop-bound opcode from desktop ignored"),
        }
    }

    fn register_request(&mut self, id: u64) -> Result<oneshot::Receiver<Response>, TransportError> {
        if let Some(state) = self.closed {
            return Err(TransportError::Closed(state));
        }
        self.pending
            .register(id)
            .ok_or(TransportError::DuplicateRequestId(id))
    }

    fn register_version(&mut self) -> Result<oneshot::Receiver<VersionInfo>, TransportError> {
        if let Some(state) = self.closed {
            return Err(TransportError::Closed(state));
        }
        let (tx, rx) = oneshot::channel();
        self.version_waiters.push_back(tx);
        Ok(rx)
    }

    fn prune_version_waiters(&mut self) {
        self.version_waiters.retain(|waiter| !waiter.is_closed());
    }

    fn shut_down(&mut self, state: ConnectionState) {
        self.closed = Some(state);
        self.pending.clear();
        self.version_waiters.clear();
        self.subscriptions.clear();
    }
}

/// Request/response and subscription layer over a connected tunnel.
#[derive(Debug)]
pub struct Bridge {
    tunnel: Tunnel,
    shared: Arc<Mutex<Shared>>,
    next_id: AtomicU64,
    request_timeout: Option<Duration>,
}

impl Bridge {
    /// Open a tunnel and wait for it to reach CONNECTED.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] with the terminal state if the
    /// tunnel fails instead (no desktop, denied, timed out, lost).
    pub async fn connect(config: TransportConfig) -> Result<Self, TransportError> {
        let (tunnel, mut events) = Tunnel::open(config)?;

        loop {
            match events.next().await {
                Some(TunnelEvent::Open) => break,
                Some(TunnelEvent::Close(state)) => return Err(TransportError::Closed(state)),
                Some(TunnelEvent::Message(_)) => continue,
                None => return Err(TransportError::Closed(tunnel.state())),
            }
        }

        let shared = Arc::new(Mutex::new(Shared::default()));
        tokio::spawn(pump(events, Arc::clone(&shared)));

        Ok(Self {
            tunnel,
            shared,
            next_id: AtomicU64::new(1),
            request_timeout: None,
        })
    }

    /// Fail requests that get no response within `timeout`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// The underlying tunnel.
    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.tunnel.state()
    }

    /// Issue a REQUEST and wait for its RESPONSE.
    pub async fn request(
        &self,
        method: impl Into<String>,
        path: impl Into<String>,
        body: Option<Value>,
    ) -> Result<Response, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.lock().register_request(id)?;

        let request = AppMessage::Request(Request {
            id,
            method: method.into(),
            path: path.into(),
            body,
        });
        if let Err(e) = self.tunnel.send(&request).await {
            self.lock().pending.cancel(id);
            return Err(e);
        }

        let result = self.await_reply(rx).await;
        if result.is_err() {
            self.lock().pending.cancel(id);
        }
        result
    }

    /// Ask the desktop for its version.
    ///
    /// Subject to the same timeout as [`Bridge::request`].
    pub async fn version(&self) -> Result<VersionInfo, TransportError> {
        let rx = self.lock().register_version()?;

        let result = match self.tunnel.send(&AppMessage::Version).await {
            Ok(()) => self.await_reply(rx).await,
            Err(e) => {
                drop(rx);
                Err(e)
            }
        };
        if result.is_err() {
            self.lock().prune_version_waiters();
        }
        result
    }

    /// Subscribe to UPDATE frames for `path`.
    ///
    /// SUBSCRIBE is sent only for the first subscriber of a path.
    pub async fn subscribe(&self, path: impl Into<String>) -> Result<Subscription, TransportError> {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let first = {
            let mut shared = self.lock();
            if let Some(state) = shared.closed {
                return Err(TransportError::Closed(state));
            }
            let subscribers = shared.subscriptions.entry(path.clone()).or_default();
            subscribers.push(tx);
            subscribers.len() == 1
        };

        if first {
            if let Err(e) = self.tunnel.send(&AppMessage::Subscribe(path.clone())).await {
                self.lock().subscriptions.remove(&path);
                return Err(e);
            }
        }
        Ok(Subscription { path, rx })
    }

    /// Drop every subscriber of `path` and send UNSUBSCRIBE.
    pub async fn unsubscribe(&self, path: &str) -> Result<(), TransportError> {
        let existed = self.lock().subscriptions.remove(path).is_some();
        if existed {
            self.tunnel
                .send(&AppMessage::Unsubscribe(path.to_owned()))
                .await?;
        }
        Ok(())
    }

    /// Close the tunnel. Pending requests fail with [`TransportError::Closed`].
    pub async fn close(&self) {
        self.tunnel.close().await;
    }

    /// Wait for a reply, bounded by the request timeout.
    async fn await_reply<T>(&self, rx: oneshot::Receiver<T>) -> Result<T, TransportError> {
        let outcome = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => rx.await,
        };
        outcome.map_err(|_| TransportError::Closed(self.tunnel.state()))
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Route tunnel events into the shared tables until Close.
async fn pump(mut events: TunnelEvents, shared: Arc<Mutex<Shared>>) {
    while let Some(event) = events.next().await {
        let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            TunnelEvent::Message(message) => guard.dispatch(message),
            TunnelEvent::Close(state) => {
                guard.shut_down(state);
                return;
            }
            TunnelEvent::Open => {}
        }
    }
}
