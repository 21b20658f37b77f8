//! Mock relay with a scripted desktop behind it.
//!
//! One listener per test, one mobile connection per listener. Everything the
//! mock observes is reported on a channel so tests can assert on the exact
//! frames that crossed the wire.

#![allow(dead_code)]

use std::sync::OnceLock;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Oaep, RsaPrivateKey};
use serde_json::{json, Value};
use sha2::Sha256;
use tether_core::crypto::{self, SessionKey};
use tether_core::{AppMessage, Request, Response, Update, VersionInfo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as Upgrade, Response as UpgradeResponse,
};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

pub const DESKTOP_VERSION: &str = "1.2.3";
pub const MACHINE_NAME: &str = "DESKTOP-TEST";

/// Requests to this path are held until the next request has been answered.
pub const SLOW_PATH: &str = "/slow";
/// Requests to this path get a 404.
pub const MISSING_PATH: &str = "/missing";

/// How the desktop behind the relay reacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Desktop {
    /// No desktop for the code: `CONNECT_PUBKEY[null]`.
    Absent,
    /// Key offered, SECRET denied.
    Deny,
    /// Key offered, SECRET accepted, application frames answered.
    Accept,
    /// CONNECT is never answered.
    Silent,
    /// The relay drops the socket once SECRET arrives.
    HangUp,
}

/// What the mock saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    /// Request target of the WebSocket upgrade.
    Upgrade(String),
    /// Raw relay frame from the mobile.
    Frame(Value),
    /// Identity record recovered from SECRET.
    Identity(Value),
    /// Decrypted application plaintext.
    Plaintext(String),
    /// The mobile's socket is gone.
    Closed,
}

pub struct MockRelay {
    /// Base URL in `http` form, mapped to `ws` by the client.
    pub url: String,
    seen: mpsc::UnboundedReceiver<Seen>,
}

impl MockRelay {
    pub async fn spawn(desktop: Desktop) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, seen) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                handle_mobile(stream, desktop, tx).await;
            }
        });

        Self {
            url: format!("http://{addr}"),
            seen,
        }
    }

    /// Next observation. Panics after 5 seconds of silence.
    pub async fn next(&mut self) -> Seen {
        tokio::time::timeout(Duration::from_secs(5), self.seen.recv())
            .await
            .expect("mock relay saw nothing")
            .expect("mock relay gone")
    }

    /// Next decrypted application plaintext, skipping raw frames.
    pub async fn next_plaintext(&mut self) -> String {
        loop {
            if let Seen::Plaintext(text) = self.next().await {
                return text;
            }
        }
    }

    /// Everything seen until the mobile's socket closed.
    pub async fn until_closed(&mut self) -> Vec<Seen> {
        let mut seen = Vec::new();
        loop {
            match self.next().await {
                Seen::Closed => return seen,
                other => seen.push(other),
            }
        }
    }
}

struct DesktopKey {
    private: RsaPrivateKey,
    spki: String,
}

/// Key generation is slow; one key per test binary.
fn desktop_key() -> &'static DesktopKey {
    static KEY: OnceLock<DesktopKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let spki = private.to_public_key().to_public_key_der().unwrap();
        DesktopKey {
            private,
            spki: STANDARD.encode(spki.as_bytes()),
        }
    })
}

fn unwrap_identity(wrapped: &str) -> Value {
    let ct = STANDARD.decode(wrapped).unwrap();
    let pt = desktop_key()
        .private
        .decrypt(Oaep::new::<Sha256>(), &ct)
        .unwrap();
    serde_json::from_slice(&pt).unwrap()
}

async fn send(ws: &mut WebSocketStream<TcpStream>, frame: Value) {
    let _ = ws.send(Message::Text(frame.to_string())).await;
}

async fn send_sealed(ws: &mut WebSocketStream<TcpStream>, key: &SessionKey, message: AppMessage) {
    let envelope = crypto::encrypt(key, &message.encode()).unwrap();
    send(ws, json!([8, envelope])).await;
}

async fn handle_mobile(stream: TcpStream, desktop: Desktop, tx: mpsc::UnboundedSender<Seen>) {
    let mut target = String::new();
    let callback = |req: &Upgrade, response: UpgradeResponse| -> Result<UpgradeResponse, ErrorResponse> {
        target = req.uri().to_string();
        Ok(response)
    };
    let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
        let _ = tx.send(Seen::Closed);
        return;
    };
    let _ = tx.send(Seen::Upgrade(target));

    let mut key: Option<SessionKey> = None;
    let mut held: Option<Request> = None;

    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        let _ = tx.send(Seen::Frame(frame.clone()));

        match (frame[0].as_u64(), key.as_ref()) {
            (Some(4), _) => match desktop {
                Desktop::Absent => send(&mut ws, json!([5, null])).await,
                Desktop::Silent => {}
                _ => send(&mut ws, json!([5, desktop_key().spki])).await,
            },
            (Some(6), None) => {
                let record = unwrap_identity(frame[1][1].as_str().unwrap());
                key = Some(SessionKey::from_base64(record["secret"].as_str().unwrap()).unwrap());
                let _ = tx.send(Seen::Identity(record));

                match desktop {
                    Desktop::Deny => send(&mut ws, json!([8, [2, false]])).await,
                    Desktop::HangUp => break,
                    _ => {
                        send(&mut ws, json!([8, [2, true]])).await;
                        // Noise a live session has to shrug off.
                        let _ = ws.send(Message::Text("not a frame".into())).await;
                        send(&mut ws, json!([8, "bm90:YW4gZW52ZWxvcGU="])).await;
                    }
                }
            }
            (Some(6), Some(key)) => {
                let plaintext = crypto::decrypt(key, frame[1].as_str().unwrap()).unwrap();
                let _ = tx.send(Seen::Plaintext(plaintext.to_string()));
                let Ok(message) = AppMessage::decode(&plaintext) else {
                    continue;
                };
                for reply in answer(message, &mut held) {
                    send_sealed(&mut ws, key, reply).await;
                }
            }
            _ => {}
        }
    }

    let _ = tx.send(Seen::Closed);
}

/// The desktop's side of the application protocol.
fn answer(message: AppMessage, held: &mut Option<Request>) -> Vec<AppMessage> {
    match message {
        AppMessage::Version => vec![AppMessage::VersionResponse(VersionInfo {
            version: DESKTOP_VERSION.into(),
            machine_name: MACHINE_NAME.into(),
        })],
        AppMessage::Request(request) => {
            if request.path == SLOW_PATH && held.is_none() {
                *held = Some(request);
                return Vec::new();
            }
            let mut replies = vec![
                AppMessage::Update(Update {
                    path: "/noise".into(),
                    status: 200,
                    body: Value::Null,
                }),
                respond(request),
            ];
            if let Some(slow) = held.take() {
                replies.push(respond(slow));
            }
            replies
        }
        AppMessage::Subscribe(path) => vec![AppMessage::Update(Update {
            body: json!({ "subscribed": path }),
            path,
            status: 200,
        })],
        _ => Vec::new(),
    }
}

fn respond(request: Request) -> AppMessage {
    let status = if request.path == MISSING_PATH { 404 } else { 200 };
    AppMessage::Response(Response {
        id: request.id,
        status,
        body: json!({
            "method": request.method,
            "path": request.path,
            "body": request.body,
        }),
    })
}
