//! Tether Protocol Core
//!
//! Sans-IO core of the mobile ↔ desktop pairing tunnel.
//!
//! This crate provides:
//! - AES-256-CBC envelopes and RSA-OAEP key wrapping
//! - Relay and handshake frame codecs
//! - The application opcode contract
//! - The session-key handshake
//! - The connection state machine
//!
//! # Invariants
//!
//! - No application payload leaves the session unencrypted except the
//!   RSA-wrapped identity record
//! - The session key is generated locally and only transmitted RSA-wrapped
//! - CONNECTED is reached only through an accepted handshake
//! - Terminal states are final; retrying means building a new `Session`
//! - Malformed frames on a live session are dropped, never fatal

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod crypto;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod state;

pub use crypto::{AesCbc, AsymmetricCipher, RsaOaep, SessionKey, SymmetricCipher};
pub use error::{CryptoError, ProtocolError};
pub use frame::{HandshakeFrame, RelayFrame};
pub use handshake::{DeviceIdentity, Handshake};
pub use message::{AppMessage, Request, Response, Update, VersionInfo};
pub use state::{ConnectionState, Session, SessionOutput};
