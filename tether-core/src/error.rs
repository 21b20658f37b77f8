//! Protocol and crypto errors.
//!
//! Crypto errors are always surfaced to the caller. Protocol errors on a live
//! session are local to the offending frame: the session logs them, drops the
//! frame and carries on. During the handshake either kind is fatal.

use thiserror::Error;

/// Failures of the symmetric or asymmetric layer.
///
/// Deliberately terse. Do not leak key or plaintext details.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Symmetric key is not 32 bytes.
    #[error("invalid key length")]
    InvalidKeyLength,

    /// A base64 field did not decode.
    #[error("invalid base64")]
    InvalidBase64,

    /// Envelope is not `iv:ciphertext` or has the wrong shape.
    #[error("malformed envelope")]
    MalformedEnvelope,

    /// PKCS#7 padding check failed (wrong key or corrupted ciphertext).
    #[error("bad padding")]
    BadPadding,

    /// Decrypted bytes are not UTF-8.
    #[error("invalid utf-8")]
    InvalidUtf8,

    /// Peer public key is not a base64 SPKI RSA key.
    #[error("unsupported public key")]
    UnsupportedPublicKey,

    /// OAEP plaintext exceeds the key's capacity.
    #[error("plaintext too large for rsa-oaep: {len} > {max}")]
    PlaintextTooLarge {
        /// Plaintext length in bytes.
        len: usize,
        /// Maximum OAEP payload for the key.
        max: usize,
    },

    /// The RSA primitive itself failed.
    #[error("rsa failure: {0}")]
    Rsa(String),

    /// A plaintext record could not be serialized before encryption.
    #[error("record encoding failed: {0}")]
    Encoding(String),
}

/// Frame-level and lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame is not a JSON array of the expected shape.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Relay opcode outside the known set.
    #[error("unknown relay opcode {0}")]
    UnknownRelayOpcode(u64),

    /// Application opcode outside the known set.
    #[error("unknown application opcode {0}")]
    UnknownAppOpcode(u64),

    /// Frame is valid but not allowed in the current state.
    #[error("unexpected frame in state {0}")]
    UnexpectedFrame(&'static str),

    /// Desktop answered SECRET_RESPONSE(false).
    #[error("handshake rejected by desktop")]
    HandshakeRejected,

    /// Operation requires a CONNECTED session.
    #[error("not connected")]
    NotConnected,

    /// Session reached a terminal state.
    #[error("session terminated")]
    SessionTerminated,

    /// Symmetric or asymmetric failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedFrame(e.to_string())
    }
}
