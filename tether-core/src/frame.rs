//! Relay and handshake framing.
//!
//! Every WebSocket text message is a JSON array whose first element is the
//! relay opcode:
//!
//! ```text
//! [4, code]               CONNECT         mobile -> relay
//! [5, pubkeyBase64|null]  CONNECT_PUBKEY  relay -> mobile
//! [6, payload]            SEND            mobile -> relay -> desktop
//! [8, payload]            RECEIVE         desktop -> relay -> mobile
//! ```
//!
//! SEND/RECEIVE payloads are opaque to the relay. Before the session is
//! encrypted they carry a [`HandshakeFrame`] (`[1, secret]` / `[2, bool]`);
//! afterwards a single `"iv:ciphertext"` string.
//!
//! The discriminant is validated before anything else is decoded. No fallback.
//! No default.

use serde_json::{json, Value};

use crate::error::ProtocolError;

/// Relay-level opcodes.
pub mod relay_opcode {
    /// Attach to a desktop by pairing code.
    pub const CONNECT: u64 = 4;
    /// Desktop public key, or null when no desktop owns the code.
    pub const CONNECT_PUBKEY: u64 = 5;
    /// Payload for the desktop.
    pub const SEND: u64 = 6;
    /// Payload from the desktop.
    pub const RECEIVE: u64 = 8;
}

/// Unencrypted application opcodes (handshake only).
pub mod handshake_opcode {
    /// RSA-wrapped identity record.
    pub const SECRET: u64 = 1;
    /// Desktop's accept/deny answer.
    pub const SECRET_RESPONSE: u64 = 2;
}

/// A validated relay frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    /// `[4, code]`
    Connect(String),
    /// `[5, pubkey|null]`
    ConnectPubkey(Option<String>),
    /// `[6, payload]`
    Send(Value),
    /// `[8, payload]`
    Receive(Value),
}

impl RelayFrame {
    /// Parse a relay frame from a WebSocket text message.
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a JSON array, the opcode is unknown,
    /// or the argument does not match the opcode.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let mut items = into_items(value)?;
        let opcode = opcode_of(&items)?;

        match opcode {
            relay_opcode::CONNECT => match take_arg(&mut items, 1)? {
                Value::String(code) => Ok(Self::Connect(code)),
                _ => Err(malformed("CONNECT code must be a string")),
            },
            relay_opcode::CONNECT_PUBKEY => match take_arg_or_null(&mut items, 1) {
                Value::Null => Ok(Self::ConnectPubkey(None)),
                Value::String(key) => Ok(Self::ConnectPubkey(Some(key))),
                _ => Err(malformed("CONNECT_PUBKEY must be a string or null")),
            },
            relay_opcode::SEND => Ok(Self::Send(take_arg(&mut items, 1)?)),
            relay_opcode::RECEIVE => Ok(Self::Receive(take_arg(&mut items, 1)?)),
            other => Err(ProtocolError::UnknownRelayOpcode(other)),
        }
    }

    /// Get the relay opcode.
    pub fn opcode(&self) -> u64 {
        match self {
            Self::Connect(_) => relay_opcode::CONNECT,
            Self::ConnectPubkey(_) => relay_opcode::CONNECT_PUBKEY,
            Self::Send(_) => relay_opcode::SEND,
            Self::Receive(_) => relay_opcode::RECEIVE,
        }
    }

    /// Serialize to the wire (compact JSON text).
    pub fn to_wire(&self) -> String {
        let value = match self {
            Self::Connect(code) => json!([relay_opcode::CONNECT, code]),
            Self::ConnectPubkey(key) => json!([relay_opcode::CONNECT_PUBKEY, key]),
            Self::Send(payload) => json!([relay_opcode::SEND, payload]),
            Self::Receive(payload) => json!([relay_opcode::RECEIVE, payload]),
        };
        value.to_string()
    }
}

/// Unencrypted application frames exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFrame {
    /// `[1, encryptedIdentityBase64]`
    Secret(String),
    /// `[2, accepted]`
    SecretResponse(bool),
}

impl HandshakeFrame {
    /// Decode from a SEND/RECEIVE payload.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let mut items = into_items(value)?;
        match opcode_of(&items)? {
            handshake_opcode::SECRET => match take_arg(&mut items, 1)? {
                Value::String(secret) => Ok(Self::Secret(secret)),
                _ => Err(malformed("SECRET must be a string")),
            },
            handshake_opcode::SECRET_RESPONSE => match take_arg(&mut items, 1)? {
                Value::Bool(accepted) => Ok(Self::SecretResponse(accepted)),
                _ => Err(malformed("SECRET_RESPONSE must be a boolean")),
            },
            other => Err(ProtocolError::UnknownAppOpcode(other)),
        }
    }

    /// Encode as a SEND/RECEIVE payload.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Secret(secret) => json!([handshake_opcode::SECRET, secret]),
            Self::SecretResponse(accepted) => json!([handshake_opcode::SECRET_RESPONSE, accepted]),
        }
    }
}

pub(crate) fn malformed(reason: &str) -> ProtocolError {
    ProtocolError::MalformedFrame(reason.to_owned())
}

/// Unwrap a non-empty JSON array.
pub(crate) fn into_items(value: Value) -> Result<Vec<Value>, ProtocolError> {
    match value {
        Value::Array(items) if !items.is_empty() => Ok(items),
        Value::Array(_) => Err(malformed("empty frame")),
        _ => Err(malformed("frame is not an array")),
    }
}

/// Read the integer discriminant at index 0.
pub(crate) fn opcode_of(items: &[Value]) -> Result<u64, ProtocolError> {
    items
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("opcode is not an unsigned integer"))
}

/// Take the argument at `index`, which must be present.
pub(crate) fn take_arg(items: &mut [Value], index: usize) -> Result<Value, ProtocolError> {
    items
        .get_mut(index)
        .map(Value::take)
        .ok_or_else(|| malformed("missing argument"))
}

/// Take the argument at `index`, treating absence as null.
pub(crate) fn take_arg_or_null(items: &mut [Value], index: usize) -> Value {
    items.get_mut(index).map(Value::take).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_wire() {
        let frame = RelayFrame::Connect("ABC123".into());
        assert_eq!(frame.to_wire(), r#"[4,"ABC123"]"#);
        assert_eq!(RelayFrame::parse(r#"[4,"ABC123"]"#).unwrap(), frame);
    }

    #[test]
    fn test_connect_pubkey_null_and_present() {
        assert_eq!(
            RelayFrame::parse("[5,null]").unwrap(),
            RelayFrame::ConnectPubkey(None)
        );
        assert_eq!(
            RelayFrame::parse("[5]").unwrap(),
            RelayFrame::ConnectPubkey(None)
        );
        assert_eq!(
            RelayFrame::parse(r#"[5,"MIIB"]"#).unwrap(),
            RelayFrame::ConnectPubkey(Some("MIIB".into()))
        );
        assert!(matches!(
            RelayFrame::parse("[5,42]"),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_send_carries_opaque_payload() {
        let frame = RelayFrame::Send(json!("aXY=:Y3Q="));
        assert_eq!(frame.to_wire(), r#"[6,"aXY=:Y3Q="]"#);

        let nested = RelayFrame::parse(r#"[8,[2,true]]"#).unwrap();
        assert_eq!(nested, RelayFrame::Receive(json!([2, true])));
        assert_eq!(nested.opcode(), relay_opcode::RECEIVE);
    }

    #[test]
    fn test_unknown_relay_opcode() {
        assert_eq!(
            RelayFrame::parse(r#"[7,"x"]"#),
            Err(ProtocolError::UnknownRelayOpcode(7))
        );
        assert_eq!(
            RelayFrame::parse(r#"[99]"#),
            Err(ProtocolError::UnknownRelayOpcode(99))
        );
    }

    #[test]
    fn test_malformed_relay_frames() {
        for text in ["", "{}", "[]", r#"["4","x"]"#, "[-1]", "[6]", "[4,1]", "not json"] {
            assert!(
                matches!(RelayFrame::parse(text), Err(ProtocolError::MalformedFrame(_))),
                "accepted {text:?}"
            );
        }
    }

    #[test]
    fn test_handshake_frames() {
        let secret = HandshakeFrame::Secret("d3JhcHBlZA==".into());
        assert_eq!(secret.to_value(), json!([1, "d3JhcHBlZA=="]));
        assert_eq!(HandshakeFrame::from_value(secret.to_value()).unwrap(), secret);

        assert_eq!(
            HandshakeFrame::from_value(json!([2, false])).unwrap(),
            HandshakeFrame::SecretResponse(false)
        );
        assert!(matches!(
            HandshakeFrame::from_value(json!([2, "yes"])),
            Err(ProtocolError::MalformedFrame(_))
        ));
        assert_eq!(
            HandshakeFrame::from_value(json!([9, "/x", 200, null])),
            Err(ProtocolError::UnknownAppOpcode(9))
        );
        assert!(HandshakeFrame::from_value(json!("aXY=:Y3Q=")).is_err());
    }
}
