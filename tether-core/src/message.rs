//! Application opcode contract.
//!
//! Once the session is CONNECTED every payload is an encrypted envelope whose
//! plaintext is a JSON array `[opcode, ...]`:
//!
//! ```text
//! [3]                               VERSION
//! [4, version, machineName]         VERSION_RESPONSE
//! [5, path]                         SUBSCRIBE
//! [6, path]                         UNSUBSCRIBE
//! [7, id, path, method, body]       REQUEST
//! [8, id, status, body]             RESPONSE
//! [9, path, status, body]           UPDATE
//! ```
//!
//! Correlation of REQUEST/RESPONSE ids is left to the consuming layer.

use serde_json::{json, Value};

use crate::error::ProtocolError;
use crate::frame::{into_items, malformed, opcode_of, take_arg, take_arg_or_null};

/// Application opcodes carried inside envelopes.
pub mod app_opcode {
    /// Ask the desktop for its version.
    pub const VERSION: u64 = 3;
    /// Desktop version and machine name.
    pub const VERSION_RESPONSE: u64 = 4;
    /// Register interest in a resource path.
    pub const SUBSCRIBE: u64 = 5;
    /// Cancel interest in a resource path.
    pub const UNSUBSCRIBE: u64 = 6;
    /// Correlated call.
    pub const REQUEST: u64 = 7;
    /// Answer to a REQUEST.
    pub const RESPONSE: u64 = 8;
    /// Push for a subscribed path.
    pub const UPDATE: u64 = 9;
}

/// A correlated call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Caller-allocated correlation id.
    pub id: u64,
    /// HTTP-style method.
    pub method: String,
    /// Resource path on the desktop.
    pub path: String,
    /// Optional JSON body (`null` on the wire when absent).
    pub body: Option<Value>,
}

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the originating request.
    pub id: u64,
    /// HTTP-style status.
    pub status: u16,
    /// Response body.
    pub body: Value,
}

/// An uncorrelated push for a subscribed path.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Resource path that changed.
    pub path: String,
    /// HTTP-style status.
    pub status: u16,
    /// New resource state.
    pub body: Value,
}

/// Desktop capability information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Desktop software version.
    pub version: String,
    /// Host machine name.
    pub machine_name: String,
}

/// A decoded application frame.
#[derive(Debug, Clone, PartialEq)]
pub enum AppMessage {
    /// `[3]`
    Version,
    /// `[4, version, machineName]`
    VersionResponse(VersionInfo),
    /// `[5, path]`
    Subscribe(String),
    /// `[6, path]`
    Unsubscribe(String),
    /// `[7, id, path, method, body]`
    Request(Request),
    /// `[8, id, status, body]`
    Response(Response),
    /// `[9, path, status, body]`
    Update(Update),
}

impl AppMessage {
    /// Decode decrypted plaintext.
    ///
    /// # Errors
    ///
    /// Returns error if the plaintext is not a JSON array, the opcode is
    /// unknown (handshake opcodes included), or an argument has the wrong type.
    pub fn decode(plaintext: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(plaintext)?;
        let mut items = into_items(value)?;

        match opcode_of(&items)? {
            app_opcode::VERSION => Ok(Self::Version),
            app_opcode::VERSION_RESPONSE => Ok(Self::VersionResponse(VersionInfo {
                version: string_arg(&mut items, 1)?,
                machine_name: string_arg(&mut items, 2)?,
            })),
            app_opcode::SUBSCRIBE => Ok(Self::Subscribe(string_arg(&mut items, 1)?)),
            app_opcode::UNSUBSCRIBE => Ok(Self::Unsubscribe(string_arg(&mut items, 1)?)),
            app_opcode::REQUEST => {
                let id = id_arg(&mut items, 1)?;
                let path = string_arg(&mut items, 2)?;
                let method = string_arg(&mut items, 3)?;
                let body = match take_arg_or_null(&mut items, 4) {
                    Value::Null => None,
                    body => Some(body),
                };
                Ok(Self::Request(Request {
                    id,
                    method,
                    path,
                    body,
                }))
            }
            app_opcode::RESPONSE => Ok(Self::Response(Response {
                id: id_arg(&mut items, 1)?,
                status: status_arg(&mut items, 2)?,
                body: take_arg_or_null(&mut items, 3),
            })),
            app_opcode::UPDATE => Ok(Self::Update(Update {
                path: string_arg(&mut items, 1)?,
                status: status_arg(&mut items, 2)?,
                body: take_arg_or_null(&mut items, 3),
            })),
            other => Err(ProtocolError::UnknownAppOpcode(other)),
        }
    }

    /// Encode to plaintext, ready for encryption.
    pub fn encode(&self) -> String {
        let value = match self {
            Self::Version => json!([app_opcode::VERSION]),
            Self::VersionResponse(info) => json!([
                app_opcode::VERSION_RESPONSE,
                info.version,
                info.machine_name
            ]),
            Self::Subscribe(path) => json!([app_opcode::SUBSCRIBE, path]),
            Self::Unsubscribe(path) => json!([app_opcode::UNSUBSCRIBE, path]),
            Self::Request(req) => json!([
                app_opcode::REQUEST,
                req.id,
                req.path,
                req.method,
                req.body
            ]),
            Self::Response(resp) => json!([app_opcode::RESPONSE, resp.id, resp.status, resp.body]),
            Self::Update(update) => {
                json!([app_opcode::UPDATE, update.path, update.status, update.body])
            }
        };
        value.to_string()
    }

    /// Get the application opcode.
    pub fn opcode(&self) -> u64 {
        match self {
            Self::Version => app_opcode::VERSION,
            Self::VersionResponse(_) => app_opcode::VERSION_RESPONSE,
            Self::Subscribe(_) => app_opcode::SUBSCRIBE,
            Self::Unsubscribe(_) => app_opcode::UNSUBSCRIBE,
            Self::Request(_) => app_opcode::REQUEST,
            Self::Response(_) => app_opcode::RESPONSE,
            Self::Update(_) => app_opcode::UPDATE,
        }
    }
}

fn string_arg(items: &mut [Value], index: usize) -> Result<String, ProtocolError> {
    match take_arg(items, index)? {
        Value::String(s) => Ok(s),
        _ => Err(malformed("expected a string argument")),
    }
}

fn id_arg(items: &mut [Value], index: usize) -> Result<u64, ProtocolError> {
    take_arg(items, index)?
        .as_u64()
        .ok_or_else(|| malformed("id must be an unsigned integer"))
}

fn status_arg(items: &mut [Value], index: usize) -> Result<u16, ProtocolError> {
    take_arg(items, index)?
        .as_u64()
        .and_then(|s| u16::try_from(s).ok())
        .ok_or_else(|| malformed("status must fit in u16"))
}
