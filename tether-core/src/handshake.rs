//! Session-key handshake.
//!
//! 1. Generate a fresh 32-byte session key.
//! 2. Build the identity record `{secret, deviceIdentity, deviceDescription}`.
//! 3. Serialize it compactly and RSA-OAEP-encrypt it in one pass with the
//!    desktop's public key.
//! 4. Send `SECRET[wrapped]`, the only payload not covered by the session key.
//! 5. Await `SECRET_RESPONSE[accepted]`.
//!
//! The key is consumed by [`Handshake::finish`]: accepted hands it to the
//! session, denied drops (and zeroizes) it.

use serde::Serialize;
use zeroize::Zeroizing;

use crate::crypto::{AsymmetricCipher, RsaOaep, SessionKey};
use crate::error::{CryptoError, ProtocolError};
use crate::frame::HandshakeFrame;

/// Caller-supplied device identity.
///
/// A stable identifier generated once by the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Stable device identifier.
    pub identity: String,
    /// Human-readable description shown on the desktop.
    pub description: String,
}

impl DeviceIdentity {
    /// Create an identity.
    pub fn new(identity: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            description: description.into(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRecord<'a> {
    secret: &'a str,
    device_identity: &'a str,
    device_description: &'a str,
}

/// An in-flight handshake. Owns the session key until accepted.
#[derive(Debug)]
pub struct Handshake {
    key: SessionKey,
}

impl Handshake {
    /// Start a handshake against the desktop's base64 SPKI public key.
    ///
    /// Returns the handshake and the SECRET frame to send.
    ///
    /// # Errors
    ///
    /// Fails on an unparseable key or an identity record too large for the
    /// key's OAEP capacity. Nothing is truncated.
    pub fn begin(
        peer_public_key: &str,
        device: &DeviceIdentity,
    ) -> Result<(Self, HandshakeFrame), CryptoError> {
        let peer = RsaOaep::from_spki_base64(peer_public_key)?;
        Self::begin_with(&peer, device)
    }

    /// Start a handshake with an already-parsed asymmetric cipher.
    pub fn begin_with(
        peer: &impl AsymmetricCipher,
        device: &DeviceIdentity,
    ) -> Result<(Self, HandshakeFrame), CryptoError> {
        let key = SessionKey::generate();
        let secret = key.to_base64();

        let record = IdentityRecord {
            secret: &secret,
            device_identity: &device.identity,
            device_description: &device.description,
        };
        let plaintext = encode_record(&record)?;

        let max = peer.max_plaintext_len();
        if plaintext.len() > max {
            return Err(CryptoError::PlaintextTooLarge {
                len: plaintext.len(),
                max,
            });
        }

        let wrapped = peer.encrypt(&plaintext)?;
        Ok((Self { key }, HandshakeFrame::Secret(wrapped)))
    }

    /// Conclude the handshake with the desktop's answer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::HandshakeRejected`] when denied; the key is
    /// dropped with `self`.
    pub fn finish(self, accepted: bool) -> Result<SessionKey, ProtocolError> {
        if accepted {
            Ok(self.key)
        } else {
            Err(ProtocolError::HandshakeRejected)
        }
    }
}

/// Compact JSON, zeroized on drop.
fn encode_record(record: &impl Serialize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    serde_json::to_vec(record)
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use rand::rngs::OsRng;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::{Oaep, RsaPrivateKey};
    use sha2::Sha256;

    fn keypair(bits: usize) -> (RsaPrivateKey, String) {
        let private = RsaPrivateKey::new(&mut OsRng, bits).unwrap();
        let spki = private.to_public_key().to_public_key_der().unwrap();
        (private, STANDARD.encode(spki.as_bytes()))
    }

    fn unwrap_secret(private: &RsaPrivateKey, frame: &HandshakeFrame) -> serde_json::Value {
        let HandshakeFrame::Secret(wrapped) = frame else {
            panic!("expected SECRET");
        };
        let ct = STANDARD.decode(wrapped).unwrap();
        let pt = private.decrypt(Oaep::new::<Sha256>(), &ct).unwrap();
        serde_json::from_slice(&pt).unwrap()
    }

    #[test]
    fn test_identity_record_is_recoverable() {
        let (private, spki) = keypair(2048);
        let device = DeviceIdentity::new("3f1c9a2e-device", "Pixel 8 (Android 15)");
        let (handshake, frame) = Handshake::begin(&spki, &device).unwrap();

        let record = unwrap_secret(&private, &frame);
        assert_eq!(record["deviceIdentity"], "3f1c9a2e-device");
        assert_eq!(record["deviceDescription"], "Pixel 8 (Android 15)");

        let secret = record["secret"].as_str().unwrap();
        let key = handshake.finish(true).unwrap();
        assert_eq!(SessionKey::from_base64(secret).unwrap().as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_denied_handshake() {
        let (_private, spki) = keypair(2048);
        let device = DeviceIdentity::new("id", "desc");
        let (handshake, _) = Handshake::begin(&spki, &device).unwrap();
        assert_eq!(
            handshake.finish(false).unwrap_err(),
            ProtocolError::HandshakeRejected
        );
    }

    #[test]
    fn test_oversize_identity_fails_loudly() {
        let (_private, spki) = keypair(2048);
        let device = DeviceIdentity::new("id", "d".repeat(200));
        let err = Handshake::begin(&spki, &device).unwrap_err();
        assert!(matches!(err, CryptoError::PlaintextTooLarge { max: 190, .. }));
    }

    #[test]
    fn test_bad_public_key() {
        let device = DeviceIdentity::new("id", "desc");
        assert_eq!(
            Handshake::begin("definitely-not-a-key", &device).unwrap_err(),
            CryptoError::UnsupportedPublicKey
        );
    }

    #[test]
    fn test_fresh_key_per_handshake() {
        let (_private, spki) = keypair(2048);
        let device = DeviceIdentity::new("id", "desc");
        let (a, _) = Handshake::begin(&spki, &device).unwrap();
        let (b, _) = Handshake::begin(&spki, &device).unwrap();
        assert_ne!(
            a.finish(true).unwrap().as_bytes(),
            b.finish(true).unwrap().as_bytes()
        );
    }

    #[test]
    fn test_record_encoding_failure_is_not_an_rsa_error() {
        use std::collections::HashMap;

        // JSON object keys must be strings.
        let unencodable: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
        assert!(matches!(
            encode_record(&unencodable),
            Err(CryptoError::Encoding(_))
        ));

        let record = IdentityRecord {
            secret: "s",
            device_identity: "id",
            device_description: "desc",
        };
        assert_eq!(
            encode_record(&record).unwrap().as_slice(),
            br#"{"secret":"s","deviceIdentity":"id","deviceDescription":"desc"}"#
        );
    }
}
