//! Session cryptography.
//!
//! One backend, two primitives:
//! - AES-256-CBC with PKCS#7 padding for every application payload. A fresh
//!   16-byte IV is drawn from the OS CSPRNG on every call.
//! - RSA-OAEP (SHA-256, MGF1-SHA-256) for wrapping the identity record with
//!   the desktop's public key. No other RSA padding is supported.
//!
//! Base64 (standard alphabet, padded) is the only representation that crosses
//! this module's boundary. Envelopes are `"{iv}:{ciphertext}"`.

use std::fmt;

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Symmetric key length (AES-256).
pub const KEY_LEN: usize = 32;

/// CBC IV length (one AES block).
pub const IV_LEN: usize = 16;

/// SHA-256 digest length, used by the OAEP bound.
const OAEP_HASH_LEN: usize = 32;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// The per-session symmetric key.
///
/// Generated locally, never persisted, zeroized on drop. Only ever leaves the
/// process inside the RSA-wrapped identity record.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Draw 32 bytes from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Wrap existing key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode a base64 key, as carried in the identity record.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded)
                .map_err(|_| CryptoError::InvalidBase64)?,
        );
        let key: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self(key))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Base64 form for the identity record.
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.0))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// An encrypted payload: base64 IV and base64 ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    iv: String,
    ciphertext: String,
}

impl Envelope {
    /// Split an `"iv:ciphertext"` string.
    ///
    /// Only the shape is checked here; the fields are validated when decoded.
    pub fn parse(wire: &str) -> Result<Self, CryptoError> {
        let (iv, ciphertext) = wire.split_once(':').ok_or(CryptoError::MalformedEnvelope)?;
        if iv.is_empty() || ciphertext.is_empty() || ciphertext.contains(':') {
            return Err(CryptoError::MalformedEnvelope);
        }
        Ok(Self {
            iv: iv.to_owned(),
            ciphertext: ciphertext.to_owned(),
        })
    }

    /// Base64 IV.
    pub fn iv(&self) -> &str {
        &self.iv
    }

    /// Base64 ciphertext.
    pub fn ciphertext(&self) -> &str {
        &self.ciphertext
    }

    fn decode_iv(&self) -> Result<[u8; IV_LEN], CryptoError> {
        let bytes = STANDARD
            .decode(&self.iv)
            .map_err(|_| CryptoError::InvalidBase64)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::MalformedEnvelope)
    }

    fn decode_ciphertext(&self) -> Result<Vec<u8>, CryptoError> {
        let bytes = STANDARD
            .decode(&self.ciphertext)
            .map_err(|_| CryptoError::InvalidBase64)?;
        if bytes.is_empty() || bytes.len() % IV_LEN != 0 {
            return Err(CryptoError::MalformedEnvelope);
        }
        Ok(bytes)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.iv, self.ciphertext)
    }
}

/// Symmetric layer used once the session is CONNECTED.
pub trait SymmetricCipher {
    /// Encrypt UTF-8 plaintext into an `"iv:ciphertext"` envelope.
    fn encrypt(&self, key: &SessionKey, plaintext: &str) -> Result<String, CryptoError>;

    /// Decrypt an envelope back to UTF-8 plaintext.
    ///
    /// Must fail, never return garbage, on bad padding or invalid UTF-8.
    fn decrypt(&self, key: &SessionKey, envelope: &str) -> Result<Zeroizing<String>, CryptoError>;
}

/// Asymmetric layer used once per handshake.
pub trait AsymmetricCipher {
    /// Largest plaintext accepted by [`AsymmetricCipher::encrypt`].
    fn max_plaintext_len(&self) -> usize;

    /// Encrypt and return base64 ciphertext.
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError>;
}

/// AES-256-CBC, PKCS#7, random IV per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesCbc;

impl SymmetricCipher for AesCbc {
    fn encrypt(&self, key: &SessionKey, plaintext: &str) -> Result<String, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        Ok(Envelope {
            iv: STANDARD.encode(iv),
            ciphertext: STANDARD.encode(ciphertext),
        }
        .to_string())
    }

    fn decrypt(&self, key: &SessionKey, envelope: &str) -> Result<Zeroizing<String>, CryptoError> {
        let envelope = Envelope::parse(envelope)?;
        let iv = envelope.decode_iv()?;
        let ciphertext = envelope.decode_ciphertext()?;

        let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), &iv)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let plaintext = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CryptoError::BadPadding)?;

        String::from_utf8(plaintext)
            .map(Zeroizing::new)
            .map_err(|e| {
                let mut bytes = e.into_bytes();
                bytes.zeroize();
                CryptoError::InvalidUtf8
            })
    }
}

/// RSA-OAEP-SHA256 with a peer's public key.
#[derive(Debug, Clone)]
pub struct RsaOaep {
    key: RsaPublicKey,
}

impl RsaOaep {
    /// Wrap an already-parsed key.
    pub fn new(key: RsaPublicKey) -> Self {
        Self { key }
    }

    /// Parse a base64 SPKI (DER) public key as sent in CONNECT_PUBKEY.
    pub fn from_spki_base64(encoded: &str) -> Result<Self, CryptoError> {
        let der = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CryptoError::UnsupportedPublicKey)?;
        let key =
            RsaPublicKey::from_public_key_der(&der).map_err(|_| CryptoError::UnsupportedPublicKey)?;
        Ok(Self { key })
    }

    /// Modulus size in bytes.
    pub fn modulus_len(&self) -> usize {
        self.key.size()
    }
}

impl AsymmetricCipher for RsaOaep {
    fn max_plaintext_len(&self) -> usize {
        self.key.size().saturating_sub(2 * OAEP_HASH_LEN + 2)
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let max = self.max_plaintext_len();
        if plaintext.len() > max {
            return Err(CryptoError::PlaintextTooLarge {
                len: plaintext.len(),
                max,
            });
        }

        let ciphertext = self
            .key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;
        Ok(STANDARD.encode(ciphertext))
    }
}

/// Encrypt with the session key. See [`AesCbc`].
pub fn encrypt(key: &SessionKey, plaintext: &str) -> Result<String, CryptoError> {
    AesCbc.encrypt(key, plaintext)
}

/// Decrypt with the session key. See [`AesCbc`].
pub fn decrypt(key: &SessionKey, envelope: &str) -> Result<Zeroizing<String>, CryptoError> {
    AesCbc.decrypt(key, envelope)
}
