//! Transport configuration.

use std::time::Duration;

use tether_core::DeviceIdentity;
use url::Url;

use crate::error::TransportError;

/// Default deadline for reaching CONNECTED.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for one pairing attempt.
///
/// This struct does not implement `Clone`: a configuration describes a single
/// session, and retrying means building a new one with a fresh pairing code.
#[derive(Debug)]
pub struct TransportConfig {
    /// Relay base URL (`http`, `https`, `ws` or `wss`).
    pub relay_url: String,
    /// Short-lived code identifying the desktop session.
    pub pairing_code: String,
    /// Identity presented to the desktop in the handshake.
    pub device: DeviceIdentity,
    /// Deadline covering socket connect, CONNECT_PUBKEY and SECRET_RESPONSE.
    pub handshake_timeout: Duration,
}

impl TransportConfig {
    /// Create a configuration with the default handshake timeout.
    pub fn new(
        relay_url: impl Into<String>,
        pairing_code: impl Into<String>,
        device: DeviceIdentity,
    ) -> Self {
        Self {
            relay_url: relay_url.into(),
            pairing_code: pairing_code.into(),
            device,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Override the handshake deadline.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// `TETHER_RELAY_URL` and `TETHER_PAIRING_CODE` are required.
    /// `TETHER_DEVICE_ID`, `TETHER_DEVICE_DESCRIPTION` and
    /// `TETHER_HANDSHAKE_TIMEOUT_SECS` are optional.
    pub fn from_env() -> Result<Self, TransportError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] if a required variable is missing or
    /// the timeout is not a whole number of seconds.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TransportError> {
        let require = |name: &str| {
            lookup(name).ok_or_else(|| TransportError::Config(format!("{name} is not set")))
        };
        let relay_url = require("TETHER_RELAY_URL")?;
        let pairing_code = require("TETHER_PAIRING_CODE")?;
        let identity = lookup("TETHER_DEVICE_ID").unwrap_or_else(|| "tether".into());
        let description =
            lookup("TETHER_DEVICE_DESCRIPTION").unwrap_or_else(default_description);

        let mut config = Self::new(
            relay_url,
            pairing_code,
            DeviceIdentity::new(identity, description),
        );

        if let Some(val) = lookup("TETHER_HANDSHAKE_TIMEOUT_SECS") {
            let secs: u64 = val.trim().parse().map_err(|_| {
                TransportError::Config(format!(
                    "TETHER_HANDSHAKE_TIMEOUT_SECS must be whole seconds, got {val:?}"
                ))
            })?;
            config.handshake_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// The relay's mobile endpoint: `ws(s)://<host>/mobile?code=<pairingCode>`.
    ///
    /// `http` maps to `ws` and `https` to `wss`; any other scheme but `ws`
    /// and `wss` is rejected.
    pub fn mobile_url(&self) -> Result<Url, TransportError> {
        mobile_url(&self.relay_url, &self.pairing_code)
    }
}

/// Derive the mobile endpoint from a relay base URL.
pub fn mobile_url(relay_url: &str, pairing_code: &str) -> Result<Url, TransportError> {
    if pairing_code.is_empty() {
        return Err(TransportError::InvalidUrl("empty pairing code".into()));
    }

    let base = Url::parse(relay_url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme {other}"
            )))
        }
    };

    let host = base
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl("missing host".into()))?;
    let authority = match base.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };

    let mut url = Url::parse(&format!("{scheme}://{authority}/mobile"))
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    url.query_pairs_mut().append_pair("code", pairing_code);
    Ok(url)
}

fn default_description() -> String {
    format!("tether ({})", std::env::consts::OS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_maps_to_ws() {
        let url = mobile_url("http://relay.example.com", "ABC123").unwrap();
        assert_eq!(url.as_str(), "ws://relay.example.com/mobile?code=ABC123");
    }

    #[test]
    fn test_https_maps_to_wss_and_keeps_port() {
        let url = mobile_url("https://relay.example.com:8443/", "ABC123").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com:8443/mobile?code=ABC123");
    }

    #[test]
    fn test_ws_schemes_pass_through() {
        assert_eq!(
            mobile_url("ws://127.0.0.1:51001", "X").unwrap().as_str(),
            "ws://127.0.0.1:51001/mobile?code=X"
        );
        assert_eq!(
            mobile_url("wss://relay.example.com", "X").unwrap().scheme(),
            "wss"
        );
    }

    #[test]
    fn test_code_is_percent_encoded() {
        let url = mobile_url("http://relay", "a b&c").unwrap();
        assert_eq!(url.query(), Some("code=a+b%26c"));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            mobile_url("ftp://relay", "ABC"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            mobile_url("not a url", "ABC"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            mobile_url("http://relay", ""),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_builder() {
        let config = TransportConfig::new(
            "https://relay",
            "ABC123",
            DeviceIdentity::new("id", "desc"),
        )
        .with_handshake_timeout(Duration::from_secs(3));
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
        assert_eq!(
            config.mobile_url().unwrap().as_str(),
            "wss://relay/mobile?code=ABC123"
        );
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: std::collections::HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_from_lookup_full() {
        let config = TransportConfig::from_lookup(vars(&[
            ("TETHER_RELAY_URL", "https://relay.example.com"),
            ("TETHER_PAIRING_CODE", "ABC123"),
            ("TETHER_DEVICE_ID", "device-1"),
            ("TETHER_DEVICE_DESCRIPTION", "Test Phone"),
            ("TETHER_HANDSHAKE_TIMEOUT_SECS", "25"),
        ]))
        .unwrap();
        assert_eq!(config.pairing_code, "ABC123");
        assert_eq!(config.device, DeviceIdentity::new("device-1", "Test Phone"));
        assert_eq!(config.handshake_timeout, Duration::from_secs(25));
        assert_eq!(
            config.mobile_url().unwrap().as_str(),
            "wss://relay.example.com/mobile?code=ABC123"
        );
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = TransportConfig::from_lookup(vars(&[
            ("TETHER_RELAY_URL", "http://relay"),
            ("TETHER_PAIRING_CODE", "X"),
        ]))
        .unwrap();
        assert_eq!(config.device.identity, "tether");
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
    }

    #[test]
    fn test_from_lookup_missing_required() {
        let err = TransportConfig::from_lookup(vars(&[("TETHER_RELAY_URL", "http://relay")]))
            .unwrap_err();
        assert!(matches!(err, TransportError::Config(msg) if msg.contains("TETHER_PAIRING_CODE")));

        let err = TransportConfig::from_lookup(vars(&[("TETHER_PAIRING_CODE", "X")])).unwrap_err();
        assert!(matches!(err, TransportError::Config(msg) if msg.contains("TETHER_RELAY_URL")));
    }

    #[test]
    fn test_from_lookup_rejects_bad_timeout() {
        for bad in ["ten", "-1", "1.5", ""] {
            let result = TransportConfig::from_lookup(vars(&[
                ("TETHER_RELAY_URL", "http://relay"),
                ("TETHER_PAIRING_CODE", "X"),
                ("TETHER_HANDSHAKE_TIMEOUT_SECS", bad),
            ]));
            assert!(
                matches!(result, Err(TransportError::Config(_))),
                "{bad:?} accepted"
            );
        }
    }
}
