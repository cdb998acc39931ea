use std::time::Duration;

use base64::Engine as _;
use url::Url;

use crate::{Credentials, TransportError, CONNECTOR_PATH};

/// Configuration for the link to the manager.
///
/// Use the builder pattern:
///
/// ```rust
/// use tether_transport::{Credentials, TransportConfig};
///
/// let config = TransportConfig::new(
///     "https://manager.example.org".parse().unwrap(),
///     Credentials::new("worker-1", "secret"),
/// )
/// .max_message_size(2 * 1024 * 1024)
/// .inbound_buffer(512);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Manager base URL (`http(s)://host:port`).
    pub(crate) manager_url: Url,
    /// Worker id and API key sent with the handshake.
    pub(crate) credentials: Credentials,
    /// Use `wss` instead of `ws`.
    pub(crate) secure: bool,
    /// Request path on the manager.
    pub(crate) path: String,
    /// Maximum message size in either direction, in bytes.
    pub(crate) max_message_size: usize,
    /// Channel buffer for frames waiting to be written.
    pub(crate) outbound_buffer: usize,
    /// Channel buffer for frames read from the manager.
    pub(crate) inbound_buffer: usize,
    /// Upper bound on the TCP + TLS + WebSocket handshake.
    pub(crate) connect_timeout: Duration,
}

impl TransportConfig {
    /// Environment variable read by [`TransportConfig::from_env`].
    pub const MANAGER_URL_ENV: &'static str = "TETHER_MANAGER_URL";

    /// Create a config with defaults.
    ///
    /// The transport is encrypted (`wss`) when the manager URL uses
    /// `https` or `wss`. Override with [`.secure()`](Self::secure).
    pub fn new(manager_url: Url, credentials: Credentials) -> Self {
        let secure = matches!(manager_url.scheme(), "https" | "wss");
        Self {
            manager_url,
            credentials,
            secure,
            path: CONNECTOR_PATH.to_string(),
            max_message_size: 1024 * 1024, // 1 MB
            outbound_buffer: 256,
            inbound_buffer: 256,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Create a config whose manager URL comes from `TETHER_MANAGER_URL`.
    pub fn from_env(credentials: Credentials) -> Result<Self, TransportError> {
        let raw = std::env::var(Self::MANAGER_URL_ENV).map_err(|_| {
            TransportError::Config(format!("{} is not set", Self::MANAGER_URL_ENV))
        })?;
        let url = raw
            .parse()
            .map_err(|e| TransportError::InvalidUrl(format!("{raw}: {e}")))?;
        Ok(Self::new(url, credentials))
    }

    /// Force plain (`false`) or encrypted (`true`) transport.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Set the request path (default: `/connector/`).
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set maximum message size (default: 1 MB).
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set the outbound frame buffer (default: 256).
    pub fn outbound_buffer(mut self, capacity: usize) -> Self {
        self.outbound_buffer = capacity;
        self
    }

    /// Set the inbound frame buffer (default: 256).
    pub fn inbound_buffer(mut self, capacity: usize) -> Self {
        self.inbound_buffer = capacity;
        self
    }

    /// Set the handshake timeout (default: 10 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// The WebSocket endpoint: `ws[s]://host:port/connector/`.
    ///
    /// Credentials are not embedded in the URL; they travel in the
    /// `Authorization` header (see [`authorization`](Self::authorization)).
    pub fn endpoint(&self) -> Result<Url, TransportError> {
        let host = self
            .manager_url
            .host_str()
            .ok_or_else(|| TransportError::InvalidUrl(format!("{} has no host", self.manager_url)))?;
        let scheme = if self.secure { "wss" } else { "ws" };
        let port = self
            .manager_url
            .port()
            .unwrap_or(if self.secure { 443 } else { 80 });

        let raw = format!("{scheme}://{host}:{port}{}", self.path);
        raw.parse()
            .map_err(|e| TransportError::InvalidUrl(format!("{raw}: {e}")))
    }

    /// `Basic` authorization header value for the handshake.
    pub fn authorization(&self) -> String {
        let token = base64::engine::general_purpose::STANDARD.encode(self.credentials.to_pair());
        format!("Basic {token}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("w1", "key")
    }

    #[test]
    fn https_manager_selects_wss() {
        let config = TransportConfig::new("https://manager.local:8443".parse().unwrap(), creds());
        assert!(config.is_secure());
        assert_eq!(
            config.endpoint().unwrap().as_str(),
            "wss://manager.local:8443/connector/"
        );
    }

    #[test]
    fn http_manager_selects_ws_and_default_port() {
        let config = TransportConfig::new("http://manager.local".parse().unwrap(), creds());
        assert!(!config.is_secure());
        let endpoint = config.endpoint().unwrap();
        assert_eq!(endpoint.port_or_known_default(), Some(80));
        assert_eq!(endpoint.as_str(), "ws://manager.local/connector/");
    }

    #[test]
    fn secure_flag_overrides_scheme() {
        let config = TransportConfig::new("http://manager.local:9000".parse().unwrap(), creds())
            .secure(true)
            .path("/workers/");
        assert_eq!(
            config.endpoint().unwrap().as_str(),
            "wss://manager.local:9000/workers/"
        );
    }

    #[test]
    fn authorization_is_basic_pair() {
        let config = TransportConfig::new("http://m:1".parse().unwrap(), creds());
        // base64("w1:key")
        assert_eq!(config.authorization(), "Basic dzE6a2V5");
    }

    #[test]
    fn url_without_host_is_rejected() {
        let config = TransportConfig::new("data:text/plain,hi".parse().unwrap(), creds());
        assert!(matches!(
            config.endpoint(),
            Err(TransportError::InvalidUrl(_))
        ));
    }
}
