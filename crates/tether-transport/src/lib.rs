//! Tether transport layer.
//!
//! A single WebSocket link from a worker to its manager, plus the JSON
//! envelope codec spoken over it. The link is exposed as a pair of
//! channels so the owning runtime never touches the socket directly.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use tether_transport::{Credentials, Envelope, Topic, TransportConfig, TransportEvent};
//!
//! # async fn example() -> Result<(), tether_transport::TransportError> {
//! let url = "https://manager.example.org:443".parse().unwrap();
//! let credentials: Credentials = "worker-1:secret".parse()?;
//! let mut link = tether_transport::connect(&TransportConfig::new(url, credentials)).await?;
//!
//! let ping = Envelope::new(Topic::Ping, serde_json::json!({}));
//! link.sender.send_text(ping.to_text()).await?;
//!
//! if let Some(TransportEvent::Text(text)) = link.events.recv().await {
//!     println!("manager said: {text}");
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod envelope;
mod error;

pub use config::TransportConfig;
pub use connection::{connect, Frame, Link, LinkSender, RemoteEnd, TransportEvent};
pub use envelope::{now_ms, Envelope, Inbound, Response, Topic, CODE_OK, CODE_STALE_SETTINGS};
pub use error::TransportError;

use std::fmt;
use std::str::FromStr;

/// Close code for a deliberate, terminal shutdown of the link.
pub const NORMAL_CLOSE: u16 = 1000;

/// Close code reported when the link dropped without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

/// Path on the manager that accepts worker connections.
pub const CONNECTOR_PATH: &str = "/connector/";

/// Worker identity and API key, presented to the manager on connect.
///
/// Parsed from and rendered to the `id:apikey` form used in the worker's
/// configuration document. `Debug` never prints the key.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    id: String,
    api_key: String,
}

impl Credentials {
    pub fn new(id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            api_key: api_key.into(),
        }
    }

    /// The worker id (the part before `:`).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// The `id:apikey` form, as stored in the configuration document.
    pub fn to_pair(&self) -> String {
        format!("{}:{}", self.id, self.api_key)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials({}:***)", self.id)
    }
}

impl FromStr for Credentials {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((id, key)) if !id.is_empty() && !key.is_empty() => Ok(Self::new(id, key)),
            _ => Err(TransportError::Config(
                "credentials must have the form <id>:<apikey>".to_string(),
            )),
        }
    }
}
