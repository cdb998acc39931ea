use tether_transport::{Link, TransportConfig, TransportError};

/// Opens links to the manager for the runtime.
///
/// In production: [`WsConnector`] (WebSocket).
/// In tests: `MockConnector` (in-process channels, scripted outcomes).
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish one link. Called again after every unexpected close.
    async fn connect(&self) -> Result<Link, TransportError>;
}

/// WebSocket connector built on [`tether_transport::connect`].
#[derive(Debug, Clone)]
pub struct WsConnector {
    config: TransportConfig,
}

impl WsConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        tether_transport::connect(&self.config).await
    }
}

// ── MockConnector (tests) ───────────────────────────────────────────
