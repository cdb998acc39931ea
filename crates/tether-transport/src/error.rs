/// Errors returned by the Tether transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("send failed: {0}")]
    Send(#[source] anyhow::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] anyhow::Error),

    #[error("envelope serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("envelope deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid manager url: {0}")]
    InvalidUrl(String),

    #[error("link is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_message_too_large() {
        let err = TransportError::MessageTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "message too large: 10 bytes (max 4)");
    }

    #[test]
    fn display_connect() {
        let err = TransportError::Connect {
            endpoint: "ws://localhost:1/connector/".into(),
            source: anyhow::anyhow!("refused"),
        };
        assert_eq!(
            err.to_string(),
            "connection to ws://localhost:1/connector/ failed: refused"
        );
    }

    #[test]
    fn display_closed() {
        assert_eq!(TransportError::Closed.to_string(), "link is closed");
    }
}
