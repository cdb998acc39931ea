use std::path::PathBuf;

/// Worker-level errors for Tether.
///
/// Wraps transport errors and adds the session, reconciliation and
/// storage failures the worker can surface to its caller.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("transport error: {0}")]
    Transport(#[from] tether_transport::TransportError),

    #[error("could not establish session: {0}")]
    Connect(String),

    #[error("timed out waiting for {what}")]
    Timeout { what: String },

    #[error("cancelled by deliberate close")]
    Cancelled,

    #[error("reconciliation failed: {0}")]
    Reconcile(String),

    #[error("invalid payload: {0}")]
    Validation(String),

    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manager rejected event (code {code}): {msg}")]
    Rejected { code: u16, msg: String },

    #[error("signer error: {0}")]
    Signer(String),

    #[error("runtime shut down")]
    Shutdown,
}

impl WorkerError {
    pub(crate) fn timeout(what: impl Into<String>) -> Self {
        WorkerError::Timeout { what: what.into() }
    }
}
