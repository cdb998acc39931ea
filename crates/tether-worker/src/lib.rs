//! Tether worker layer.
//!
//! Keeps a worker connected to its manager on top of `tether-transport`:
//! a delivery queue that survives reconnects, liveness probing, and
//! reconciliation of the worker's configuration against the manager's copy.
//!
//! Wire format: JSON envelopes over one WebSocket.
//! Versions: SHA-256 digest per configuration fragment, base64, `.`-joined.

pub mod error;
pub mod liveness;
pub mod peer;
pub mod queue;
pub mod runtime;
pub mod signer;
pub mod store;
pub mod types;
pub mod validate;
pub mod version;
pub mod worker;

pub use error::WorkerError;
pub use liveness::{poll_until, PollConfig, PROBE_ATTEMPTS, PROBE_INTERVAL};
pub use peer::RemotePeer;
pub use queue::{DeliveryQueue, QueueStats, QueuedEvent};
pub use runtime::{
    Connector, QueueSnapshot, RuntimeChannels, RuntimeConfig, RuntimeHandle, WorkerEvent,
    WorkerRuntime, WsConnector,
};
pub use signer::{append_signature, Ed25519Signer, Signer};
pub use store::{ConfigBackend, ConfigStore, FsBackend, MemoryBackend};
pub use types::{now_ms, ConnectionState, EventId, Fragment, Topic, VERSION_ORDER};
pub use validate::{BasicValidator, SchemaValidator};
pub use version::{
    diff, fragment_digest, Diff, DiffCode, ManagerPeer, PeerVerdict, ReconcileReport, Reconciler,
    Version,
};
pub use worker::{PublishOptions, Published, TriggerHandler, Worker};
