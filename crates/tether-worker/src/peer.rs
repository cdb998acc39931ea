//! The manager as a reconciliation peer, reached through the runtime.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::WorkerError;
use crate::runtime::RuntimeHandle;
use crate::types::Topic;
use crate::version::{Diff, ManagerPeer, PeerVerdict, Version};

/// Default wait for each reconciliation response.
pub const DEFAULT_REQUEST_BUDGET: Duration = Duration::from_secs(30);

/// [`ManagerPeer`] over `compare` / `update` / `change` requests.
#[derive(Clone)]
pub struct RemotePeer {
    handle: RuntimeHandle,
    budget: Duration,
}

impl RemotePeer {
    pub fn new(handle: RuntimeHandle) -> Self {
        Self {
            handle,
            budget: DEFAULT_REQUEST_BUDGET,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }
}

#[async_trait]
impl ManagerPeer for RemotePeer {
    async fn compare(&self, version: &Version) -> Result<PeerVerdict, WorkerError> {
        let response = self
            .handle
            .request(
                Topic::Compare,
                json!({ "version": version.to_string() }),
                self.budget,
            )
            .await?;
        parse_verdict(&response.message)
    }

    async fn push(&self, fragments: Map<String, Value>) -> Result<(), WorkerError> {
        self.handle
            .request(Topic::Update, Value::Object(fragments), self.budget)
            .await?;
        Ok(())
    }

    async fn fetch(&self, diff: &Diff) -> Result<Map<String, Value>, WorkerError> {
        let response = self
            .handle
            .request(
                Topic::Change,
                json!({ "changes": diff.to_string() }),
                self.budget,
            )
            .await?;
        match response.message {
            Value::Object(fragments) => Ok(fragments),
            other => Err(WorkerError::Reconcile(format!(
                "change response must carry an object, got {other}"
            ))),
        }
    }
}

/// Read a `compare` answer: a bare diff string, `{"changes": ...}` or
/// `{"version": ...}`.
fn parse_verdict(message: &Value) -> Result<PeerVerdict, WorkerError> {
    match message {
        Value::String(changes) => Ok(PeerVerdict::Changes(changes.parse()?)),
        Value::Object(fields) => {
            if let Some(changes) = fields.get("changes").and_then(Value::as_str) {
                Ok(PeerVerdict::Changes(changes.parse()?))
            } else if let Some(version) = fields.get("version").and_then(Value::as_str) {
                Ok(PeerVerdict::Version(version.parse()?))
            } else {
                Err(WorkerError::Reconcile(
                    "compare response has neither changes nor version".into(),
                ))
            }
        }
        other => Err(WorkerError::Reconcile(format!(
            "unexpected compare response {other}"
        ))),
    }
}
