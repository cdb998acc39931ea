//! The worker facade: one configuration, one runtime, one manager.
//!
//! [`Worker::connect`] brings a worker online: it spawns the runtime, waits
//! for the manager to confirm the session, registers, and reconciles the
//! configuration. Afterwards the application publishes data and drives
//! [`Worker::next_event`] to receive configuration pushes and triggers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tether_transport::{Envelope, Response, TransportConfig};

use crate::error::WorkerError;
use crate::peer::{RemotePeer, DEFAULT_REQUEST_BUDGET};
use crate::runtime::{
    Connector, RuntimeChannels, RuntimeConfig, RuntimeHandle, WorkerEvent, WorkerRuntime,
    WsConnector,
};
use crate::signer::{append_signature, Signer};
use crate::store::ConfigStore;
use crate::types::{now_ms, EventId, Fragment, Topic};
use crate::validate::SchemaValidator;
use crate::version::{ReconcileReport, Reconciler, Version};


/// Business logic run when the manager triggers the worker.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn execute(&self, message: Value) -> Result<(), WorkerError>;
}

/// Per-publish settings.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Price attached to the package meta. Defaults to 0.
    pub price: f64,
    /// Time to live, copied into the package meta when set.
    pub ttl: Option<u64>,
    /// Status the package answers, if it is the result of a trigger.
    pub status_id: Option<String>,
    /// How long to wait for the manager's acknowledgment.
    pub ack_timeout: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            price: 0.0,
            ttl: None,
            status_id: None,
            ack_timeout: DEFAULT_REQUEST_BUDGET,
        }
    }
}

/// An acknowledged publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    /// The package `_id`, also its event id.
    pub id: EventId,
    pub data: Value,
}

/// A connected worker.
pub struct Worker {
    store: ConfigStore,
    signer: Arc<dyn Signer>,
    validator: Option<Arc<dyn SchemaValidator>>,
    trigger: Option<Arc<dyn TriggerHandler>>,
    handle: RuntimeHandle,
    events: tokio::sync::mpsc::Receiver<WorkerEvent>,
    request_budget: Duration,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("store", &self.store)
            .field("state", &self.handle.state())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Transport settings for the manager named in `store`.
    pub fn transport_config(store: &ConfigStore) -> Result<TransportConfig, WorkerError> {
        Ok(TransportConfig::new(
            store.manager_url()?,
            store.credentials()?,
        ))
    }

    /// Connect over WebSocket, register and reconcile.
    pub async fn connect(
        store: ConfigStore,
        signer: Arc<dyn Signer>,
        transport: TransportConfig,
        runtime: RuntimeConfig,
    ) -> Result<Self, WorkerError> {
        Self::connect_with(store, signer, WsConnector::new(transport), runtime).await
    }

    /// [`connect`](Self::connect) with any [`Connector`].
    ///
    /// On failure the runtime is closed before the error is returned.
    pub async fn connect_with<C: Connector>(
        store: ConfigStore,
        signer: Arc<dyn Signer>,
        connector: C,
        runtime: RuntimeConfig,
    ) -> Result<Self, WorkerError> {
        let live_budget = runtime.probe.budget();
        let RuntimeChannels { handle, events } = WorkerRuntime::spawn(connector, runtime);

        let mut worker = Self {
            store,
            signer,
            validator: None,
            trigger: None,
            handle,
            events,
            request_budget: DEFAULT_REQUEST_BUDGET,
        };
        if let Err(e) = worker.start(live_budget).await {
            tracing::warn!(error = %e, "worker startup failed");
            if let Err(close_err) = worker.handle.close().await {
                tracing::debug!(error = %close_err, "closing after failed startup");
            }
            return Err(e);
        }
        Ok(worker)
    }

    async fn start(&mut self, live_budget: Duration) -> Result<(), WorkerError> {
        self.handle
            .await_live(live_budget)
            .await
            .map_err(|e| match e {
                WorkerError::Timeout { .. } => {
                    WorkerError::Connect("manager never confirmed the session".into())
                }
                other => other,
            })?;
        self.register().await?;
        let report = self.sync_config().await?;
        tracing::info!(
            worker_id = %self.store.worker_id(),
            pushed = report.pushed.len(),
            fetched = report.fetched.len(),
            "worker online"
        );
        Ok(())
    }

    /// Validate published data against `schema.output` first.
    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Run `handler` for every trigger seen by [`next_event`](Self::next_event).
    pub fn with_trigger(mut self, handler: Arc<dyn TriggerHandler>) -> Self {
        self.trigger = Some(handler);
        self
    }

    /// Budget for register and reconciliation requests.
    pub fn with_request_budget(mut self, budget: Duration) -> Self {
        self.request_budget = budget;
        self
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Local edits go through [`ConfigStore::edit`] and are pushed on the
    /// next [`sync_config`](Self::sync_config).
    pub fn store_mut(&mut self) -> &mut ConfigStore {
        &mut self.store
    }

    pub fn handle(&self) -> &RuntimeHandle {
        &self.handle
    }

    /// Announce the worker and its configuration version.
    pub async fn register(&self) -> Result<Response, WorkerError> {
        let registration = json!({
            "worker_id": self.store.worker_id(),
            "version": Version::of(&self.store).to_string(),
        });
        tracing::debug!(worker_id = %self.store.worker_id(), "registering");
        self.handle
            .request(Topic::Register, registration, self.request_budget)
            .await
    }

    /// Reconcile the configuration with the manager.
    pub async fn sync_config(&mut self) -> Result<ReconcileReport, WorkerError> {
        let peer = RemotePeer::new(self.handle.clone()).with_budget(self.request_budget);
        Reconciler::for_store(&self.store)
            .reconcile(&mut self.store, &peer)
            .await
    }

    /// Sign and publish `data`, then wait for the manager's acknowledgment.
    ///
    /// A `Timeout` leaves the package queued for redelivery.
    pub async fn publish(
        &self,
        data: Value,
        options: PublishOptions,
    ) -> Result<Published, WorkerError> {
        if let Some(validator) = &self.validator {
            validator
                .validate(&data, self.store.output_schema())
                .map_err(|errors| WorkerError::Validation(errors.join("; ")))?;
        }

        let (id, package) = self.package(data.clone(), &options)?;
        let envelope = Envelope {
            topic: Topic::Data,
            event_id: id.clone(),
            message: package,
        };
        tracing::debug!(%id, "publishing");
        self.handle
            .send_and_wait(envelope, options.ack_timeout)
            .await?;
        Ok(Published { id, data })
    }

    /// Build the signed package for `data`. The signature covers `meta`
    /// and `data`; `_id` and `statusID` are added after signing.
    fn package(
        &self,
        data: Value,
        options: &PublishOptions,
    ) -> Result<(EventId, Value), WorkerError> {
        let mut meta = Map::new();
        meta.insert("worker_id".into(), json!(self.store.worker_id()));
        meta.insert("created_at".into(), json!(now_ms()));
        meta.insert("price".into(), json!(options.price));
        meta.insert("location".into(), self.store.location());
        if let Some(ttl) = options.ttl {
            meta.insert("ttl".into(), json!(ttl));
        }
        if has_input(self.store.input_schema()) {
            meta.insert(
                "basedOn".into(),
                json!({ "workerIDs": [], "dataIDs": [[]] }),
            );
        }

        let mut package = json!({ "meta": meta, "data": data });
        append_signature(self.signer.as_ref(), &mut package, self.store.private_key())?;

        let id = uuid::Uuid::new_v4().to_string();
        if let Some(object) = package.as_object_mut() {
            object.insert("_id".into(), json!(id));
            if let Some(status_id) = &options.status_id {
                object.insert("statusID".into(), json!(status_id));
            }
        }
        Ok((id, package))
    }

    /// Next runtime event, after the worker has acted on it.
    ///
    /// `Update` fragments are written to the store (fragments with unpushed
    /// local edits are kept) and `Trigger` runs the trigger handler.
    /// `None` once the runtime has stopped.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        let event = self.events.recv().await?;
        match &event {
            WorkerEvent::Update { fragments } => self.apply_update(fragments),
            WorkerEvent::Trigger { message } => {
                if let Some(handler) = &self.trigger {
                    if let Err(e) = handler.execute(message.clone()).await {
                        tracing::warn!(error = %e, "trigger handler failed");
                    }
                }
            }
            WorkerEvent::StaleSettings { msg } => {
                tracing::info!(%msg, "manager reports different settings");
            }
            _ => {}
        }
        Some(event)
    }

    fn apply_update(&mut self, fragments: &Map<String, Value>) {
        for (name, value) in fragments {
            let Some(fragment) = Fragment::from_name(name) else {
                tracing::warn!(fragment = %name, "ignoring unknown fragment in update");
                continue;
            };
            if self.store.is_dirty(fragment) {
                tracing::warn!(%fragment, "keeping local edit over manager update");
                continue;
            }
            match self.store.update(fragment, value.clone()) {
                Ok(()) => tracing::debug!(%fragment, "applied manager update"),
                Err(e) => tracing::warn!(%fragment, error = %e, "manager update failed"),
            }
        }
    }

    /// Normal close; resolves once the runtime is idle.
    pub async fn disconnect(&self) -> Result<(), WorkerError> {
        self.handle.close().await
    }
}

/// Whether an input schema asks for input at all.
fn has_input(schema: &Value) -> bool {
    match schema {
        Value::Null => false,
        Value::Object(fields) => !fields.is_empty(),
        _ => true,
    }
}
