/// Worker runtime: the connection and delivery engine.
///
/// One task owns the link, the delivery queue, the response waiters and the
/// connection state. The application talks to it through a cloneable
/// [`RuntimeHandle`] (commands in, oneshot replies out) and observes it
/// through the [`WorkerEvent`] channel and a state watch.
mod connector;
mod r#loop;
#[cfg(test)]
mod tests;

pub use connector::{Connector, WsConnector};
#[cfg(test)]
pub(crate) use connector::mock;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tether_transport::{Envelope, Response, NORMAL_CLOSE};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;
use crate::liveness::{poll_until, PollConfig};
use crate::queue::QueueStats;
use crate::types::{ConnectionState, EventId, Topic};

/// Default maximum serialized envelope size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for the worker runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Handshake probing: ping cadence and attempts before giving up.
    pub probe: PollConfig,
    /// Delay before reconnecting after an unexpected close.
    pub reconnect_delay: Duration,
    /// Interval for retrying a flush the link refused.
    pub flush_interval: Duration,
    /// Envelopes larger than this are refused at enqueue.
    pub max_message_size: usize,
    pub command_buffer: usize,
    /// Capacity of the event channel. Manager messages beyond it wait in
    /// the runtime until the application catches up.
    pub event_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            probe: PollConfig::default(),
            reconnect_delay: Duration::from_secs(1),
            flush_interval: Duration::from_millis(300),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            command_buffer: 64,
            event_buffer: 64,
        }
    }
}

// ── Commands (app → runtime) ──────────────────────────────────────────

pub(crate) type Waiter = oneshot::Sender<Result<Response, WorkerError>>;

/// Commands the application sends to the runtime loop.
pub(crate) enum RuntimeCommand {
    /// Queue an envelope; `waiter` receives its response.
    Enqueue {
        envelope: Envelope,
        waiter: Option<Waiter>,
    },
    /// Query the delivery queue.
    Inspect {
        reply: oneshot::Sender<QueueSnapshot>,
    },
    /// Reconnect now if idle (after the manager closed normally).
    Reconnect,
    /// Drop the current link with a non-normal code; the usual reconnect
    /// follows.
    Bounce { code: u16 },
}

/// Delivery queue contents, ids only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// In flush order.
    pub unsent: Vec<EventId>,
    /// In send order.
    pub pending: Vec<EventId>,
}

impl QueueSnapshot {
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            unsent: self.unsent.len(),
            pending: self.pending.len(),
        }
    }
}

// ── Events (runtime → app) ───────────────────────────────────────────

/// Things the application may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The manager pushed configuration fragments.
    Update { fragments: Map<String, Value> },
    /// The manager asks the worker to run its job.
    Trigger { message: Value },
    /// The manager's settings differ from ours (code 204).
    StaleSettings { msg: String },
    /// A non-200 response nobody was waiting for.
    Rejected {
        event_id: Option<EventId>,
        code: u16,
        msg: String,
    },
    /// The link dropped; `reconnecting` is false after a normal close.
    Disconnected { code: u16, reconnecting: bool },
    /// Non-fatal runtime error.
    Error { description: String },
}

impl WorkerEvent {
    /// Events about the runtime itself. Everything else carries a manager
    /// message and is never dropped.
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            WorkerEvent::Disconnected { .. } | WorkerEvent::Error { .. }
        )
    }
}

// ── RuntimeHandle (app-facing API) ───────────────────────────────────

/// Handle to a running [`WorkerRuntime`]. Cheap to clone.
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    probe: PollConfig,
    max_message_size: usize,
}

impl RuntimeHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Whether `close` has been requested.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Queue `message` on `topic`. Returns its event id immediately; the
    /// event is delivered once the session is live.
    pub async fn enqueue(&self, topic: Topic, message: Value) -> Result<EventId, WorkerError> {
        self.enqueue_envelope(Envelope::new(topic, message)).await
    }

    /// Queue a prepared envelope (its `eventID` is kept).
    pub async fn enqueue_envelope(&self, envelope: Envelope) -> Result<EventId, WorkerError> {
        let event_id = envelope.event_id.clone();
        self.submit(envelope, None).await?;
        Ok(event_id)
    }

    /// Queue `envelope` and wait up to `budget` for its response.
    ///
    /// `Ok` only for code 200; other codes are `Rejected`. An expired
    /// budget is `Timeout`; the event itself stays queued. While another
    /// caller is still waiting on the same `eventID` this returns
    /// `Validation` at once.
    pub async fn send_and_wait(
        &self,
        envelope: Envelope,
        budget: Duration,
    ) -> Result<Response, WorkerError> {
        let what = format!("response to {} {}", envelope.topic, envelope.event_id);
        let (tx, rx) = oneshot::channel();
        self.submit(envelope, Some(tx)).await?;

        match tokio::time::timeout(budget, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WorkerError::Shutdown),
            Err(_) => Err(WorkerError::timeout(what)),
        }
    }

    /// [`send_and_wait`](Self::send_and_wait) with a fresh envelope.
    pub async fn request(
        &self,
        topic: Topic,
        message: Value,
        budget: Duration,
    ) -> Result<Response, WorkerError> {
        self.send_and_wait(Envelope::new(topic, message), budget)
            .await
    }

    pub async fn queue_snapshot(&self) -> Result<QueueSnapshot, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCommand::Inspect { reply: tx })
            .await
            .map_err(|_| WorkerError::Shutdown)?;
        rx.await.map_err(|_| WorkerError::Shutdown)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, WorkerError> {
        Ok(self.queue_snapshot().await?.stats())
    }

    /// Wait until the session is live.
    ///
    /// `Timeout` after `budget`; `Cancelled` if the runtime is closed while
    /// waiting.
    pub async fn await_live(&self, budget: Duration) -> Result<(), WorkerError> {
        let config = PollConfig::for_budget(self.probe.interval, budget);
        let state = self.state_rx.clone();
        poll_until(
            config,
            &self.shutdown,
            "live session",
            || *state.borrow() == ConnectionState::SessionLive,
            |_| {},
        )
        .await
        .map(|_| ())
    }

    /// Wait until the runtime is disconnected.
    ///
    /// Not cancelled by `close`, which is what it usually waits for.
    pub async fn await_idle(&self, budget: Duration) -> Result<(), WorkerError> {
        let config = PollConfig::for_budget(self.probe.interval, budget);
        let state = self.state_rx.clone();
        poll_until(
            config,
            &CancellationToken::new(),
            "idle connection",
            || *state.borrow() == ConnectionState::Disconnected,
            |_| {},
        )
        .await
        .map(|_| ())
    }

    /// Reconnect now if the manager closed the link normally.
    pub async fn reconnect(&self) -> Result<(), WorkerError> {
        self.cmd_tx
            .send(RuntimeCommand::Reconnect)
            .await
            .map_err(|_| WorkerError::Shutdown)
    }

    /// Normal close (1000). Terminal: no reconnect follows, in-flight
    /// connects, backoffs and polls are cancelled, and waiters get
    /// `Cancelled`. Resolves once the runtime has stopped.
    pub async fn close(&self) -> Result<(), WorkerError> {
        self.shutdown.cancel();
        let budget = self.probe.budget();
        self.await_idle(budget).await?;
        tokio::time::timeout(budget, self.cmd_tx.closed())
            .await
            .map_err(|_| WorkerError::timeout("runtime shutdown"))
    }

    /// Close with `code`. [`NORMAL_CLOSE`] is the terminal [`close`](Self::close);
    /// any other code drops the current link and reconnects after the
    /// usual delay.
    pub async fn close_with(&self, code: u16) -> Result<(), WorkerError> {
        if code == NORMAL_CLOSE {
            return self.close().await;
        }
        self.cmd_tx
            .send(RuntimeCommand::Bounce { code })
            .await
            .map_err(|_| WorkerError::Shutdown)
    }

    async fn submit(&self, envelope: Envelope, waiter: Option<Waiter>) -> Result<(), WorkerError> {
        if self.shutdown.is_cancelled() {
            return Err(WorkerError::Shutdown);
        }
        let size = envelope.to_text().len();
        if size > self.max_message_size {
            return Err(tether_transport::TransportError::MessageTooLarge {
                size,
                max: self.max_message_size,
            }
            .into());
        }
        self.cmd_tx
            .send(RuntimeCommand::Enqueue { envelope, waiter })
            .await
            .map_err(|_| WorkerError::Shutdown)
    }
}

// ── RuntimeChannels ──────────────────────────────────────────────────

/// Channels returned to the application when the runtime starts.
pub struct RuntimeChannels {
    pub handle: RuntimeHandle,
    pub events: mpsc::Receiver<WorkerEvent>,
}

// ── WorkerRuntime ────────────────────────────────────────────────────

/// The worker runtime. Spawn it and talk to it through the channels.
pub struct WorkerRuntime;

impl WorkerRuntime {
    /// Start the runtime loop on the current tokio runtime.
    ///
    /// The loop begins connecting immediately and keeps reconnecting after
    /// unexpected closes until [`RuntimeHandle::close`].
    pub fn spawn<C: Connector>(connector: C, config: RuntimeConfig) -> RuntimeChannels {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let shutdown = CancellationToken::new();

        let handle = RuntimeHandle {
            cmd_tx,
            state_rx,
            shutdown: shutdown.clone(),
            probe: config.probe,
            max_message_size: config.max_message_size,
        };

        tokio::spawn(r#loop::runtime_loop(
            Arc::new(connector),
            config,
            cmd_rx,
            event_tx,
            state_tx,
            shutdown,
        ));

        RuntimeChannels {
            handle,
            events: event_rx,
        }
    }
}
