/// The worker runtime event loop.
///
/// A single async task that owns the link, the delivery queue, the response
/// waiters and the connection state. It multiplexes over application
/// commands, link events, internal notices (connect results, probes) and
/// timers. Nothing else writes to the link.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::json;
use tether_transport::{
    Envelope, Inbound, LinkSender, Response, TransportError, TransportEvent, ABNORMAL_CLOSE,
    NORMAL_CLOSE,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;
use crate::liveness::{poll_until, ticker};
use crate::queue::DeliveryQueue;
use crate::types::{ConnectionState, EventId, Topic};

use super::{Connector, QueueSnapshot, RuntimeCommand, RuntimeConfig, Waiter, WorkerEvent};

/// Notices from tasks the loop spawned. Tagged with the connection epoch
/// so stale notices from an earlier link are ignored.
enum Notice {
    Connected {
        epoch: u64,
        result: Result<tether_transport::Link, TransportError>,
    },
    Probe {
        epoch: u64,
    },
    HandshakeExpired {
        epoch: u64,
    },
}

/// Mutable state owned by the loop.
struct Session {
    connector: Arc<dyn Connector>,
    config: RuntimeConfig,
    queue: DeliveryQueue,
    waiters: HashMap<EventId, Waiter>,
    link: Option<LinkSender>,
    inbound: Option<mpsc::Receiver<TransportEvent>>,
    /// Bumped on every connect attempt.
    epoch: u64,
    probe_cancel: Option<CancellationToken>,
    reconnect_at: Option<Instant>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::Sender<WorkerEvent>,
    /// Manager messages waiting for room in the event channel.
    backlog: VecDeque<WorkerEvent>,
    notice_tx: mpsc::UnboundedSender<Notice>,
    shutdown: CancellationToken,
}

/// Main event loop.
pub(super) async fn runtime_loop(
    connector: Arc<dyn Connector>,
    config: RuntimeConfig,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    event_tx: mpsc::Sender<WorkerEvent>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
) {
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    let mut flush_tick = ticker(config.flush_interval);
    flush_tick.tick().await;

    let mut session = Session {
        connector,
        config,
        queue: DeliveryQueue::new(),
        waiters: HashMap::new(),
        link: None,
        inbound: None,
        epoch: 0,
        probe_cancel: None,
        reconnect_at: None,
        state_tx,
        event_tx,
        backlog: VecDeque::new(),
        notice_tx,
        shutdown: shutdown.clone(),
    };

    session.start_connect();

    loop {
        let reconnect_at = session.reconnect_at;
        let event_tx = session.event_tx.clone();

        tokio::select! {
            biased;

            // ── 1. Deliberate close ──────────────────────────────
            _ = shutdown.cancelled() => {
                session.terminal_close();
                break;
            }

            // ── 2. Application commands ─────────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => session.handle_command(cmd),
                    None => {
                        tracing::debug!("all runtime handles dropped");
                        session.terminal_close();
                        break;
                    }
                }
            }

            // ── 3. Link events ──────────────────────────────────
            event = next_link_event(&mut session.inbound) => {
                match event {
                    TransportEvent::Text(text) => session.handle_inbound(&text),
                    TransportEvent::Closed { code } => session.on_disconnect(code),
                }
            }

            // ── 4. Spawned task notices ─────────────────────────
            Some(notice) = notice_rx.recv() => session.handle_notice(notice),

            // ── 5. Reconnect backoff ────────────────────────────
            _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                session.reconnect_at = None;
                session.start_connect();
            }

            // ── 6. Event backlog ────────────────────────────────
            Ok(permit) = event_tx.reserve(), if !session.backlog.is_empty() => {
                if let Some(event) = session.backlog.pop_front() {
                    permit.send(event);
                }
            }

            // ── 7. Flush retry + waiter pruning ─────────────────
            _ = flush_tick.tick() => {
                session.flush();
                session.waiters.retain(|_, waiter| !waiter.is_closed());
            }
        }
    }

    tracing::debug!("runtime loop stopped");
}

/// Next event from the current link; pending forever without one.
async fn next_link_event(inbound: &mut Option<mpsc::Receiver<TransportEvent>>) -> TransportEvent {
    match inbound {
        // A dropped reader means the socket is gone without a close frame.
        Some(rx) => rx.recv().await.unwrap_or(TransportEvent::Closed {
            code: ABNORMAL_CLOSE,
        }),
        None => std::future::pending().await,
    }
}

impl Session {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "connection state changed");
        }
    }

    /// Hand an event to the application in order. Manager messages wait in
    /// the backlog while the channel is full; informational events are
    /// dropped instead.
    fn emit(&mut self, event: WorkerEvent) {
        if self.event_tx.is_closed() {
            self.backlog.clear();
            return;
        }
        let event = if self.backlog.is_empty() {
            match self.event_tx.try_send(event) {
                Ok(()) | Err(TrySendError::Closed(_)) => return,
                Err(TrySendError::Full(event)) => event,
            }
        } else {
            event
        };

        if event.is_informational() {
            tracing::warn!(?event, "worker event dropped, application is not keeping up");
        } else {
            tracing::debug!(backlog = self.backlog.len() + 1, "event channel full, holding event");
            self.backlog.push_back(event);
        }
    }

    // ── Connection lifecycle ───────────────────────────────────────

    /// Spawn one connect attempt unless one is already running or a link
    /// exists.
    fn start_connect(&mut self) {
        if self.state() != ConnectionState::Disconnected || self.shutdown.is_cancelled() {
            return;
        }
        self.epoch += 1;
        let epoch = self.epoch;
        self.set_state(ConnectionState::Connecting);

        let connector = self.connector.clone();
        let notice_tx = self.notice_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                result = connector.connect() => result,
            };
            let _ = notice_tx.send(Notice::Connected { epoch, result });
        });
    }

    fn on_connected(&mut self, link: tether_transport::Link) {
        tracing::info!(epoch = self.epoch, "link to manager open");
        self.link = Some(link.sender);
        self.inbound = Some(link.events);
        self.set_state(ConnectionState::Open);
        self.start_probe();
    }

    fn on_connect_failed(&mut self, error: TransportError) {
        tracing::warn!(
            error = %error,
            retry_in = ?self.config.reconnect_delay,
            "could not connect to manager"
        );
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    /// Ping every probe interval until the session is live or the attempt
    /// budget runs out.
    fn start_probe(&mut self) {
        self.stop_probe();
        let token = self.shutdown.child_token();
        self.probe_cancel = Some(token.clone());

        let epoch = self.epoch;
        let probe = self.config.probe;
        let state_rx = self.state_tx.subscribe();
        let notice_tx = self.notice_tx.clone();
        tokio::spawn(async move {
            let result = poll_until(
                probe,
                &token,
                "session handshake",
                || *state_rx.borrow() == ConnectionState::SessionLive,
                |_| {
                    let _ = notice_tx.send(Notice::Probe { epoch });
                },
            )
            .await;
            if let Err(WorkerError::Timeout { .. }) = result {
                let _ = notice_tx.send(Notice::HandshakeExpired { epoch });
            }
        });
    }

    fn stop_probe(&mut self) {
        if let Some(token) = self.probe_cancel.take() {
            token.cancel();
        }
    }

    fn mark_live(&mut self) {
        match self.state() {
            ConnectionState::Open => {
                tracing::info!("session live");
                self.stop_probe();
                self.set_state(ConnectionState::SessionLive);
                self.flush();
            }
            ConnectionState::SessionLive => {}
            other => tracing::debug!(state = %other, "liveness confirmation without a link"),
        }
    }

    /// The link is gone. Pending events go back to unsent; anything but a
    /// normal close schedules a reconnect.
    fn on_disconnect(&mut self, code: u16) {
        self.stop_probe();
        self.link = None;
        self.inbound = None;
        let requeued = self.queue.requeue_pending();
        self.set_state(ConnectionState::Disconnected);

        let reconnecting = code != NORMAL_CLOSE;
        if reconnecting {
            tracing::warn!(code, requeued, "link to manager closed, reconnecting");
            self.schedule_reconnect();
        } else {
            tracing::info!(requeued, "manager closed the link normally");
        }
        self.emit(WorkerEvent::Disconnected { code, reconnecting });
    }

    fn schedule_reconnect(&mut self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
    }

    /// Owner-requested normal close. Nothing is retried afterwards.
    fn terminal_close(&mut self) {
        self.set_state(ConnectionState::Closing);
        self.stop_probe();
        self.reconnect_at = None;
        if let Some(link) = self.link.take() {
            if link.try_close(NORMAL_CLOSE).is_err() {
                tracing::debug!("link already gone at close");
            }
        }
        self.inbound = None;
        let requeued = self.queue.requeue_pending();
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(WorkerError::Cancelled));
        }
        tracing::info!(
            unsent = self.queue.unsent_len(),
            requeued,
            "connection to manager closed"
        );
        self.set_state(ConnectionState::Disconnected);
    }

    // ── Commands ───────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: RuntimeCommand) {
        match cmd {
            RuntimeCommand::Enqueue { envelope, waiter } => {
                let event_id = self.queue.enqueue_envelope(envelope);
                if let Some(waiter) = waiter {
                    // The first caller still waiting on an id owns its response.
                    match self.waiters.get(&event_id) {
                        Some(current) if !current.is_closed() => {
                            tracing::debug!(%event_id, "event already awaited, rejecting second waiter");
                            let _ = waiter.send(Err(WorkerError::Validation(format!(
                                "event {event_id} is already awaiting a response"
                            ))));
                        }
                        _ => {
                            self.waiters.insert(event_id, waiter);
                        }
                    }
                }
                self.flush();
            }
            RuntimeCommand::Inspect { reply } => {
                let _ = reply.send(QueueSnapshot {
                    unsent: self.queue.unsent_ids(),
                    pending: self.queue.pending_ids(),
                });
            }
            RuntimeCommand::Reconnect => {
                if self.state() == ConnectionState::Disconnected {
                    self.reconnect_at = None;
                    self.start_connect();
                }
            }
            RuntimeCommand::Bounce { code } => {
                if let Some(link) = &self.link {
                    let _ = link.try_close(code);
                    self.on_disconnect(code);
                }
            }
        }
    }

    fn handle_notice(&mut self, notice: Notice) {
        match notice {
            Notice::Connected { epoch, result } if epoch == self.epoch => match result {
                Ok(link) => self.on_connected(link),
                Err(e) => self.on_connect_failed(e),
            },
            Notice::Probe { epoch } if epoch == self.epoch => {
                if self.state() == ConnectionState::Open {
                    self.send_ping();
                }
            }
            Notice::HandshakeExpired { epoch } if epoch == self.epoch => {
                if self.state() == ConnectionState::Open {
                    tracing::warn!("manager never confirmed the session, dropping link");
                    self.emit(WorkerEvent::Error {
                        description: "session handshake timed out".into(),
                    });
                    self.on_disconnect(ABNORMAL_CLOSE);
                }
            }
            _ => tracing::trace!("stale notice ignored"),
        }
    }

    // ── Outbound ───────────────────────────────────────────────────

    fn send_ping(&self) {
        let Some(link) = &self.link else { return };
        let ping = Envelope::new(Topic::Ping, json!({}));
        if let Err(e) = link.try_send_text(ping.to_text()) {
            tracing::debug!("ping not sent: {e}");
        }
    }

    /// Drain unsent events while the session is live and the link accepts
    /// frames.
    fn flush(&mut self) {
        if self.state() != ConnectionState::SessionLive {
            return;
        }
        let Some(link) = &self.link else { return };
        if self.queue.unsent_len() == 0 {
            return;
        }

        let sent = self.queue.flush(|event| match link.try_send_text(event.text.clone()) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(event_id = %event.event_id, "flush stopped: {e}");
                false
            }
        });
        if sent > 0 {
            tracing::debug!(sent, left = self.queue.unsent_len(), "flushed queued events");
        }
    }

    // ── Inbound routing ────────────────────────────────────────────

    fn handle_inbound(&mut self, text: &str) {
        let inbound = match Inbound::decode(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!("dropping malformed message from manager: {e}");
                return;
            }
        };

        match inbound {
            Inbound::Pong => self.mark_live(),
            Inbound::Response(response) => self.handle_response(response),
            Inbound::Update(fragments) => {
                tracing::debug!(count = fragments.len(), "configuration update from manager");
                self.emit(WorkerEvent::Update { fragments });
            }
            Inbound::Trigger(message) => {
                tracing::debug!("trigger received");
                self.emit(WorkerEvent::Trigger { message });
            }
            Inbound::Unrecognized { topic } => {
                tracing::debug!(%topic, "unknown message topic received");
            }
        }
    }

    fn handle_response(&mut self, response: Response) {
        if response.is_stale_settings() {
            let msg = response.msg.clone().unwrap_or_default();
            tracing::info!(%msg, "worker settings differ from the manager's");
            self.emit(WorkerEvent::StaleSettings { msg });
            return;
        }

        if response.is_success() && response.event.as_deref() == Some("register") {
            self.mark_live();
        }

        for id in [&response.event_id, &response.correlation_id].into_iter().flatten() {
            self.queue.acknowledge(id);
        }
        tracing::debug!(
            code = response.code,
            event = response.event.as_deref().unwrap_or("?"),
            msg = response.msg.as_deref().unwrap_or(""),
            "response from manager"
        );

        let waiter = response
            .event_id
            .as_ref()
            .and_then(|id| self.waiters.remove(id))
            .or_else(|| {
                response
                    .correlation_id
                    .as_ref()
                    .and_then(|id| self.waiters.remove(id))
            });

        let rejected = !response.is_success();
        match waiter {
            Some(waiter) if rejected => {
                let _ = waiter.send(Err(WorkerError::Rejected {
                    code: response.code,
                    msg: response.msg.unwrap_or_default(),
                }));
            }
            Some(waiter) => {
                let _ = waiter.send(Ok(response));
            }
            None if rejected => {
                tracing::warn!(code = response.code, "manager rejected an event");
                self.emit(WorkerEvent::Rejected {
                    event_id: response.event_id,
                    code: response.code,
                    msg: response.msg.unwrap_or_default(),
                });
            }
            None => {}
        }
    }
}
