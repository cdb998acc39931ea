use super::connector::mock::{MockConnector, MockController, MockManager};
use super::*;
use crate::queue::QueueStats;
use serde_json::json;
use tether_transport::{Topic, ABNORMAL_CLOSE};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tether_worker=debug")
        .with_test_writer()
        .try_init();
}

fn config() -> RuntimeConfig {
    RuntimeConfig {
        probe: PollConfig::new(Duration::from_millis(300), 20),
        ..RuntimeConfig::default()
    }
}

fn spawn() -> (RuntimeChannels, MockController) {
    init_tracing();
    let (connector, controller) = MockConnector::new();
    (WorkerRuntime::spawn(connector, config()), controller)
}

/// Accept the next connect attempt and complete the ping/pong handshake.
async fn go_live(handle: &RuntimeHandle, controller: &mut MockController) -> MockManager {
    let mut manager = controller.accept().await;
    manager.expect_ping().await;
    manager.pong().await;
    handle.await_live(Duration::from_secs(5)).await.unwrap();
    manager
}

async fn wait_for_queue(handle: &RuntimeHandle, unsent: usize, pending: usize) -> QueueSnapshot {
    let wanted = QueueStats { unsent, pending };
    let mut last = QueueSnapshot::default();
    for _ in 0..200 {
        last = handle.queue_snapshot().await.unwrap();
        if last.stats() == wanted {
            return last;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue never reached {wanted:?}, last {last:?}");
}

async fn next_event(events: &mut mpsc::Receiver<WorkerEvent>) -> WorkerEvent {
    tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("no worker event")
        .expect("runtime stopped")
}

#[tokio::test(start_paused = true)]
async fn enqueue_flush_and_acknowledge() {
    let (channels, mut controller) = spawn();
    let handle = channels.handle;

    let id = handle.enqueue(Topic::Data, json!({"x": 1})).await.unwrap();
    let snapshot = wait_for_queue(&handle, 1, 0).await;
    assert_eq!(snapshot.unsent, vec![id.clone()]);

    let mut manager = go_live(&handle, &mut controller).await;
    let envelope = manager.next_envelope().await;
    assert_eq!(envelope.event_id, id);
    assert_eq!(envelope.topic, Topic::Data);
    assert_eq!(envelope.message, json!({"x": 1}));
    wait_for_queue(&handle, 0, 1).await;

    manager.respond(&id, "data", 200).await;
    wait_for_queue(&handle, 0, 0).await;
}

#[tokio::test(start_paused = true)]
async fn unexpected_close_requeues_and_redelivers() {
    let (channels, mut controller) = spawn();
    let handle = channels.handle;
    let mut manager = go_live(&handle, &mut controller).await;

    let id = handle.enqueue(Topic::Data, json!({"n": 1})).await.unwrap();
    assert_eq!(manager.next_envelope().await.event_id, id);
    wait_for_queue(&handle, 0, 1).await;

    manager.close(ABNORMAL_CLOSE).await;
    let snapshot = wait_for_queue(&handle, 1, 0).await;
    assert_eq!(snapshot.unsent, vec![id.clone()]);

    // Reconnects after the backoff and sends the event again.
    let mut manager = go_live(&handle, &mut controller).await;
    assert_eq!(manager.next_envelope().await.event_id, id);
    assert_eq!(controller.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn redelivered_events_precede_new_ones() {
    let (channels, mut controller) = spawn();
    let handle = channels.handle;
    let mut manager = go_live(&handle, &mut controller).await;

    let a = handle.enqueue(Topic::Data, json!("a")).await.unwrap();
    assert_eq!(manager.next_envelope().await.event_id, a);
    manager.close(4001).await;
    wait_for_queue(&handle, 1, 0).await;

    let b = handle.enqueue(Topic::Data, json!("b")).await.unwrap();
    let c = handle.enqueue(Topic::Data, json!("c")).await.unwrap();
    let snapshot = wait_for_queue(&handle, 3, 0).await;
    assert_eq!(snapshot.unsent, vec![a.clone(), b.clone(), c.clone()]);

    let mut manager = go_live(&handle, &mut controller).await;
    let order = vec![
        manager.next_envelope().await.event_id,
        manager.next_envelope().await.event_id,
        manager.next_envelope().await.event_id,
    ];
    assert_eq!(order, vec![a, b, c]);
}

#[tokio::test(start_paused = true)]
async fn nothing_flushes_before_session_is_live() {
    let (channels, mut controller) = spawn();
    let handle = channels.handle;

    let mut manager = controller.accept().await;
    handle.enqueue(Topic::Data, json!({})).await.unwrap();
    // Only probes go out while the transport is open but unconfirmed.
    for _ in 0..3 {
        manager.expect_ping().await;
    }
    assert_eq!(handle.state(), ConnectionState::Open);
    wait_for_queue(&handle, 1, 0).await;

    manager.pong().await;
    assert_eq!(manager.next_envelope().await.topic, Topic::Data);
}

#[tokio::test(start_paused = true)]
async fn deliberate_close_is_terminal() {
    let (channels, mut controller) = spawn();
    let handle = channels.handle;
    let mut manager = go_live(&handle, &mut controller).await;

    handle.close().await.unwrap();
    assert_eq!(manager.expect_close().await, NORMAL_CLOSE);
    assert_eq!(handle.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(controller.attempts(), 1);
    assert!(matches!(
        handle.enqueue(Topic::Data, json!({})).await,
        Err(WorkerError::Shutdown)
    ));
}

#[tokio::test(start_paused = true)]
async fn close_cancels_pending_waits() {
    let (channels, controller) = spawn();
    let handle = channels.handle;

    let waiting = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.await_live(Duration::from_secs(60)).await })
    };
    let request = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .request(Topic::Data, json!({}), Duration::from_secs(60))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.close().await.unwrap();
    assert!(matches!(waiting.await.unwrap(), Err(WorkerError::Cancelled)));
    assert!(matches!(request.await.unwrap(), Err(WorkerError::Cancelled)));
    // The connect attempt was abandoned too.
    assert!(controller.attempts() <= 1);
}

#[tokio::test(start_paused = true)]
async fn normal_close_from_manager_does_not_reconnect() {
    let (mut channels, mut controller) = spawn();
    let handle = channels.handle.clone();
    let manager = go_live(&handle, &mut controller).await;

    manager.close(NORMAL_CLOSE).await;
    assert_eq!(
        next_event(&mut channels.events).await,
        WorkerEvent::Disconnected {
            code: NORMAL_CLOSE,
            reconnecting: false
        }
    );
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(controller.attempts(), 1);

    // The owner can ask for a new session.
    handle.reconnect().await.unwrap();
    go_live(&handle, &mut controller).await;
    assert_eq!(controller.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn refused_connect_is_retried() {
    let (channels, mut controller) = spawn();
    let handle = channels.handle;

    controller.refuse();
    go_live(&handle, &mut controller).await;
    assert_eq!(controller.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn handshake_expiry_drops_the_link() {
    init_tracing();
    let (connector, mut controller) = MockConnector::new();
    let config = RuntimeConfig {
        probe: PollConfig::new(Duration::from_millis(300), 3),
        ..RuntimeConfig::default()
    };
    let mut channels = WorkerRuntime::spawn(connector, config);

    let _silent = controller.accept().await;
    assert!(matches!(
        next_event(&mut channels.events).await,
        WorkerEvent::Error { .. }
    ));
    assert_eq!(
        next_event(&mut channels.events).await,
        WorkerEvent::Disconnected {
            code: ABNORMAL_CLOSE,
            reconnecting: true
        }
    );

    go_live(&channels.handle, &mut controller).await;
    assert_eq!(controller.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn malformed_and_unknown_messages_are_dropped() {
    let (channels, mut controller) = spawn();
    let handle = channels.handle;
    let mut manager = go_live(&handle, &mut controller).await;

    manager.send("definitely not json").await;
    manager.send(r#"{"topic":"response"}"#).await;
    manager.send(r#"{"topic":"mystery","message":{}}"#).await;

    let request = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .request(Topic::Data, json!({"ok": true}), Duration::from_secs(5))
                .await
        })
    };
    let envelope = manager.next_envelope().await;
    manager.respond(&envelope.event_id, "data", 200).await;

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.code, 200);
    assert_eq!(handle.state(), ConnectionState::SessionLive);
}

#[tokio::test(start_paused = true)]
async fn rejection_is_distinct_from_timeout() {
    let (channels, mut controller) = spawn();
    let handle = channels.handle;
    let mut manager = go_live(&handle, &mut controller).await;

    let rejected = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .request(Topic::Data, json!({}), Duration::from_secs(5))
                .await
        })
    };
    let envelope = manager.next_envelope().await;
    manager.respond(&envelope.event_id, "data", 400).await;
    assert!(matches!(
        rejected.await.unwrap(),
        Err(WorkerError::Rejected { code: 400, .. })
    ));
    // A rejection still settles the event.
    wait_for_queue(&handle, 0, 0).await;

    let unanswered = handle
        .request(Topic::Data, json!({}), Duration::from_secs(1))
        .await;
    assert!(matches!(unanswered, Err(WorkerError::Timeout { .. })));
    // The event itself is still awaiting its ack.
    wait_for_queue(&handle, 0, 1).await;
}

#[tokio::test(start_paused = true)]
async fn waiter_resolves_by_correlation_id() {
    let (channels, mut controller) = spawn();
    let handle = channels.handle;
    let mut manager = go_live(&handle, &mut controller).await;

    let request = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .request(Topic::Data, json!({}), Duration::from_secs(5))
                .await
        })
    };
    let envelope = manager.next_envelope().await;
    manager
        .send(
            json!({"topic": "response", "code": 200, "event": "publish", "id": envelope.event_id})
                .to_string(),
        )
        .await;

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.correlation_id.as_deref(), Some(envelope.event_id.as_str()));
    wait_for_queue(&handle, 0, 0).await;
}

#[tokio::test(start_paused = true)]
async fn stale_settings_notice_is_not_an_ack() {
    let (mut channels, mut controller) = spawn();
    let handle = channels.handle.clone();
    let mut manager = go_live(&handle, &mut controller).await;

    let id = handle.enqueue(Topic::Register, json!({})).await.unwrap();
    manager.next_envelope().await;
    manager.respond(&id, "register", 204).await;

    assert!(matches!(
        next_event(&mut channels.events).await,
        WorkerEvent::StaleSettings { .. }
    ));
    wait_for_queue(&handle, 0, 1).await;
}

#[tokio::test(start_paused = true)]
async fn unsolicited_rejection_is_reported() {
    let (mut channels, mut controller) = spawn();
    let handle = channels.handle.clone();
    let mut manager = go_live(&handle, &mut controller).await;

    let id = handle.enqueue(Topic::Data, json!({})).await.unwrap();
    manager.next_envelope().await;
    manager.respond(&id, "publish", 500).await;

    assert_eq!(
        next_event(&mut channels.events).await,
        WorkerEvent::Rejected {
            event_id: Some(id),
            code: 500,
            msg: "rejected".into()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn update_and_trigger_reach_the_application() {
    let (mut channels, mut controller) = spawn();
    let handle = channels.handle.clone();
    let manager = go_live(&handle, &mut controller).await;

    manager
        .send(r#"{"topic":"update","settings":{"messageRetries":4}}"#)
        .await;
    manager
        .send(r#"{"topic":"trigger","message":{"statusID":"s1","data":[]}}"#)
        .await;

    let WorkerEvent::Update { fragments } = next_event(&mut channels.events).await else {
        panic!("expected an update");
    };
    assert_eq!(fragments["settings"], json!({"messageRetries": 4}));
    assert_eq!(
        next_event(&mut channels.events).await,
        WorkerEvent::Trigger {
            message: json!({"statusID": "s1", "data": []})
        }
    );
}

#[tokio::test(start_paused = true)]
async fn triggers_beyond_the_event_buffer_are_held_not_dropped() {
    init_tracing();
    let (connector, mut controller) = MockConnector::new();
    let config = RuntimeConfig {
        event_buffer: 2,
        ..config()
    };
    let mut channels = WorkerRuntime::spawn(connector, config);
    let handle = channels.handle.clone();
    let manager = go_live(&handle, &mut controller).await;

    for n in 0..5 {
        manager
            .send(json!({"topic": "trigger", "message": {"statusID": n}}).to_string())
            .await;
    }
    // Let the loop run into the full channel before anything is read.
    tokio::time::sleep(Duration::from_millis(100)).await;

    for n in 0..5 {
        assert_eq!(
            next_event(&mut channels.events).await,
            WorkerEvent::Trigger {
                message: json!({"statusID": n})
            }
        );
    }
}

#[test]
fn only_runtime_notices_are_informational() {
    assert!(WorkerEvent::Error {
        description: "x".into()
    }
    .is_informational());
    assert!(WorkerEvent::Disconnected {
        code: 1006,
        reconnecting: true
    }
    .is_informational());
    assert!(!WorkerEvent::Trigger { message: json!({}) }.is_informational());
    assert!(!WorkerEvent::Update {
        fragments: Default::default()
    }
    .is_informational());
}

#[tokio::test(start_paused = true)]
async fn zero_flush_interval_still_runs() {
    init_tracing();
    let (connector, mut controller) = MockConnector::new();
    let config = RuntimeConfig {
        flush_interval: Duration::ZERO,
        ..config()
    };
    let channels = WorkerRuntime::spawn(connector, config);
    let handle = channels.handle;
    let mut manager = go_live(&handle, &mut controller).await;

    let id = handle.enqueue(Topic::Data, json!({"x": 1})).await.unwrap();
    assert_eq!(manager.next_envelope().await.event_id, id);
}

#[tokio::test(start_paused = true)]
async fn second_waiter_on_the_same_id_is_rejected() {
    let (channels, mut controller) = spawn();
    let handle = channels.handle;
    let mut manager = go_live(&handle, &mut controller).await;

    let envelope = Envelope::new(Topic::Data, json!({ "n": 1 }));
    let first = {
        let handle = handle.clone();
        let envelope = envelope.clone();
        tokio::spawn(async move { handle.send_and_wait(envelope, Duration::from_secs(5)).await })
    };
    let sent = manager.next_envelope().await;
    assert_eq!(sent.event_id, envelope.event_id);

    let second = handle
        .send_and_wait(envelope.clone(), Duration::from_secs(5))
        .await;
    assert!(matches!(second, Err(WorkerError::Validation(_))));
    // Still a single queued event.
    wait_for_queue(&handle, 0, 1).await;

    manager.respond(&envelope.event_id, "data", 200).await;
    let response = first.await.unwrap().unwrap();
    assert_eq!(response.code, 200);
    wait_for_queue(&handle, 0, 0).await;
}

#[tokio::test(start_paused = true)]
async fn bounce_reconnects() {
    let (channels, mut controller) = spawn();
    let handle = channels.handle;
    let mut manager = go_live(&handle, &mut controller).await;

    handle.close_with(4000).await.unwrap();
    assert_eq!(manager.expect_close().await, 4000);

    go_live(&handle, &mut controller).await;
    assert_eq!(controller.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn oversized_envelope_is_refused_at_enqueue() {
    init_tracing();
    let (connector, _controller) = MockConnector::new();
    let config = RuntimeConfig {
        max_message_size: 64,
        ..config()
    };
    let channels = WorkerRuntime::spawn(connector, config);

    let err = channels
        .handle
        .enqueue(Topic::Data, json!({"blob": "x".repeat(100)}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkerError::Transport(tether_transport::TransportError::MessageTooLarge { .. })
    ));
}
