use super::*;
use crate::signer::Ed25519Signer;
use crate::store::MemoryBackend;
use serde_json::json;
use std::sync::{Arc, Mutex};

fn store() -> ConfigStore {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert(
        "/cfg/config.json",
        json!({
            "credentials": "w1:secret",
            "url": "http://manager.local",
            "privKey": "worker.key",
            "schema": { "input": "in.json", "output": "out.json" },
            "profile": { "location": { "latitude": 1.0, "longitude": 2.0 } },
            "info": {
                "worker": { "description": "w.md" },
                "input": { "description": "i.md" },
                "output": { "description": "o.md" }
            },
            "settings": { "messageRetries": 3 }
        })
        .to_string(),
    );
    backend.insert("/cfg/worker.key", "fixed-key");
    ConfigStore::load("/cfg/config.json", backend, &Ed25519Signer).unwrap()
}

/// Scripted manager that records what it was asked.
#[derive(Default)]
struct MockPeer {
    verdicts: Mutex<Vec<Result<PeerVerdict, WorkerError>>>,
    fetch_reply: Mutex<Map<String, Value>>,
    pushed: Mutex<Vec<Map<String, Value>>>,
    fetched: Mutex<Vec<String>>,
    compares: Mutex<u32>,
}

impl MockPeer {
    fn with_verdicts(verdicts: Vec<Result<PeerVerdict, WorkerError>>) -> Self {
        let mut verdicts = verdicts;
        verdicts.reverse();
        Self {
            verdicts: Mutex::new(verdicts),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ManagerPeer for MockPeer {
    async fn compare(&self, _version: &Version) -> Result<PeerVerdict, WorkerError> {
        *self.compares.lock().unwrap() += 1;
        self.verdicts
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Ok(PeerVerdict::Changes("0.0.0.0.0".parse().unwrap())))
    }

    async fn push(&self, fragments: Map<String, Value>) -> Result<(), WorkerError> {
        self.pushed.lock().unwrap().push(fragments);
        Ok(())
    }

    async fn fetch(&self, diff: &Diff) -> Result<Map<String, Value>, WorkerError> {
        self.fetched.lock().unwrap().push(diff.to_string());
        Ok(self.fetch_reply.lock().unwrap().clone())
    }
}

#[test]
fn canonical_json_sorts_keys_recursively() {
    let value: Value = serde_json::from_str(r#"{"b":{"z":1,"a":[{"y":2,"x":1}]},"a":"s"}"#).unwrap();
    assert_eq!(
        canonical_json(&value),
        r#"{"a":"s","b":{"a":[{"x":1,"y":2}],"z":1}}"#
    );
}

#[test]
fn string_fragment_hashes_its_json_literal() {
    let expected = STANDARD.encode(Sha256::digest(br#""abc""#));
    assert_eq!(fragment_digest(&json!("abc")), expected);
}

#[test]
fn key_order_does_not_change_digest() {
    let a: Value = serde_json::from_str(r#"{"x":1,"y":{"p":true,"q":null}}"#).unwrap();
    let b: Value = serde_json::from_str(r#"{"y":{"q":null,"p":true},"x":1}"#).unwrap();
    assert_eq!(fragment_digest(&a), fragment_digest(&b));
    assert_ne!(fragment_digest(&a), fragment_digest(&json!({"x": 2})));
}

#[test]
fn version_is_deterministic() {
    let store = store();
    let first = Reconciler::current_version(&store);
    let second = Reconciler::current_version(&store);
    assert_eq!(first, second);
    assert_eq!(first.digests().len(), VERSION_ORDER.len());
    assert_eq!(first.to_string().split('.').count(), 5);
    assert_eq!(first.to_string().parse::<Version>().unwrap(), first);
}

#[test]
fn schema_change_only_moves_schema_position() {
    let mut store = store();
    let before = Version::of(&store);
    store
        .update(Fragment::Schema, json!({"input": {}, "output": {"type": "number"}}))
        .unwrap();
    let after = Version::of(&store);

    let changes = diff(&before, &after, &BTreeSet::new());
    assert_eq!(changes.to_string(), "-1.0.0.0.0");
    assert_eq!(changes.peer_fragments(), vec![Fragment::Schema]);
}

#[test]
fn diff_at_index_two_only() {
    let local: Version = "a.b.c.d.e".parse().unwrap();
    let peer: Version = "a.b.X.d.e".parse().unwrap();

    let changes = diff(&local, &peer, &BTreeSet::new());
    assert_eq!(changes.to_string(), "0.0.-1.0.0");

    let dirty = BTreeSet::from([Fragment::Profile]);
    assert_eq!(diff(&local, &peer, &dirty).to_string(), "0.0.1.0.0");
}

#[test]
fn diff_wire_form_parses() {
    let changes: Diff = "0.0.1.0.-1".parse().unwrap();
    assert_eq!(changes.local_fragments(), vec![Fragment::Profile]);
    assert_eq!(changes.peer_fragments(), vec![Fragment::Settings]);
    assert!(!changes.is_clean());

    assert!("0.0.2.0.0".parse::<Diff>().is_err());
    assert!("0.0.0".parse::<Diff>().is_err());
    assert!("0.0.0.0.0".parse::<Diff>().unwrap().is_clean());
}

#[test]
fn dirty_fragment_overrides_peer_code() {
    let dirty = BTreeSet::from([Fragment::Info]);
    let resolved = resolve_conflicts("0.0.0.-1.-1".parse().unwrap(), &dirty);
    assert_eq!(resolved.to_string(), "0.0.0.1.-1");
}

#[tokio::test]
async fn apply_pushes_only_profile() {
    let mut store = store();
    store
        .edit(Fragment::Profile, json!({"location": {"latitude": 5.0}}))
        .unwrap();
    let peer = MockPeer::default();

    let report = Reconciler::new(3)
        .apply(&mut store, &"0.0.1.0.0".parse().unwrap(), &peer)
        .await
        .unwrap();

    assert_eq!(report.pushed, vec![Fragment::Profile]);
    assert!(report.fetched.is_empty());
    let pushed = peer.pushed.lock().unwrap();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].keys().collect::<Vec<_>>(), vec!["profile"]);
    assert!(peer.fetched.lock().unwrap().is_empty());
    assert!(!store.is_dirty(Fragment::Profile));
}

#[tokio::test]
async fn apply_fetches_and_stores_peer_fragments() {
    let mut store = store();
    let peer = MockPeer::default();
    peer.fetch_reply.lock().unwrap().insert(
        "settings".into(),
        json!({"messageRetries": 7}),
    );
    // Not requested: must be ignored.
    peer.fetch_reply
        .lock()
        .unwrap()
        .insert("profile".into(), json!({"location": null}));

    let report = Reconciler::new(3)
        .apply(&mut store, &"0.0.0.0.-1".parse().unwrap(), &peer)
        .await
        .unwrap();

    assert_eq!(report.fetched, vec![Fragment::Settings]);
    assert_eq!(store.message_retries(), 7);
    assert_eq!(store.location()["latitude"], json!(1.0));
    assert_eq!(*peer.fetched.lock().unwrap(), vec!["0.0.0.0.-1".to_string()]);
}

#[tokio::test]
async fn reconcile_stops_when_in_sync() {
    let mut store = store();
    let peer = MockPeer::with_verdicts(vec![Ok(PeerVerdict::Changes(
        "0.0.0.0.0".parse().unwrap(),
    ))]);

    let report = Reconciler::new(3).reconcile(&mut store, &peer).await.unwrap();
    assert!(report.is_noop());
    assert_eq!(report.attempts, 1);
    assert_eq!(*peer.compares.lock().unwrap(), 1);
}

#[tokio::test]
async fn reconcile_with_peer_version_uses_local_diff() {
    let mut store = store();
    store
        .edit(
            Fragment::Info,
            json!({
                "worker": {"description": "edited"},
                "input": {"description": ""},
                "output": {"description": ""}
            }),
        )
        .unwrap();

    let mut remote = Version::of(&store).digests().to_vec();
    remote[3] = "remote-info".into();
    let remote = Version(remote);
    let peer = MockPeer::with_verdicts(vec![Ok(PeerVerdict::Version(remote))]);

    let report = Reconciler::new(3).reconcile(&mut store, &peer).await.unwrap();
    assert_eq!(report.pushed, vec![Fragment::Info]);
    assert!(report.fetched.is_empty());
    assert_eq!(*peer.compares.lock().unwrap(), 2);
}

#[tokio::test]
async fn reconcile_retries_then_returns_last_error() {
    let mut store = store();
    let peer = MockPeer::with_verdicts(vec![
        Err(WorkerError::Reconcile("first".into())),
        Err(WorkerError::Reconcile("second".into())),
        Err(WorkerError::Reconcile("third".into())),
    ]);

    let err = Reconciler::new(3).reconcile(&mut store, &peer).await.unwrap_err();
    assert_eq!(err.to_string(), "reconciliation failed: third");
    assert_eq!(*peer.compares.lock().unwrap(), 3);
}

#[tokio::test]
async fn reconcile_recovers_after_a_failure() {
    let mut store = store();
    let peer = MockPeer::with_verdicts(vec![
        Err(WorkerError::timeout("compare response")),
        Ok(PeerVerdict::Changes("0.0.0.0.0".parse().unwrap())),
    ]);

    let report = Reconciler::for_store(&store)
        .reconcile(&mut store, &peer)
        .await
        .unwrap();
    assert_eq!(report.attempts, 2);
}
