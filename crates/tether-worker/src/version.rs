//! Configuration versioning and reconciliation with the manager.
//!
//! The version is one base64 SHA-256 digest per versioned fragment, in
//! [`VERSION_ORDER`], joined by `.`. Comparing two versions yields a
//! [`Diff`]: `0` where digests match, `1` where the local copy wins and
//! must be pushed, `-1` where the manager's copy wins and must be fetched.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::WorkerError;
use crate::store::ConfigStore;
use crate::types::{Fragment, VERSION_ORDER};

/// Separator between positions in versions and diffs.
pub const SEPARATOR: char = '.';

// ── Hashing ────────────────────────────────────────────────────────────

/// JSON with object keys sorted at every level and no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// base64(SHA-256(canonical JSON)).
pub fn fragment_digest(value: &Value) -> String {
    let hash = Sha256::digest(canonical_json(value).as_bytes());
    STANDARD.encode(hash)
}

// ── Version ────────────────────────────────────────────────────────────

/// Ordered fragment digests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version(Vec<String>);

impl Version {
    /// Digest every versioned fragment of the store.
    pub fn of(store: &ConfigStore) -> Self {
        Self(
            VERSION_ORDER
                .iter()
                .map(|fragment| fragment_digest(store.fragment(*fragment)))
                .collect(),
        )
    }

    pub fn digests(&self) -> &[String] {
        &self.0
    }

    pub fn digest(&self, fragment: Fragment) -> Option<&str> {
        let index = VERSION_ORDER.iter().position(|f| *f == fragment)?;
        self.0.get(index).map(String::as_str)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(&SEPARATOR.to_string()))
    }
}

impl FromStr for Version {
    type Err = WorkerError;

    // base64 never contains '.', so splitting is unambiguous.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digests: Vec<String> = s.split(SEPARATOR).map(str::to_string).collect();
        if digests.len() != VERSION_ORDER.len() {
            return Err(WorkerError::Reconcile(format!(
                "version has {} positions, expected {}",
                digests.len(),
                VERSION_ORDER.len()
            )));
        }
        Ok(Self(digests))
    }
}

// ── Diff ───────────────────────────────────────────────────────────────

/// Outcome for one fragment position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffCode {
    Same,
    /// Local copy is authoritative: push it.
    Local,
    /// Manager copy is newer: fetch it.
    Peer,
}

impl DiffCode {
    pub fn code(&self) -> i8 {
        match self {
            DiffCode::Same => 0,
            DiffCode::Local => 1,
            DiffCode::Peer => -1,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            0 => Some(DiffCode::Same),
            1 => Some(DiffCode::Local),
            -1 => Some(DiffCode::Peer),
            _ => None,
        }
    }
}

/// Position-wise comparison of two versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff(Vec<DiffCode>);

impl Diff {
    pub fn new(codes: Vec<DiffCode>) -> Self {
        Self(codes)
    }

    pub fn codes(&self) -> &[DiffCode] {
        &self.0
    }

    pub fn is_clean(&self) -> bool {
        self.0.iter().all(|c| *c == DiffCode::Same)
    }

    pub fn local_fragments(&self) -> Vec<Fragment> {
        self.fragments_with(DiffCode::Local)
    }

    pub fn peer_fragments(&self) -> Vec<Fragment> {
        self.fragments_with(DiffCode::Peer)
    }

    fn fragments_with(&self, wanted: DiffCode) -> Vec<Fragment> {
        VERSION_ORDER
            .iter()
            .zip(&self.0)
            .filter(|(_, code)| **code == wanted)
            .map(|(fragment, _)| *fragment)
            .collect()
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, code) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "{SEPARATOR}")?;
            }
            write!(f, "{}", code.code())?;
        }
        Ok(())
    }
}

impl FromStr for Diff {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let codes = s
            .split(SEPARATOR)
            .map(|part| {
                part.trim()
                    .parse::<i8>()
                    .ok()
                    .and_then(DiffCode::from_code)
                    .ok_or_else(|| WorkerError::Reconcile(format!("invalid diff code {part:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if codes.len() != VERSION_ORDER.len() {
            return Err(WorkerError::Reconcile(format!(
                "diff has {} positions, expected {}",
                codes.len(),
                VERSION_ORDER.len()
            )));
        }
        Ok(Self(codes))
    }
}

/// Compare `local` against `peer`.
///
/// A differing fragment with un-pushed local edits (`dirty`) is `Local`;
/// any other difference is `Peer`.
pub fn diff(local: &Version, peer: &Version, dirty: &BTreeSet<Fragment>) -> Diff {
    let codes = VERSION_ORDER
        .iter()
        .enumerate()
        .map(|(i, fragment)| {
            if local.0.get(i) == peer.0.get(i) {
                DiffCode::Same
            } else if dirty.contains(fragment) {
                DiffCode::Local
            } else {
                DiffCode::Peer
            }
        })
        .collect();
    Diff(codes)
}

// ── Peer seam ──────────────────────────────────────────────────────────

/// Manager answer to a `compare` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerVerdict {
    /// The manager computed the diff itself.
    Changes(Diff),
    /// The manager returned its version; the worker computes the diff.
    Version(Version),
}

/// The manager side of reconciliation.
#[async_trait]
pub trait ManagerPeer: Send + Sync {
    async fn compare(&self, version: &Version) -> Result<PeerVerdict, WorkerError>;

    /// Push local fragments.
    async fn push(&self, fragments: Map<String, Value>) -> Result<(), WorkerError>;

    /// Fetch the fragments the diff marks `-1`.
    async fn fetch(&self, diff: &Diff) -> Result<Map<String, Value>, WorkerError>;
}

// ── Reconciler ─────────────────────────────────────────────────────────

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub pushed: Vec<Fragment>,
    pub fetched: Vec<Fragment>,
    /// Attempts used, 1-based.
    pub attempts: u32,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.pushed.is_empty() && self.fetched.is_empty()
    }
}

/// Drives the compare → push → fetch loop against a [`ManagerPeer`].
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    retries: u32,
}

impl Reconciler {
    pub fn new(retries: u32) -> Self {
        Self {
            retries: retries.max(1),
        }
    }

    /// Budget from `settings.messageRetries`.
    pub fn for_store(store: &ConfigStore) -> Self {
        Self::new(store.message_retries())
    }

    pub fn current_version(store: &ConfigStore) -> Version {
        Version::of(store)
    }

    /// Run up to `retries` attempts until the manager reports no changes.
    ///
    /// Failed attempts are logged and retried; the last failure is returned.
    pub async fn reconcile(
        &self,
        store: &mut ConfigStore,
        peer: &dyn ManagerPeer,
    ) -> Result<ReconcileReport, WorkerError> {
        let mut report = ReconcileReport::default();
        let mut last_error = None;

        for attempt in 1..=self.retries {
            report.attempts = attempt;
            match self.attempt(store, peer).await {
                Ok(None) => {
                    tracing::debug!(attempt, "configuration in sync");
                    return Ok(report);
                }
                Ok(Some(pass)) => {
                    report.pushed.extend(pass.pushed);
                    report.fetched.extend(pass.fetched);
                    last_error = None;
                }
                Err(e) => {
                    tracing::warn!(attempt, retries = self.retries, error = %e, "reconciliation attempt failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// One compare round; `None` when nothing differs.
    async fn attempt(
        &self,
        store: &mut ConfigStore,
        peer: &dyn ManagerPeer,
    ) -> Result<Option<ReconcileReport>, WorkerError> {
        let version = Version::of(store);
        tracing::debug!(%version, "comparing configuration with manager");

        let changes = match peer.compare(&version).await? {
            PeerVerdict::Changes(changes) => changes,
            PeerVerdict::Version(remote) => diff(&version, &remote, store.dirty()),
        };
        if changes.is_clean() {
            return Ok(None);
        }
        let changes = resolve_conflicts(changes, store.dirty());
        self.apply(store, &changes, peer).await.map(Some)
    }

    /// Push every `1` fragment, then fetch and apply every `-1` fragment.
    pub async fn apply(
        &self,
        store: &mut ConfigStore,
        changes: &Diff,
        peer: &dyn ManagerPeer,
    ) -> Result<ReconcileReport, WorkerError> {
        let mut report = ReconcileReport::default();

        let local = changes.local_fragments();
        if !local.is_empty() {
            let mut fragments = Map::new();
            for fragment in &local {
                fragments.insert(fragment.as_str().into(), store.fragment(*fragment).clone());
            }
            tracing::debug!(count = local.len(), "pushing local fragments");
            peer.push(fragments).await?;
            store.mark_clean(&local);
            report.pushed = local;
        }

        let wanted = changes.peer_fragments();
        if !wanted.is_empty() {
            tracing::debug!(count = wanted.len(), "fetching fragments from manager");
            let fetched = peer.fetch(changes).await?;
            for (name, value) in fetched {
                let Some(fragment) = Fragment::from_name(&name).filter(|f| wanted.contains(f))
                else {
                    tracing::warn!(fragment = %name, "ignoring unrequested fragment from manager");
                    continue;
                };
                store.update(fragment, value).map_err(|e| {
                    WorkerError::Reconcile(format!("applying {fragment} failed: {e}"))
                })?;
                report.fetched.push(fragment);
            }
        }

        Ok(report)
    }
}

/// Enforce the edit policy on a diff the manager computed.
///
/// The manager cannot see local edits, so a dirty fragment it marked `-1`
/// is pushed instead. A `1` for a fragment the worker never edited is
/// trusted as is.
pub fn resolve_conflicts(changes: Diff, dirty: &BTreeSet<Fragment>) -> Diff {
    let codes = VERSION_ORDER
        .iter()
        .zip(changes.0)
        .map(|(fragment, code)| match code {
            DiffCode::Peer if dirty.contains(fragment) => DiffCode::Local,
            other => other,
        })
        .collect();
    Diff(codes)
}

#[cfg(test)]
mod tests;
