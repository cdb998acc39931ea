//! Configuration store.
//!
//! The worker's configuration is one JSON document that references
//! sub-artifacts by path:
//!
//! ```json
//! {
//!   "credentials": "worker-id:api-key",
//!   "url": "https://manager.example:443",
//!   "privKey": "keys/worker.key",
//!   "schema": { "input": "schema/input.json", "output": "schema/output.json" },
//!   "profile": { "location": { "latitude": 0.0, "longitude": 0.0 } },
//!   "info": {
//!     "worker": { "description": "info/worker.md" },
//!     "input":  { "description": "info/input.md" },
//!     "output": { "description": "info/output.md" }
//!   },
//!   "settings": { "messageRetries": 3 }
//! }
//! ```
//!
//! [`ConfigStore`] resolves those paths into content (relative paths are
//! taken from the document's directory), creates missing sub-artifacts with
//! defaults, and is the only writer of the document and its artifacts.

mod backend;

pub use backend::{ConfigBackend, FsBackend, MemoryBackend};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tether_transport::Credentials;
use url::Url;

use crate::error::WorkerError;
use crate::signer::Signer;
use crate::types::Fragment;

/// Retry budget for reconciliation when `settings.messageRetries` is absent.
pub const DEFAULT_MESSAGE_RETRIES: u32 = 3;

const SCHEMA_PARTS: [&str; 2] = ["input", "output"];
const INFO_PARTS: [&str; 3] = ["worker", "input", "output"];
const REQUIRED_FIELDS: [Fragment; 7] = [
    Fragment::Credentials,
    Fragment::Url,
    Fragment::PrivKey,
    Fragment::Schema,
    Fragment::Profile,
    Fragment::Info,
    Fragment::Settings,
];

/// One pending file write of a composite update.
struct Write {
    path: PathBuf,
    contents: String,
}

/// Owner of the resolved worker configuration.
pub struct ConfigStore {
    path: PathBuf,
    base_dir: PathBuf,
    backend: Arc<dyn ConfigBackend>,
    /// The document as stored, with artifact paths.
    document: Map<String, Value>,
    /// Fragments with artifact contents in place of paths.
    resolved: Map<String, Value>,
    /// Fragments edited locally and not yet pushed to the manager.
    dirty: BTreeSet<Fragment>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.path)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// Load and resolve the document at `path` from the filesystem.
    pub fn open(path: impl Into<PathBuf>, signer: &dyn Signer) -> Result<Self, WorkerError> {
        Self::load(path, Arc::new(FsBackend), signer)
    }

    /// Load, validate and resolve the document at `path`.
    ///
    /// Missing sub-artifacts are created: a fresh key from `signer`, `{}`
    /// for schemas, an empty string for descriptions.
    pub fn load(
        path: impl Into<PathBuf>,
        backend: Arc<dyn ConfigBackend>,
        signer: &dyn Signer,
    ) -> Result<Self, WorkerError> {
        let path = path.into();
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let text = backend
            .read(&path)
            .map_err(|source| WorkerError::Storage {
                path: path.clone(),
                source,
            })?
            .ok_or_else(|| {
                WorkerError::Validation(format!("no configuration at {}", path.display()))
            })?;
        let document = match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return Err(WorkerError::Validation(
                    "configuration must be a JSON object".into(),
                ))
            }
            Err(e) => {
                return Err(WorkerError::Validation(format!(
                    "configuration is not valid JSON: {e}"
                )))
            }
        };
        validate_document(&document)?;

        let mut store = Self {
            path,
            base_dir,
            backend,
            document,
            resolved: Map::new(),
            dirty: BTreeSet::new(),
        };
        store.resolve_all(signer)?;
        tracing::debug!(path = %store.path.display(), "configuration loaded");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolved value of a fragment (`Null` when absent).
    pub fn fragment(&self, fragment: Fragment) -> &Value {
        self.resolved
            .get(fragment.as_str())
            .unwrap_or(&Value::Null)
    }

    /// The whole resolved configuration.
    pub fn snapshot(&self) -> &Map<String, Value> {
        &self.resolved
    }

    pub fn credentials(&self) -> Result<Credentials, WorkerError> {
        self.fragment(Fragment::Credentials)
            .as_str()
            .unwrap_or_default()
            .parse()
            .map_err(|e: tether_transport::TransportError| WorkerError::Validation(e.to_string()))
    }

    pub fn manager_url(&self) -> Result<Url, WorkerError> {
        let raw = self.fragment(Fragment::Url).as_str().unwrap_or_default();
        Url::parse(raw).map_err(|e| WorkerError::Validation(format!("url: {e}")))
    }

    /// Worker id: the part of the credentials before `:`.
    pub fn worker_id(&self) -> &str {
        let credentials = self.fragment(Fragment::Credentials).as_str().unwrap_or_default();
        credentials
            .split_once(':')
            .map_or(credentials, |(id, _)| id)
    }

    pub fn private_key(&self) -> &str {
        self.fragment(Fragment::PrivKey).as_str().unwrap_or_default()
    }

    /// `profile.location`, `Null` when unset.
    pub fn location(&self) -> Value {
        self.fragment(Fragment::Profile)
            .get("location")
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn input_schema(&self) -> &Value {
        self.fragment(Fragment::Schema)
            .get("input")
            .unwrap_or(&Value::Null)
    }

    pub fn output_schema(&self) -> &Value {
        self.fragment(Fragment::Schema)
            .get("output")
            .unwrap_or(&Value::Null)
    }

    /// `settings.messageRetries`, at least 1.
    pub fn message_retries(&self) -> u32 {
        self.fragment(Fragment::Settings)
            .get("messageRetries")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_MESSAGE_RETRIES, |n| n.clamp(1, u32::MAX as u64) as u32)
    }

    // ── Dirty tracking ─────────────────────────────────────────────────

    /// Apply a local edit: persist it and flag the fragment for pushing.
    pub fn edit(&mut self, fragment: Fragment, value: Value) -> Result<(), WorkerError> {
        self.update(fragment, value)?;
        if fragment.is_versioned() {
            self.dirty.insert(fragment);
        }
        Ok(())
    }

    pub fn is_dirty(&self, fragment: Fragment) -> bool {
        self.dirty.contains(&fragment)
    }

    pub fn dirty(&self) -> &BTreeSet<Fragment> {
        &self.dirty
    }

    /// Clear the edit flag once the manager has accepted the fragments.
    pub fn mark_clean<'a>(&mut self, fragments: impl IntoIterator<Item = &'a Fragment>) {
        for fragment in fragments {
            self.dirty.remove(fragment);
        }
    }

    // ── Update path ────────────────────────────────────────────────────

    /// Replace a fragment.
    ///
    /// Composite fragments write their sub-artifacts first, then the
    /// document. If any write fails, artifacts already written are restored
    /// and memory is left untouched.
    pub fn update(&mut self, fragment: Fragment, value: Value) -> Result<(), WorkerError> {
        tracing::debug!(%fragment, "updating configuration fragment");
        let name = fragment.as_str();

        let mut document = self.document.clone();
        let mut memory = value.clone();
        let mut writes = Vec::new();

        match fragment {
            Fragment::PrivKey => {
                let Value::String(key) = &value else {
                    return Err(WorkerError::Validation("privKey must be a string".into()));
                };
                let path = self.artifact_path(document.get(name))?;
                writes.push(Write {
                    path,
                    contents: key.clone(),
                });
            }
            Fragment::Schema => {
                let Value::Object(schema) = &value else {
                    return Err(WorkerError::Validation("schema must be an object".into()));
                };
                let mut stored = schema.clone();
                let mut resolved = schema.clone();
                for part in SCHEMA_PARTS {
                    let reference = document.get(name).and_then(|s| s.get(part));
                    let path = self.artifact_path(reference)?;
                    let content = schema.get(part).cloned().unwrap_or_else(empty_object);
                    writes.push(Write {
                        path,
                        contents: to_pretty(&content)?,
                    });
                    stored.insert(part.into(), reference.cloned().unwrap_or(Value::Null));
                    resolved.insert(part.into(), content);
                }
                document.insert(name.into(), Value::Object(stored));
                memory = Value::Object(resolved);
            }
            Fragment::Info => {
                let Value::Object(info) = &value else {
                    return Err(WorkerError::Validation("info must be an object".into()));
                };
                let mut stored = info.clone();
                let mut resolved = info.clone();
                for part in INFO_PARTS {
                    let reference = document
                        .get(name)
                        .and_then(|i| i.get(part))
                        .and_then(|p| p.get("description"));
                    let path = self.artifact_path(reference)?;
                    let description = match info.get(part).and_then(|p| p.get("description")) {
                        Some(Value::String(text)) => text.clone(),
                        Some(Value::Null) | None => String::new(),
                        Some(other) => other.to_string(),
                    };
                    writes.push(Write {
                        path,
                        contents: description.clone(),
                    });

                    set_description(&mut stored, part, reference.cloned().unwrap_or(Value::Null));
                    set_description(&mut resolved, part, Value::String(description));
                }
                document.insert(name.into(), Value::Object(stored));
                memory = Value::Object(resolved);
            }
            Fragment::Url => {
                let raw = value.as_str().unwrap_or_default();
                Url::parse(raw).map_err(|e| WorkerError::Validation(format!("url: {e}")))?;
                document.insert(name.into(), value.clone());
            }
            Fragment::Credentials => {
                let raw = value.as_str().unwrap_or_default();
                if raw.parse::<Credentials>().is_err() {
                    return Err(WorkerError::Validation(
                        "credentials must have the form `id:apikey`".into(),
                    ));
                }
                document.insert(name.into(), value.clone());
            }
            Fragment::Profile | Fragment::Settings => {
                document.insert(name.into(), value.clone());
            }
        }

        if document != self.document {
            writes.push(Write {
                path: self.path.clone(),
                contents: to_pretty(&Value::Object(document.clone()))?,
            });
        }

        self.commit(writes)?;
        self.document = document;
        self.resolved.insert(name.into(), memory);
        Ok(())
    }

    // ── Internal ───────────────────────────────────────────────────────

    fn resolve_all(&mut self, signer: &dyn Signer) -> Result<(), WorkerError> {
        for fragment in REQUIRED_FIELDS {
            let value = match fragment {
                Fragment::PrivKey => Value::String(self.resolve_key(signer)?),
                Fragment::Schema => self.resolve_schema()?,
                Fragment::Info => self.resolve_info()?,
                _ => self
                    .document
                    .get(fragment.as_str())
                    .cloned()
                    .unwrap_or(Value::Null),
            };
            self.resolved.insert(fragment.as_str().into(), value);
        }
        Ok(())
    }

    fn resolve_key(&self, signer: &dyn Signer) -> Result<String, WorkerError> {
        let path = self.artifact_path(self.document.get(Fragment::PrivKey.as_str()))?;
        if let Some(key) = self.read(&path)? {
            return Ok(key);
        }
        tracing::info!(path = %path.display(), "no private key found, generating one");
        let key = signer.generate_key()?;
        self.write(&path, &key)?;
        Ok(key)
    }

    fn resolve_schema(&self) -> Result<Value, WorkerError> {
        let mut schema = self
            .document
            .get(Fragment::Schema.as_str())
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        for part in SCHEMA_PARTS {
            let path = self.artifact_path(schema.get(part))?;
            let content = match self.read(&path)? {
                Some(text) => serde_json::from_str(&text).map_err(|e| {
                    WorkerError::Validation(format!("{} is not valid JSON: {e}", path.display()))
                })?,
                None => {
                    tracing::debug!(path = %path.display(), "creating empty {part} schema");
                    self.write(&path, "{}")?;
                    empty_object()
                }
            };
            schema.insert(part.into(), content);
        }
        Ok(Value::Object(schema))
    }

    fn resolve_info(&self) -> Result<Value, WorkerError> {
        let mut info = self
            .document
            .get(Fragment::Info.as_str())
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        for part in INFO_PARTS {
            let mut section = info
                .get(part)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let path = self.artifact_path(section.get("description"))?;
            let description = match self.read(&path)? {
                Some(text) => text,
                None => {
                    tracing::debug!(path = %path.display(), "creating empty {part} description");
                    self.write(&path, "")?;
                    String::new()
                }
            };
            section.insert("description".into(), Value::String(description));
            info.insert(part.into(), Value::Object(section));
        }
        Ok(Value::Object(info))
    }

    /// Resolve an artifact reference from the document to a path.
    fn artifact_path(&self, reference: Option<&Value>) -> Result<PathBuf, WorkerError> {
        let Some(Value::String(raw)) = reference else {
            return Err(WorkerError::Validation(
                "artifact reference must be a path string".into(),
            ));
        };
        let path = Path::new(raw);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        })
    }

    fn read(&self, path: &Path) -> Result<Option<String>, WorkerError> {
        self.backend.read(path).map_err(|source| WorkerError::Storage {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write(&self, path: &Path, contents: &str) -> Result<(), WorkerError> {
        self.backend
            .write(path, contents)
            .map_err(|source| WorkerError::Storage {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Perform `writes` in order; on failure undo what was written.
    ///
    /// Every target is read before the first write, so a failed read
    /// leaves storage untouched. Files that did not exist are removed again.
    fn commit(&self, writes: Vec<Write>) -> Result<(), WorkerError> {
        let mut previous = Vec::with_capacity(writes.len());
        for write in &writes {
            previous.push(self.read(&write.path)?);
        }

        for (index, write) in writes.iter().enumerate() {
            if let Err(err) = self.write(&write.path, &write.contents) {
                self.rollback(&writes[..index], &previous[..index]);
                return Err(err);
            }
        }
        Ok(())
    }

    fn rollback(&self, written: &[Write], previous: &[Option<String>]) {
        for (write, previous) in written.iter().zip(previous).rev() {
            let restored = match previous {
                Some(contents) => self.backend.write(&write.path, contents),
                None => self.backend.remove(&write.path),
            };
            if let Err(e) = restored {
                tracing::warn!(path = %write.path.display(), error = %e, "rollback failed");
            }
        }
    }
}

fn validate_document(document: &Map<String, Value>) -> Result<(), WorkerError> {
    for field in REQUIRED_FIELDS {
        if !document.contains_key(field.as_str()) {
            return Err(WorkerError::Validation(format!(
                "configuration is missing required field `{field}`"
            )));
        }
    }

    let Some(credentials) = document.get("credentials").and_then(Value::as_str) else {
        return Err(WorkerError::Validation("`credentials` must be a string".into()));
    };
    if credentials
        .parse::<Credentials>()
        .is_err()
    {
        return Err(WorkerError::Validation(
            "`credentials` must have the form `id:apikey`".into(),
        ));
    }

    let url = document.get("url").and_then(Value::as_str).unwrap_or_default();
    Url::parse(url).map_err(|e| WorkerError::Validation(format!("`url` is not a valid URL: {e}")))?;

    if !document.get("privKey").is_some_and(Value::is_string) {
        return Err(WorkerError::Validation("`privKey` must be a path".into()));
    }
    for part in SCHEMA_PARTS {
        if !document["schema"].get(part).is_some_and(Value::is_string) {
            return Err(WorkerError::Validation(format!("`schema.{part}` must be a path")));
        }
    }
    for part in INFO_PARTS {
        let description = document["info"].get(part).and_then(|p| p.get("description"));
        if !description.is_some_and(Value::is_string) {
            return Err(WorkerError::Validation(format!(
                "`info.{part}.description` must be a path"
            )));
        }
    }
    Ok(())
}

/// Set `section[part].description`, turning a non-object part into an object.
fn set_description(section: &mut Map<String, Value>, part: &str, description: Value) {
    let entry = section.entry(part).or_insert_with(empty_object);
    if !entry.is_object() {
        *entry = empty_object();
    }
    if let Some(entry) = entry.as_object_mut() {
        entry.insert("description".into(), description);
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn to_pretty(value: &Value) -> Result<String, WorkerError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| WorkerError::Validation(format!("cannot serialize configuration: {e}")))
}
