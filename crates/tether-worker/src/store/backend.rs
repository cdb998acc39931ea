//! Storage backends for the configuration document and its sub-artifacts.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Where configuration files live.
///
/// Reads of missing files return `Ok(None)` so the store can create
/// sub-artifacts lazily. Writes must create missing parent directories.
pub trait ConfigBackend: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Option<String>>;
    fn write(&self, path: &Path, contents: &str) -> io::Result<()>;
    /// Delete a file. Removing a missing file is not an error.
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Plain filesystem backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsBackend;

impl ConfigBackend for FsBackend {
    fn read(&self, path: &Path) -> io::Result<Option<String>> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, contents)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// In-memory backend with injectable read and write failures.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    files: Mutex<HashMap<PathBuf, String>>,
    failing: Mutex<HashSet<PathBuf>>,
    unreadable: Mutex<HashSet<PathBuf>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file.
    pub fn insert(&self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        lock(&self.files).insert(path.into(), contents.into());
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<String> {
        lock(&self.files).get(path.as_ref()).cloned()
    }

    /// Make every later write to `path` fail with `PermissionDenied`.
    pub fn fail_writes_to(&self, path: impl Into<PathBuf>) {
        lock(&self.failing).insert(path.into());
    }

    /// Make every later read of `path` fail with `PermissionDenied`.
    pub fn fail_reads_of(&self, path: impl Into<PathBuf>) {
        lock(&self.unreadable).insert(path.into());
    }

    pub fn clear_failures(&self) {
        lock(&self.failing).clear();
        lock(&self.unreadable).clear();
    }
}

impl ConfigBackend for MemoryBackend {
    fn read(&self, path: &Path) -> io::Result<Option<String>> {
        if lock(&self.unreadable).contains(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read refused"));
        }
        Ok(lock(&self.files).get(path).cloned())
    }

    fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        if lock(&self.failing).contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "write refused",
            ));
        }
        lock(&self.files).insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        if lock(&self.failing).contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "remove refused",
            ));
        }
        lock(&self.files).remove(path);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
