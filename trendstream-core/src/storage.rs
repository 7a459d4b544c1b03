//! Client-side persisted state
//!
//! Two kinds of storage back the collector's identifiers:
//!
//! | Store | Lifetime | Holds |
//! |-------|----------|-------|
//! | [`SessionStore`] | one browsing context | session id, last activity |
//! | [`DurableStore`] | until expiry | user id |
//!
//! Every operation is fallible so hosts with storage disabled can report it;
//! the identity layer decides how to degrade.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Session-scoped key/value storage
pub trait SessionStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// Durable key/value storage with per-entry expiry (cookie-like)
pub trait DurableStore: Send {
    /// Returns the value if present and not expired at `now`.
    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Entry {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn live_value(&self, now: DateTime<Utc>) -> Option<String> {
        match self.expires_at {
            Some(expires_at) if expires_at <= now => None,
            _ => Some(self.value.clone()),
        }
    }
}

/// In-memory store, used for in-process page contexts and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: HashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|e| e.value.clone()))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        Ok(self.entries.get(key).and_then(|e| e.live_value(now)))
    }

    fn set(&mut self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// JSON-file store
///
/// The whole map is rewritten on every change. Used by the CLI so identifiers
/// survive between invocations.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<Option<HashMap<String, Entry>>>,
}

impl FileStore {
    /// Create a store backed by `path`. The file is read lazily.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<HashMap<String, Entry>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(HashMap::new()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                Error::Storage(format!("corrupt store {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(Error::Storage(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> Result<T> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| Error::Storage("store lock poisoned".to_string()))?;
        if guard.is_none() {
            *guard = Some(self.read_file()?);
        }
        let entries = guard.get_or_insert_with(HashMap::new);
        Ok(f(entries))
    }

    fn persist(&self) -> Result<()> {
        let snapshot = self.with_entries(|entries| serde_json::to_string_pretty(entries))??;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(&self.path, snapshot)
            .map_err(|e| Error::Storage(format!("failed to write {}: {}", self.path.display(), e)))
    }

    fn insert(&mut self, key: &str, entry: Entry) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), entry);
        })?;
        self.persist()
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        let removed = self.with_entries(|entries| entries.remove(key).is_some())?;
        if removed {
            self.persist()?;
        }
        Ok(())
    }
}

impl SessionStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_entries(|entries| entries.get(key).map(|e| e.value.clone()))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.insert(
            key,
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        )
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.delete(key)
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        self.with_entries(|entries| entries.get(key).and_then(|e| e.live_value(now)))
    }

    fn set(&mut self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.insert(
            key,
            Entry {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        )
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.delete(key)
    }
}
