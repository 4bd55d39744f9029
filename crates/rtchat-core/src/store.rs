// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Key-value store abstraction.
//!
//! `KeyValueStore` is the single seam between the crate and whatever shared
//! storage the host provides. It is the only process-wide state the client
//! tolerates: sibling instances coordinate their slots through it, and the
//! identity records persist in it. The caller constructs the concrete
//! implementation and wraps it in an `Arc`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::error::Error;

/// Storage-agnostic string key/value interface.
///
/// All methods are synchronous; implementations are expected to be cheap
/// (in-process memory or a small local file).
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), Error>;
    fn remove(&self, key: &str) -> Result<(), Error>;
    fn clear(&self) -> Result<(), Error>;
    /// Every key currently present, in unspecified order.
    fn keys(&self) -> Vec<String>;
}

// ── In-memory implementation ──────────────────────────────────────────────────

/// Thread-safe in-memory store.
///
/// Clones share the same underlying map, so several client instances
/// constructed in one test process observe each other's writes — exactly the
/// contention the instance registry is designed for.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.inner
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), Error> {
        self.inner.lock().unwrap().clear();
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }
}

// ── File-backed implementation ────────────────────────────────────────────────

/// Store persisted as a single JSON object on disk.
///
/// Every mutation rewrites the file through a temporary sibling so a crash
/// mid-write never leaves a truncated image behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    cache: Arc<Mutex<BTreeMap<String, String>>>,
}

impl FileStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let cache = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| Error::Store(format!("corrupt store {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::Store(format!("reading {}: {e}", path.display()))),
        };
        Ok(Self {
            path,
            cache: Arc::new(Mutex::new(cache)),
        })
    }

    fn flush(&self, map: &BTreeMap<String, String>) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Store(format!("creating {}: {e}", parent.display())))?;
        }
        let tmp = self.path.with_extension("tmp");
        let text = serde_json::to_string_pretty(map)
            .map_err(|e| Error::Store(format!("serializing store: {e}")))?;
        std::fs::write(&tmp, text)
            .map_err(|e| Error::Store(format!("writing {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Store(format!("replacing {}: {e}", self.path.display())))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.cache.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut map = self.cache.lock().unwrap();
        map.insert(key.to_string(), value.to_string());
        self.flush(&map)
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        let mut map = self.cache.lock().unwrap();
        if map.remove(key).is_some() {
            self.flush(&map)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), Error> {
        let mut map = self.cache.lock().unwrap();
        map.clear();
        self.flush(&map)
    }

    fn keys(&self) -> Vec<String> {
        self.cache.lock().unwrap().keys().cloned().collect()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k"), None);
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").as_deref(), Some("v"));
        store.remove("k").unwrap();
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn memory_store_clones_share_state() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.set("shared", "yes").unwrap();
        assert_eq!(b.get("shared").as_deref(), Some("yes"));
        b.clear().unwrap();
        assert!(a.keys().is_empty());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let store = FileStore::open(&path).unwrap();
            store.set("name", "alice").unwrap();
            store.set("slot:0", "12345").unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get("name").as_deref(), Some("alice"));
        assert_eq!(store.keys(), vec!["name".to_string(), "slot:0".to_string()]);
    }

    #[test]
    fn file_store_rejects_corrupt_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(FileStore::open(&path).is_err());
    }
}
