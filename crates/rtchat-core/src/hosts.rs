// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Persistent peer identity records.
//!
//! One store key (`knownHostsStrings`) holds the whole `name → public key`
//! map as JSON. A reverse index `key → {names}` is derived in memory on load
//! and kept consistent by every mutation; it is never persisted.
//!
//! The store refuses to bind a public key that already belongs to a
//! different set of names — rebinding is a deliberate two-step (remove, then
//! save) that only the trust engine performs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::{
    crypto::{CryptoProvider, KeyPair},
    error::Error,
    identity::{extract_name, is_anonymous},
    store::KeyValueStore,
};

const KNOWN_HOSTS_KEY: &str = "knownHostsStrings";
const NAME_KEY: &str = "rtchat_name";
const LEGACY_NAME_KEY: &str = "name";
const PUBLIC_KEY_KEY: &str = "publicKeyString";
const PRIVATE_KEY_KEY: &str = "privateKeyString";

/// `name → public key` records with a derived reverse index.
pub struct HostRecords {
    store: Arc<dyn KeyValueStore>,
    names: BTreeMap<String, String>,
    by_key: HashMap<String, BTreeSet<String>>,
}

impl HostRecords {
    /// Load the records from the store. Names are normalized through
    /// [`extract_name`]; anonymous entries are dropped.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let raw: BTreeMap<String, String> = store
            .get(KNOWN_HOSTS_KEY)
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();

        let mut records = Self {
            store,
            names: BTreeMap::new(),
            by_key: HashMap::new(),
        };
        for (name, key) in raw {
            let bare = extract_name(&name);
            if bare.is_empty() || is_anonymous(&bare) {
                continue;
            }
            records.index(bare, key);
        }
        records
    }

    fn index(&mut self, name: String, key: String) {
        self.by_key
            .entry(key.clone())
            .or_default()
            .insert(name.clone());
        self.names.insert(name, key);
    }

    fn persist(&self) -> Result<(), Error> {
        let text =
            serde_json::to_string(&self.names).map_err(|e| Error::Store(e.to_string()))?;
        self.store.set(KNOWN_HOSTS_KEY, &text)
    }

    /// Stored public key for `name`, if any.
    pub fn key_for(&self, name: &str) -> Option<&str> {
        self.names.get(&extract_name(name)).map(String::as_str)
    }

    /// Every name bound to `key`, sorted.
    pub fn names_for(&self, key: &str) -> Vec<String> {
        self.by_key
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_known_key(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    /// Bind `name → key` and persist.
    ///
    /// Fails with [`Error::KeyAlreadyBound`] when `key` already belongs to a
    /// different set of names. Callers that intend to rebind must
    /// [`remove`](Self::remove) the old owners first.
    pub fn save(&mut self, name: &str, key: &str) -> Result<(), Error> {
        let bare = extract_name(name);
        if let Some(owners) = self.by_key.get(key) {
            let sole_owner = owners.len() == 1 && owners.contains(&bare);
            if !sole_owner {
                return Err(Error::KeyAlreadyBound(owners.iter().cloned().collect()));
            }
        }
        // A name changing keys leaves its old reverse entry behind otherwise.
        self.unindex(&bare);
        self.index(bare, key.to_string());
        self.persist()
    }

    fn unindex(&mut self, bare: &str) {
        if let Some(old_key) = self.names.remove(bare) {
            if let Some(set) = self.by_key.get_mut(&old_key) {
                set.remove(bare);
                if set.is_empty() {
                    self.by_key.remove(&old_key);
                }
            }
        }
    }

    /// Drop the record for `name` and persist.
    pub fn remove(&mut self, name: &str) -> Result<(), Error> {
        self.unindex(&extract_name(name));
        self.persist()
    }

    /// Rename a record in place, keeping its key.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), Error> {
        let old = extract_name(old);
        let new = extract_name(new);
        if let Some(key) = self.names.get(&old).cloned() {
            self.unindex(&old);
            self.index(new, key);
            self.persist()?;
        }
        Ok(())
    }

    /// Forget every record.
    pub fn clear(&mut self) -> Result<(), Error> {
        self.names.clear();
        self.by_key.clear();
        self.store.remove(KNOWN_HOSTS_KEY)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

// ── Own identity ──────────────────────────────────────────────────────────────

/// This instance's own persisted identity: bare name and RSA key pair.
#[derive(Debug, Clone)]
pub struct OwnIdentity {
    pub bare_name: String,
    pub public_jwk: String,
    pub private_jwk: String,
}

impl OwnIdentity {
    /// Load the persisted identity, generating whatever is missing.
    ///
    /// The name is taken from the configuration first, then the store
    /// (`rtchat_name`, with the legacy `name` key as fallback); when neither
    /// exists an `anon…` name is generated and deliberately not persisted.
    pub fn load_or_generate(
        store: &dyn KeyValueStore,
        crypto: &dyn CryptoProvider,
        configured_name: Option<&str>,
    ) -> Result<Self, Error> {
        let bare_name = match configured_name {
            Some(name) => {
                let bare = extract_name(name);
                store.set(NAME_KEY, &bare)?;
                bare
            }
            None => match store.get(NAME_KEY).or_else(|| store.get(LEGACY_NAME_KEY)) {
                Some(stored) => extract_name(&stored),
                None => {
                    let suffix: Vec<u8> = crypto.random_bytes(2);
                    format!("anon{:02x}{:02x}", suffix[0], suffix[1])
                }
            },
        };

        let (public_jwk, private_jwk) =
            match (store.get(PUBLIC_KEY_KEY), store.get(PRIVATE_KEY_KEY)) {
                (Some(public), Some(private)) => (public, private),
                _ => {
                    debug!("no stored key pair, generating");
                    let KeyPair {
                        public_jwk,
                        private_jwk,
                    } = crypto.generate_keypair()?;
                    store.set(PUBLIC_KEY_KEY, &public_jwk)?;
                    store.set(PRIVATE_KEY_KEY, &private_jwk)?;
                    (public_jwk, private_jwk)
                }
            };

        Ok(Self {
            bare_name,
            public_jwk,
            private_jwk,
        })
    }

    /// Persist a new bare name.
    pub fn store_name(store: &dyn KeyValueStore, bare: &str) -> Result<(), Error> {
        store.set(NAME_KEY, bare)
    }

    /// Clear own key material and name, as part of a full reset.
    pub fn clear(store: &dyn KeyValueStore) -> Result<(), Error> {
        store.remove(PUBLIC_KEY_KEY)?;
        store.remove(PRIVATE_KEY_KEY)?;
        store.remove(NAME_KEY)?;
        store.remove(LEGACY_NAME_KEY)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn records() -> HostRecords {
        HostRecords::load(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn save_and_lookup() {
        let mut r = records();
        r.save("alice", "k1").unwrap();
        assert_eq!(r.key_for("alice"), Some("k1"));
        assert_eq!(r.key_for("alice(2)|k1"), Some("k1"), "decorations ignored");
        assert_eq!(r.names_for("k1"), vec!["alice".to_string()]);
    }

    #[test]
    fn duplicate_key_insert_is_refused() {
        let mut r = records();
        r.save("alice", "k1").unwrap();
        let err = r.save("bob", "k1").unwrap_err();
        assert!(matches!(err, Error::KeyAlreadyBound(names) if names == vec!["alice".to_string()]));
    }

    #[test]
    fn rebind_after_remove_succeeds() {
        let mut r = records();
        r.save("alice", "k1").unwrap();
        r.remove("alice").unwrap();
        r.save("bob", "k1").unwrap();
        assert_eq!(r.key_for("alice"), None);
        assert_eq!(r.names_for("k1"), vec!["bob".to_string()]);
    }

    #[test]
    fn name_changing_keys_updates_reverse_index() {
        let mut r = records();
        r.save("alice", "k1").unwrap();
        r.save("alice", "k2").unwrap();
        assert_eq!(r.key_for("alice"), Some("k2"));
        assert!(r.names_for("k1").is_empty(), "old reverse entry must go");
        assert_eq!(r.names_for("k2"), vec!["alice".to_string()]);
    }

    #[test]
    fn rename_keeps_key() {
        let mut r = records();
        r.save("alice", "k1").unwrap();
        r.rename("alice", "alicia").unwrap();
        assert_eq!(r.key_for("alicia"), Some("k1"));
        assert_eq!(r.key_for("alice"), None);
        assert_eq!(r.names_for("k1"), vec!["alicia".to_string()]);
    }

    #[test]
    fn records_persist_and_reload() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        {
            let mut r = HostRecords::load(Arc::clone(&store));
            r.save("alice", "k1").unwrap();
            r.save("bob", "k2").unwrap();
        }
        let r = HostRecords::load(store);
        assert_eq!(r.len(), 2);
        assert_eq!(r.key_for("bob"), Some("k2"));
    }

    #[test]
    fn anonymous_records_are_not_loaded() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store
            .set(
                KNOWN_HOSTS_KEY,
                "{\"anon12ab\":\"k1\",\"carol\":\"k2\"}",
            )
            .unwrap();
        let r = HostRecords::load(store);
        assert_eq!(r.len(), 1);
        assert_eq!(r.key_for("carol"), Some("k2"));
        assert_eq!(r.key_for("anon12ab"), None);
    }

    #[test]
    fn own_identity_generates_once() {
        let store = MemoryStore::new();
        let crypto = crate::crypto::RsaPssCrypto::new();
        let first = OwnIdentity::load_or_generate(&store, &crypto, Some("alice")).unwrap();
        let second = OwnIdentity::load_or_generate(&store, &crypto, None).unwrap();
        assert_eq!(second.bare_name, "alice", "name persisted across restarts");
        assert_eq!(first.public_jwk, second.public_jwk, "key pair is stable");
    }

    #[test]
    fn own_identity_defaults_to_anonymous() {
        let store = MemoryStore::new();
        let crypto = crate::crypto::RsaPssCrypto::new();
        let id = OwnIdentity::load_or_generate(&store, &crypto, None).unwrap();
        assert!(id.bare_name.starts_with("anon"));
        assert!(
            store.get("rtchat_name").is_none(),
            "anonymous names are not persisted"
        );
    }

    #[test]
    fn clear_removes_key_material() {
        let store = MemoryStore::new();
        let crypto = crate::crypto::RsaPssCrypto::new();
        OwnIdentity::load_or_generate(&store, &crypto, Some("alice")).unwrap();
        OwnIdentity::clear(&store).unwrap();
        assert!(store.get("publicKeyString").is_none());
        assert!(store.get("privateKeyString").is_none());
        assert!(store.get("rtchat_name").is_none());
    }
}
