// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Peer identity and the name wire format.
//!
//! A peer is addressed by a display name. Three decorations may ride on it:
//!
//! - `name(3)` — the instance slot of a sibling running in the same place,
//! - `name|<public key>` — the serialized identity exchanged during trust,
//! - both: `name(3)|<public key>`.
//!
//! [`extract_name`] reduces any of these to the bare name; every map in the
//! identity store is keyed by the bare form so decorations never split one
//! peer into several records.

use serde::{Deserialize, Serialize};

/// Reduce any decorated peer string to its bare name.
///
/// Split on `|` (take the prefix), then on `(` (take the prefix), then trim.
pub fn extract_name(peer: &str) -> String {
    let peer = peer.split('|').next().unwrap_or_default();
    let peer = peer.split('(').next().unwrap_or_default();
    peer.trim().to_string()
}

/// Display name with the instance slot stamped on, e.g. `alice(2)`.
/// Slot 0 stays undecorated.
pub fn slotted_name(bare: &str, slot: u32) -> String {
    if slot == 0 {
        bare.to_string()
    } else {
        format!("{bare}({slot})")
    }
}

/// True when `name` carries the `anon` prefix handed out to peers that never
/// chose a name. Anonymous records are not worth persisting.
pub fn is_anonymous(name: &str) -> bool {
    name.starts_with("anon")
}

/// A peer identity: bare name plus, once known, its public key string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub bare_name: String,
    pub public_key: Option<String>,
}

impl Identity {
    pub fn new(bare_name: impl Into<String>) -> Self {
        Self {
            bare_name: bare_name.into(),
            public_key: None,
        }
    }

    pub fn with_key(bare_name: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            bare_name: bare_name.into(),
            public_key: Some(public_key.into()),
        }
    }

    /// Parse a serialized identity (`name` or `name|publicKey`).
    pub fn parse(s: &str) -> Self {
        match s.split_once('|') {
            Some((name, key)) if !key.is_empty() => Identity {
                bare_name: extract_name(name),
                public_key: Some(key.to_string()),
            },
            _ => Identity::new(extract_name(s)),
        }
    }

    /// Serialized wire form: `name|publicKey`, or just the name when no key
    /// is known.
    pub fn serialize(&self) -> String {
        match &self.public_key {
            Some(key) => format!("{}|{}", self.bare_name, key),
            None => self.bare_name.clone(),
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.bare_name)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
