// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Peer trust: categorization and policy.
//!
//! The engine works in two stages. First a peer's `(key, name)` history is
//! reduced to one of seven categories — what the peer *is*. Then a policy
//! matrix maps the category to an action — what to *do* about it. The matrix
//! must be total over the categories; construction fails otherwise, so a
//! policy can never meet a peer it has no answer for.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use rtchat_config::TrustMode;

use crate::{error::Error, hosts::HostRecords, identity::extract_name};

/// What a peer is, judged from `(key, name)` history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserCategory {
    /// Known key, known name, no aliases, no collisions.
    TheOneAndOnly,
    /// Known key and name, but the key also belongs to other stored names.
    KnownWithKnownAliases,
    /// Known key under exactly one other name — probably renamed.
    PossibleNameChange,
    /// Known key under several other names — probably a shared key.
    PossibleSharedPubKey,
    /// Known key under other names *and* this name already has a different key.
    NameSwapCollision,
    /// Unknown key presented for a name that has a stored key.
    Pretender,
    /// Never seen this key, never seen this name.
    NeverMet,
}

impl UserCategory {
    pub const ALL: [UserCategory; 7] = [
        UserCategory::TheOneAndOnly,
        UserCategory::KnownWithKnownAliases,
        UserCategory::PossibleNameChange,
        UserCategory::PossibleSharedPubKey,
        UserCategory::NameSwapCollision,
        UserCategory::Pretender,
        UserCategory::NeverMet,
    ];

    pub fn suspicion(self) -> Suspicion {
        match self {
            UserCategory::TheOneAndOnly => Suspicion::Trusted,
            UserCategory::NeverMet => Suspicion::NonSuspicious,
            UserCategory::KnownWithKnownAliases
            | UserCategory::PossibleNameChange
            | UserCategory::PossibleSharedPubKey => Suspicion::SlightlyOdd,
            UserCategory::NameSwapCollision => Suspicion::Odd,
            UserCategory::Pretender => Suspicion::VeryOdd,
        }
    }
}

/// How suspicious a category is, on a 0..4 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Suspicion {
    Trusted = 0,
    NonSuspicious = 1,
    SlightlyOdd = 2,
    Odd = 3,
    VeryOdd = 4,
}

/// What to do about a peer of a given category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustAction {
    Reject,
    /// Ask the interactive gate before connecting.
    PromptAndTrust,
    /// Connect now, surface the prompt alongside.
    ConnectAndPrompt,
    ConnectAndTrust,
}

// ── Policy matrix ─────────────────────────────────────────────────────────────

/// Total mapping `category → action`.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    actions: HashMap<UserCategory, TrustAction>,
}

impl TrustPolicy {
    /// Build a policy from an explicit matrix. Every category must be
    /// covered.
    pub fn new(actions: HashMap<UserCategory, TrustAction>) -> Result<Self, Error> {
        for category in UserCategory::ALL {
            if !actions.contains_key(&category) {
                return Err(Error::Crypto(format!(
                    "trust policy has no action for category {category:?}"
                )));
            }
        }
        Ok(Self { actions })
    }

    /// The built-in matrix for `mode`.
    pub fn for_mode(mode: TrustMode) -> Self {
        use TrustAction::*;
        use UserCategory::*;
        let rows: [(UserCategory, TrustAction); 7] = match mode {
            TrustMode::Strict => [
                (TheOneAndOnly, ConnectAndTrust),
                (KnownWithKnownAliases, ConnectAndPrompt),
                (PossibleNameChange, PromptAndTrust),
                (PossibleSharedPubKey, PromptAndTrust),
                (NameSwapCollision, PromptAndTrust),
                (Pretender, PromptAndTrust),
                (NeverMet, PromptAndTrust),
            ],
            TrustMode::StrictAndQuiet => [
                (TheOneAndOnly, ConnectAndTrust),
                (KnownWithKnownAliases, Reject),
                (PossibleNameChange, Reject),
                (PossibleSharedPubKey, Reject),
                (NameSwapCollision, Reject),
                (Pretender, Reject),
                (NeverMet, Reject),
            ],
            TrustMode::Moderate => [
                (TheOneAndOnly, ConnectAndTrust),
                (KnownWithKnownAliases, ConnectAndTrust),
                (PossibleNameChange, ConnectAndPrompt),
                (PossibleSharedPubKey, ConnectAndPrompt),
                (NameSwapCollision, PromptAndTrust),
                (Pretender, PromptAndTrust),
                (NeverMet, ConnectAndPrompt),
            ],
            TrustMode::ModerateAndQuiet => [
                (TheOneAndOnly, ConnectAndTrust),
                (KnownWithKnownAliases, ConnectAndTrust),
                (PossibleNameChange, ConnectAndTrust),
                (PossibleSharedPubKey, ConnectAndTrust),
                (NameSwapCollision, Reject),
                (Pretender, Reject),
                (NeverMet, ConnectAndTrust),
            ],
            TrustMode::Lax => [
                (TheOneAndOnly, ConnectAndTrust),
                (KnownWithKnownAliases, ConnectAndTrust),
                (PossibleNameChange, ConnectAndTrust),
                (PossibleSharedPubKey, ConnectAndTrust),
                (NameSwapCollision, ConnectAndPrompt),
                (Pretender, ConnectAndPrompt),
                (NeverMet, ConnectAndTrust),
            ],
            TrustMode::Unsafe => [
                (TheOneAndOnly, ConnectAndTrust),
                (KnownWithKnownAliases, ConnectAndTrust),
                (PossibleNameChange, ConnectAndTrust),
                (PossibleSharedPubKey, ConnectAndTrust),
                (NameSwapCollision, ConnectAndTrust),
                (Pretender, ConnectAndTrust),
                (NeverMet, ConnectAndTrust),
            ],
            TrustMode::RejectAll => [
                (TheOneAndOnly, Reject),
                (KnownWithKnownAliases, Reject),
                (PossibleNameChange, Reject),
                (PossibleSharedPubKey, Reject),
                (NameSwapCollision, Reject),
                (Pretender, Reject),
                (NeverMet, Reject),
            ],
            TrustMode::AlwaysPrompt => [
                (TheOneAndOnly, PromptAndTrust),
                (KnownWithKnownAliases, PromptAndTrust),
                (PossibleNameChange, PromptAndTrust),
                (PossibleSharedPubKey, PromptAndTrust),
                (NameSwapCollision, PromptAndTrust),
                (Pretender, PromptAndTrust),
                (NeverMet, PromptAndTrust),
            ],
        };
        Self {
            actions: rows.into_iter().collect(),
        }
    }

    pub fn action(&self, category: UserCategory) -> TrustAction {
        // Totality is checked at construction.
        self.actions[&category]
    }
}

// ── PeerInfo snapshot ─────────────────────────────────────────────────────────

/// Everything the engine knows about a remote at one moment. Computed
/// on demand and cached per remote until disconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The name as seen on the wire, decorations included.
    pub peer_name: String,
    pub bare_name: String,
    pub provided_pub_key: bool,
    pub known_pub_key: bool,
    pub known_name: bool,
    /// Other stored names bound to the presented key.
    pub other_names_for_pub_key: Vec<String>,
    /// The different key this name is already bound to, if any.
    pub other_pub_key_for_name: Option<String>,
    pub completed_challenge: bool,
    pub category: UserCategory,
    pub suspiciousness: Suspicion,
    pub trust_level: TrustAction,
}

/// Constant-time equality for key strings.
pub(crate) fn keys_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Categorize a peer against the stored records and look up the policy
/// action.
pub fn assess_peer(
    records: &HostRecords,
    policy: &TrustPolicy,
    peer_name: &str,
    provided_key: Option<&str>,
    completed_challenge: bool,
) -> PeerInfo {
    let bare_name = extract_name(peer_name);
    let stored_key_for_name = records.key_for(&bare_name).map(str::to_string);

    let (known_pub_key, known_name, other_names, other_key) = match provided_key {
        Some(key) => {
            let known_pub_key = records.is_known_key(key);
            let names = records.names_for(key);
            let known_name = names.iter().any(|n| n == &bare_name);
            let other_names: Vec<String> =
                names.into_iter().filter(|n| n != &bare_name).collect();
            let other_key = stored_key_for_name
                .as_deref()
                .filter(|stored| !keys_equal(stored, key))
                .map(str::to_string);
            (known_pub_key, known_name, other_names, other_key)
        }
        None => (false, false, Vec::new(), stored_key_for_name),
    };

    let category = match (known_pub_key, known_name) {
        (true, true) if other_names.is_empty() => UserCategory::TheOneAndOnly,
        (true, true) => UserCategory::KnownWithKnownAliases,
        (true, false) if other_key.is_some() => UserCategory::NameSwapCollision,
        (true, false) if other_names.len() == 1 => UserCategory::PossibleNameChange,
        (true, false) => UserCategory::PossibleSharedPubKey,
        (false, _) if other_key.is_some() => UserCategory::Pretender,
        (false, _) => UserCategory::NeverMet,
    };

    PeerInfo {
        peer_name: peer_name.to_string(),
        bare_name,
        provided_pub_key: provided_key.is_some(),
        known_pub_key,
        known_name,
        other_names_for_pub_key: other_names,
        other_pub_key_for_name: other_key,
        completed_challenge,
        category,
        suspiciousness: category.suspicion(),
        trust_level: policy.action(category),
    }
}

// ── Interactive gate ──────────────────────────────────────────────────────────

/// The only interactive surface: asked whenever the policy action involves a
/// prompt. The returned bool decides whether the connection proceeds.
#[async_trait]
pub trait ConnectionGate: Send + Sync + 'static {
    async fn connection_request(&self, peer: &str, info: &PeerInfo) -> bool;
}

/// Gate with a fixed answer; carries `connection.auto_accept_connections`.
pub struct AutoGate(pub bool);

#[async_trait]
impl ConnectionGate for AutoGate {
    async fn connection_request(&self, _peer: &str, _info: &PeerInfo) -> bool {
        self.0
    }
}

/// Resolve an admission decision: reject outright, admit outright, or defer
/// to the gate.
pub async fn should_connect(gate: &dyn ConnectionGate, peer: &str, info: &PeerInfo) -> bool {
    match info.trust_level {
        TrustAction::Reject => false,
        TrustAction::ConnectAndTrust => true,
        TrustAction::PromptAndTrust | TrustAction::ConnectAndPrompt => {
            gate.connection_request(peer, info).await
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
