// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Validation and loading failures for [`crate::Config`].
#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    /// The display name contains a forbidden character or surrounding
    /// whitespace. `(`, `)` and `|` are reserved by the identity wire format.
    #[error("invalid name {0:?}: must be non-empty, without '(', ')', '|' or surrounding whitespace")]
    InvalidName(String),

    #[error("malformed broker URL {url:?}: {reason}")]
    InvalidBrokerUrl { url: String, reason: String },

    #[error("invalid ICE server entry {0:?}: expected a stun:, turn: or turns: URI")]
    InvalidIceServer(String),

    #[error("history.max_length must be at least 1")]
    InvalidHistoryLength,

    #[error("reading {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("parsing {path}: {reason}")]
    Parse { path: String, reason: String },
}
