// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Core engine of the rtchat peer-to-peer chat substrate.
//!
//! A publish/subscribe broker provides rendezvous and signaling; direct
//! peer transports carry data and media; peers authenticate each other
//! with RSA-PSS challenge/response. Every external dependency — the
//! broker, the peer transport, the key-value store, the crypto
//! primitives, the interactive gate, media capture — enters through a
//! trait seam in [`node::Collaborators`], and each seam ships an
//! in-process implementation good enough for tests and demos.

pub mod ask;
pub mod crypto;
pub mod error;
pub mod hosts;
pub mod identity;
pub mod node;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod store;
pub mod transport;
pub mod trust;
pub mod waiters;

pub use error::Error;
pub use identity::{extract_name, slotted_name, Identity};
pub use node::{Collaborators, Node, NodeEvent, NodeHandle, SendPayload};
pub use trust::{PeerInfo, Suspicion, TrustAction, TrustPolicy, UserCategory};
