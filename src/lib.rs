// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! rtchat — a peer-to-peer chat substrate.
//!
//! Peers meet on a publish/subscribe broker topic, establish direct peer
//! transports through offer/answer signaling, multiplex named channels
//! over each transport, and authenticate one another with RSA-PSS
//! challenge/response. [`Client`] is the public surface; everything
//! environment-specific (broker, transport, storage, crypto, media
//! capture, interactive prompts) is a collaborator passed in at
//! construction.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rtchat::{Client, Collaborators, Config};
//! use rtchat::core::crypto::RsaPssCrypto;
//! use rtchat::core::signaling::memory::MemoryBrokerHub;
//! use rtchat::core::store::MemoryStore;
//! use rtchat::core::transport::memory::MemoryTransportHub;
//! use rtchat::core::transport::{MediaStream, StaticMediaSource};
//! use rtchat::core::trust::AutoGate;
//!
//! # async fn demo() -> Result<(), rtchat::Error> {
//! let brokers = MemoryBrokerHub::new();
//! let transports = MemoryTransportHub::new();
//! let mut config = Config::default();
//! config.name = Some("alice".into());
//! let client = Client::start(
//!     config,
//!     Collaborators {
//!         store: Arc::new(MemoryStore::new()),
//!         crypto: Arc::new(RsaPssCrypto::new()),
//!         broker: Box::new(brokers.broker()),
//!         transports: Arc::new(transports),
//!         gate: Arc::new(AutoGate(true)),
//!         media: Arc::new(StaticMediaSource(Some(MediaStream::new("cam")))),
//!     },
//! )?;
//! client.send_all("chat", serde_json::json!("hello room")).await?;
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::Client;

pub use rtchat_config::{Config, ConfigError, Preset, TrustMode};
pub use rtchat_core::node::NodeEvent as ClientEvent;
pub use rtchat_core::{Collaborators, Error, Identity, PeerInfo, SendPayload};

/// The full engine crate, for access to the collaborator seams and their
/// in-memory implementations.
pub use rtchat_core as core;
/// The configuration crate: schema, presets, loader, room derivation.
pub use rtchat_config as config;
