// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Envelope wire format.
//!
//! Every signaling payload travels as a JSON envelope, optionally wrapped by
//! zlib when it outgrows the configured threshold. Decoding always attempts
//! decompression first and falls back to parsing the raw bytes, so mixed
//! fleets (compressing and not) interoperate.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use rtchat_config::{CompressionConfig, CompressionLibrary};

use crate::error::Error;

/// Subtopic names understood by the rendezvous engine. Anything else is
/// surfaced as a generic broker-message event.
pub mod subtopics {
    pub const CONNECT: &str = "connect";
    pub const NAME_CHANGE: &str = "nameChange";
    pub const UNLOAD: &str = "unload";
    pub const RTC_OFFER: &str = "RTCOffer";
    pub const RTC_ANSWER: &str = "RTCAnswer";
    pub const RTC_ICE_CANDIDATE: &str = "RTCIceCandidate";
}

/// A signaling envelope as published on the room topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Display name of the publisher, slot decoration included.
    pub sender: String,
    /// Publisher's clock, milliseconds since the epoch.
    pub timestamp: i64,
    pub subtopic: String,
    pub data: serde_json::Value,
    /// Set on envelopes this instance published itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent: Option<bool>,
    /// Local clock at receipt, set on inbound envelopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receive_timestamp: Option<i64>,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, subtopic: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            sender: sender.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            subtopic: subtopic.into(),
            data,
            sent: None,
            receive_timestamp: None,
        }
    }
}

/// Serialize an envelope, compressing when the configuration asks for it and
/// the JSON outgrows the threshold.
pub fn encode(envelope: &Envelope, compression: &CompressionConfig) -> Result<Vec<u8>, Error> {
    let json = serde_json::to_vec(envelope).map_err(|e| Error::Broker(e.to_string()))?;
    let compress = compression.enabled
        && compression.library == CompressionLibrary::Deflate
        && json.len() > compression.threshold;
    if !compress {
        return Ok(json);
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Broker(e.to_string()))
}

/// Parse an inbound payload: attempt decompression, then fall back to the
/// raw bytes.
pub fn decode(payload: &[u8]) -> Result<Envelope, Error> {
    let mut inflated = Vec::new();
    let text: &[u8] = match ZlibDecoder::new(payload).read_to_end(&mut inflated) {
        Ok(_) => &inflated,
        Err(_) => payload,
    };
    serde_json::from_slice(text).map_err(|e| Error::Broker(format!("malformed envelope: {e}")))
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(enabled: bool, threshold: usize) -> CompressionConfig {
        CompressionConfig {
            enabled,
            library: CompressionLibrary::Deflate,
            threshold,
        }
    }

    #[test]
    fn small_payloads_stay_uncompressed() {
        let env = Envelope::new("alice", "connect", json!({"x": 1}));
        let bytes = encode(&env, &config(true, 100)).unwrap();
        // Raw JSON starts with '{'.
        assert_eq!(bytes[0], b'{');
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn large_payloads_are_compressed() {
        let blob = "x".repeat(500);
        let env = Envelope::new("alice", "chat", json!({ "blob": blob }));
        let bytes = encode(&env, &config(true, 100)).unwrap();
        assert_ne!(bytes[0], b'{', "payload above threshold must be wrapped");
        assert!(bytes.len() < 500, "repetitive payload must shrink");
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn compression_disabled_sends_raw() {
        let blob = "x".repeat(500);
        let env = Envelope::new("alice", "chat", json!({ "blob": blob }));
        let bytes = encode(&env, &config(false, 100)).unwrap();
        assert_eq!(bytes[0], b'{');
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(b"\x01\x02garbage").is_err());
        assert!(decode(b"{\"not\": \"an envelope\"}").is_err());
    }

    #[test]
    fn receive_timestamp_round_trips_in_camel_case() {
        let mut env = Envelope::new("bob", "connect", json!(null));
        env.receive_timestamp = Some(42);
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("receiveTimestamp"));
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.receive_timestamp, Some(42));
    }
}
