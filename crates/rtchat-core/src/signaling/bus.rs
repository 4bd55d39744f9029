// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The signaling bus: envelopes in and out of one room topic.
//!
//! The bus owns the broker client, applies the envelope codec, filters its
//! own publications out of the inbound stream, and keeps a bounded history
//! ring. It knows nothing about sessions or peers — the rendezvous engine
//! interprets what the bus delivers.

use std::collections::VecDeque;

use tokio::time::Duration;
use tracing::{debug, trace};

use rtchat_config::{CompressionConfig, HistoryConfig};

use crate::error::Error;

use super::{
    envelope::{self, Envelope},
    Broker, BrokerOptions,
};

pub struct SignalBus {
    broker: Box<dyn Broker>,
    compression: CompressionConfig,
    history_config: HistoryConfig,
    history: VecDeque<Envelope>,
    /// Display name whose envelopes are filtered out of the inbound stream.
    self_name: String,
    topic: Option<String>,
}

impl SignalBus {
    pub fn new(
        broker: Box<dyn Broker>,
        self_name: impl Into<String>,
        compression: CompressionConfig,
        history_config: HistoryConfig,
    ) -> Self {
        Self {
            broker,
            compression,
            history_config,
            history: VecDeque::new(),
            self_name: self_name.into(),
            topic: None,
        }
    }

    /// Connect the broker, bounded by the configured connect timeout.
    pub async fn connect(&mut self, opts: &BrokerOptions) -> Result<(), Error> {
        let deadline = Duration::from_millis(opts.connect_timeout.max(1));
        tokio::time::timeout(deadline, self.broker.connect(opts))
            .await
            .map_err(|_| Error::Broker(format!("broker connect timed out after {deadline:?}")))?
    }

    pub async fn subscribe(&mut self, topic: &str) -> Result<(), Error> {
        self.broker.subscribe(topic).await?;
        self.topic = Some(topic.to_string());
        debug!(topic, "subscribed");
        Ok(())
    }

    /// Name change: publications and the self-filter follow the new name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.self_name = name.into();
    }

    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    /// Wrap `data` in an envelope and publish it on the room topic.
    pub async fn publish(&mut self, subtopic: &str, data: serde_json::Value) -> Result<(), Error> {
        let topic = self
            .topic
            .clone()
            .ok_or_else(|| Error::Broker("publish before subscribe".into()))?;
        let mut env = Envelope::new(self.self_name.clone(), subtopic, data);
        let bytes = envelope::encode(&env, &self.compression)?;
        trace!(subtopic, bytes = bytes.len(), "publishing envelope");
        self.broker.publish(&topic, bytes).await?;
        env.sent = Some(true);
        self.record(env);
        Ok(())
    }

    /// Next foreign envelope. Malformed payloads and our own publications
    /// are dropped here, never surfaced.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let msg = self.broker.recv().await?;
            let mut env = match envelope::decode(&msg.payload) {
                Ok(env) => env,
                Err(e) => {
                    debug!("dropping malformed envelope: {e}");
                    continue;
                }
            };
            if env.sender == self.self_name {
                trace!(subtopic = %env.subtopic, "dropping own envelope");
                continue;
            }
            env.receive_timestamp = Some(chrono::Utc::now().timestamp_millis());
            self.record(env.clone());
            return Some(env);
        }
    }

    fn record(&mut self, env: Envelope) {
        if !self.history_config.enabled {
            return;
        }
        if self.history.len() >= self.history_config.max_length {
            self.history.pop_front();
        }
        self.history.push_back(env);
    }

    /// The retained envelope ring, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Envelope> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::memory::MemoryBrokerHub;
    use serde_json::json;

    fn opts() -> BrokerOptions {
        BrokerOptions {
            url: "memory://".into(),
            client_id: None,
            username: None,
            password: None,
            reconnect_period: 1000,
            connect_timeout: 1000,
        }
    }

    fn bus(hub: &MemoryBrokerHub, name: &str) -> SignalBus {
        SignalBus::new(
            Box::new(hub.broker()),
            name,
            CompressionConfig::default(),
            HistoryConfig::default(),
        )
    }

    #[tokio::test]
    async fn own_envelopes_are_filtered() {
        let hub = MemoryBrokerHub::new();
        let mut a = bus(&hub, "alice");
        let mut b = bus(&hub, "bob");
        a.connect(&opts()).await.unwrap();
        b.connect(&opts()).await.unwrap();
        a.subscribe("mrtchat/r").await.unwrap();
        b.subscribe("mrtchat/r").await.unwrap();

        a.publish("connect", json!({})).await.unwrap();
        let at_b = b.recv().await.unwrap();
        assert_eq!(at_b.sender, "alice");
        assert!(at_b.receive_timestamp.is_some());

        // alice's loopback copy must never surface; publish from bob so the
        // recv below has something to return.
        b.publish("connect", json!({})).await.unwrap();
        let at_a = a.recv().await.unwrap();
        assert_eq!(at_a.sender, "bob", "own envelope must be skipped");
    }

    #[tokio::test]
    async fn history_is_bounded_and_recent() {
        let hub = MemoryBrokerHub::new();
        let mut a = SignalBus::new(
            Box::new(hub.broker()),
            "alice",
            CompressionConfig::default(),
            HistoryConfig {
                enabled: true,
                max_length: 5,
            },
        );
        a.connect(&opts()).await.unwrap();
        a.subscribe("mrtchat/r").await.unwrap();
        for i in 0..12 {
            a.publish("chat", json!({ "i": i })).await.unwrap();
        }
        assert_eq!(a.history_len(), 5);
        let kept: Vec<i64> = a
            .history()
            .map(|e| e.data["i"].as_i64().unwrap())
            .collect();
        assert_eq!(kept, vec![7, 8, 9, 10, 11], "most recent K retained");
        assert!(a.history().all(|e| e.sent == Some(true)));
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped_not_fatal() {
        let hub = MemoryBrokerHub::new();
        let mut raw = hub.broker();
        let mut b = bus(&hub, "bob");
        raw.connect(&opts()).await.unwrap();
        b.connect(&opts()).await.unwrap();
        b.subscribe("mrtchat/r").await.unwrap();

        raw.publish("mrtchat/r", b"not json at all".to_vec())
            .await
            .unwrap();
        let env = Envelope::new("alice", "connect", json!({}));
        raw.publish(
            "mrtchat/r",
            serde_json::to_vec(&env).unwrap(),
        )
        .await
        .unwrap();

        let received = b.recv().await.unwrap();
        assert_eq!(received.sender, "alice", "bus must skip the garbage");
    }

    #[tokio::test]
    async fn publish_before_subscribe_fails() {
        let hub = MemoryBrokerHub::new();
        let mut a = bus(&hub, "alice");
        a.connect(&opts()).await.unwrap();
        assert!(a.publish("connect", json!({})).await.is_err());
    }
}
