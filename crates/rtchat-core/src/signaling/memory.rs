// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! In-memory broker — zero dependencies, suitable for tests, local demos,
//! and any scenario where all peers run in the same process.
//!
//! Delivery is loopback-inclusive: a publisher subscribed to the topic
//! receives its own messages, exactly like a real broker, so the bus's
//! self-sender filter is exercised for real.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Error;

use super::{Broker, BrokerMessage, BrokerOptions};

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<BrokerMessage>)>>;

#[derive(Debug, Default)]
struct Inner {
    /// topic → subscriber queues, in subscription order.
    subscribers: Subscribers,
    next_id: u64,
}

/// Process-wide rendezvous point for [`MemoryBroker`] clients.
///
/// Clones share the same underlying state, so brokers created from the same
/// hub see each other's publications in publication order per topic.
#[derive(Debug, Clone, Default)]
pub struct MemoryBrokerHub {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBrokerHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unconnected broker client attached to this hub.
    pub fn broker(&self) -> MemoryBroker {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut g = self.inner.lock().unwrap();
            g.next_id += 1;
            g.next_id
        };
        MemoryBroker {
            hub: self.clone(),
            id,
            tx,
            rx,
            connected: false,
        }
    }

    fn subscribe(&self, topic: &str, id: u64, tx: mpsc::UnboundedSender<BrokerMessage>) {
        let mut g = self.inner.lock().unwrap();
        let subs = g.subscribers.entry(topic.to_string()).or_default();
        if !subs.iter().any(|(sid, _)| *sid == id) {
            subs.push((id, tx));
        }
    }

    fn publish(&self, topic: &str, payload: &[u8]) {
        let mut g = self.inner.lock().unwrap();
        if let Some(subs) = g.subscribers.get_mut(topic) {
            subs.retain(|(_, tx)| {
                tx.send(BrokerMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                })
                .is_ok()
            });
        }
    }

    fn drop_client(&self, id: u64) {
        let mut g = self.inner.lock().unwrap();
        for subs in g.subscribers.values_mut() {
            subs.retain(|(sid, _)| *sid != id);
        }
    }
}

/// One client's view of the hub.
pub struct MemoryBroker {
    hub: MemoryBrokerHub,
    id: u64,
    tx: mpsc::UnboundedSender<BrokerMessage>,
    rx: mpsc::UnboundedReceiver<BrokerMessage>,
    connected: bool,
}

impl Drop for MemoryBroker {
    fn drop(&mut self) {
        self.hub.drop_client(self.id);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&mut self, _opts: &BrokerOptions) -> Result<(), Error> {
        self.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Error> {
        if !self.connected {
            return Err(Error::Broker("not connected".into()));
        }
        self.hub.subscribe(topic, self.id, self.tx.clone());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), Error> {
        if !self.connected {
            return Err(Error::Broker("not connected".into()));
        }
        self.hub.publish(topic, &payload);
        Ok(())
    }

    async fn recv(&mut self) -> Option<BrokerMessage> {
        self.rx.recv().await
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers_including_self() {
        let hub = MemoryBrokerHub::new();
        let opts = BrokerOptions {
            url: "memory://".into(),
            client_id: None,
            username: None,
            password: None,
            reconnect_period: 1000,
            connect_timeout: 1000,
        };
        let mut a = hub.broker();
        let mut b = hub.broker();
        a.connect(&opts).await.unwrap();
        b.connect(&opts).await.unwrap();
        a.subscribe("room").await.unwrap();
        b.subscribe("room").await.unwrap();

        a.publish("room", b"hello".to_vec()).await.unwrap();

        let at_b = b.recv().await.unwrap();
        assert_eq!(at_b.payload, b"hello");
        let at_a = a.recv().await.unwrap();
        assert_eq!(at_a.payload, b"hello", "loopback delivery included");
    }

    #[tokio::test]
    async fn unsubscribed_topics_are_silent() {
        let hub = MemoryBrokerHub::new();
        let opts = BrokerOptions {
            url: "memory://".into(),
            client_id: None,
            username: None,
            password: None,
            reconnect_period: 1000,
            connect_timeout: 1000,
        };
        let mut a = hub.broker();
        let mut b = hub.broker();
        a.connect(&opts).await.unwrap();
        b.connect(&opts).await.unwrap();
        b.subscribe("other").await.unwrap();
        a.publish("room", b"x".to_vec()).await.unwrap();

        // Nothing may arrive at b.
        let outcome =
            tokio::time::timeout(std::time::Duration::from_millis(50), b.recv()).await;
        assert!(outcome.is_err(), "no delivery expected");
    }

    #[tokio::test]
    async fn operations_require_connect() {
        let hub = MemoryBrokerHub::new();
        let mut a = hub.broker();
        assert!(a.subscribe("room").await.is_err());
        assert!(a.publish("room", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn per_topic_order_is_preserved() {
        let hub = MemoryBrokerHub::new();
        let opts = BrokerOptions {
            url: "memory://".into(),
            client_id: None,
            username: None,
            password: None,
            reconnect_period: 1000,
            connect_timeout: 1000,
        };
        let mut a = hub.broker();
        let mut b = hub.broker();
        a.connect(&opts).await.unwrap();
        b.connect(&opts).await.unwrap();
        b.subscribe("room").await.unwrap();
        for i in 0..10u8 {
            a.publish("room", vec![i]).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(b.recv().await.unwrap().payload, vec![i]);
        }
    }
}
