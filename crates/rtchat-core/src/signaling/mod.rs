// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Signaling over a publish/subscribe broker.
//!
//! `Broker` is the seam between the client and whatever pub/sub transport
//! the deployment uses. The crate ships [`memory::MemoryBrokerHub`] for
//! tests and in-process demos; a production binding (MQTT over websockets)
//! implements the same four methods.

pub mod bus;
pub mod envelope;
pub mod memory;

use async_trait::async_trait;

use crate::error::Error;

/// Connection parameters handed to [`Broker::connect`].
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub url: String,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Delay between reconnect attempts, milliseconds.
    pub reconnect_period: u64,
    /// Connect timeout, milliseconds. Enforced by the bus.
    pub connect_timeout: u64,
}

impl BrokerOptions {
    pub fn from_config(mqtt: &rtchat_config::MqttConfig) -> Self {
        Self {
            url: mqtt.broker.clone(),
            client_id: mqtt.client_id.clone(),
            username: mqtt.username.clone(),
            password: mqtt.password.clone(),
            reconnect_period: mqtt.reconnect_period,
            connect_timeout: mqtt.connect_timeout,
        }
    }
}

/// One raw inbound message from the broker.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Backend-agnostic pub/sub interface.
#[async_trait]
pub trait Broker: Send + 'static {
    async fn connect(&mut self, opts: &BrokerOptions) -> Result<(), Error>;
    async fn subscribe(&mut self, topic: &str) -> Result<(), Error>;
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), Error>;
    /// Next inbound message, in the broker's per-topic publication order.
    /// `None` means the connection is gone for good.
    async fn recv(&mut self) -> Option<BrokerMessage>;
}
