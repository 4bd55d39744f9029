// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The public client façade.
//!
//! `Client` starts the engine's event loop in a spawned task and exposes
//! the long-lived operations over its command handle. Events arrive on a
//! broadcast channel: call [`Client::events`] for a receiver, or use the
//! `next_*` helpers for one-shot "wait for the next …" futures.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use rtchat_config::Config;
use rtchat_core::{
    ask::QuestionHandler,
    node::{Collaborators, Node, NodeEvent, NodeHandle},
    signaling::envelope::Envelope,
    transport::MediaStream,
    trust::PeerInfo,
    Error, Identity, SendPayload,
};

/// Match an event source against an optional target; `None` means anyone.
fn matches_target(from: &str, target: Option<&str>) -> bool {
    match target {
        None => true,
        Some(t) => from == t || rtchat_core::extract_name(from) == rtchat_core::extract_name(t),
    }
}

/// A running rtchat client instance.
pub struct Client {
    handle: NodeHandle,
    display_name: String,
    task: tokio::task::JoinHandle<Result<(), Error>>,
}

impl Client {
    /// Validate the configuration, claim an instance slot, and spawn the
    /// event loop. With `connection.auto_connect` (the default) the broker
    /// is contacted immediately.
    pub fn start(config: Config, collaborators: Collaborators) -> Result<Self, Error> {
        let node = Node::new(config, collaborators)?;
        let handle = node.handle();
        let display_name = node.display_name().to_string();
        let task = tokio::spawn(node.run());
        Ok(Self {
            handle,
            display_name,
            task,
        })
    }

    /// The decorated display name this instance announces, `name(slot)`.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Subscribe to the event stream.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.handle.subscribe_events()
    }

    // ── Connection lifecycle ─────────────────────────────────────────────────

    /// Connect the broker and subscribe the room topic (needed only when
    /// `auto_connect` is off).
    pub async fn connect(&self) -> Result<(), Error> {
        self.handle.connect().await
    }

    /// Close the session with one peer.
    pub async fn disconnect(&self, peer: &str) -> Result<(), Error> {
        self.handle.disconnect(peer).await
    }

    /// Announce departure, close every session, release the instance slot,
    /// and stop the event loop.
    pub async fn shutdown(self) -> Result<(), Error> {
        self.handle.shutdown().await?;
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(Error::Broker(format!("event loop panicked: {e}"))),
        }
    }

    // ── Messaging ────────────────────────────────────────────────────────────

    /// Send `data` to one peer on `channel`.
    pub async fn send(&self, peer: &str, channel: &str, data: Value) -> Result<(), Error> {
        self.handle
            .send(peer, channel, SendPayload::Json(data))
            .await
    }

    /// Send raw bytes to one peer on a channel declared raw.
    pub async fn send_raw(&self, peer: &str, channel: &str, data: Vec<u8>) -> Result<(), Error> {
        self.handle.send(peer, channel, SendPayload::Raw(data)).await
    }

    /// Send `data` to every connected peer on `channel`. Per-peer failures
    /// are logged, not returned: a half-validated room should not fail the
    /// whole broadcast.
    pub async fn send_all(&self, channel: &str, data: Value) -> Result<(), Error> {
        for peer in self.handle.connected_users().await? {
            if let Err(e) = self
                .handle
                .send(&peer, channel, SendPayload::Json(data.clone()))
                .await
            {
                debug!(peer = %peer, "broadcast send skipped: {e}");
            }
        }
        Ok(())
    }

    /// Ask `peer` a question; resolves with the correlated answer. No
    /// intrinsic timeout — the future is cancelled when the session closes.
    pub async fn ask(&self, peer: &str, topic: &str, content: Value) -> Result<Value, Error> {
        self.handle.ask(peer, topic, content).await
    }

    /// Register a handler for inbound questions on `topic`.
    pub async fn on_question<F, Fut>(&self, topic: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(Value, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        let handler: QuestionHandler =
            Arc::new(move |content, sender| Box::pin(handler(content, sender)));
        self.handle.on_question(topic, handler).await
    }

    /// Round-trip latency to one peer, in milliseconds.
    pub async fn ping(&self, peer: &str) -> Result<i64, Error> {
        self.handle.ping(peer).await
    }

    /// Ping every connected peer, awaiting all latencies.
    pub async fn ping_everyone(&self) -> Result<Vec<(String, i64)>, Error> {
        let mut latencies = Vec::new();
        for peer in self.handle.connected_users().await? {
            match self.handle.ping(&peer).await {
                Ok(ms) => latencies.push((peer, ms)),
                Err(e) => debug!(peer = %peer, "ping skipped: {e}"),
            }
        }
        Ok(latencies)
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    /// Start a call with `peer`, offering `stream`; resolves with the
    /// remote stream once its track arrives.
    pub async fn call_user(&self, peer: &str, stream: MediaStream) -> Result<MediaStream, Error> {
        self.handle.call_user(peer, stream).await
    }

    pub async fn end_call_with_user(&self, peer: &str) -> Result<(), Error> {
        self.handle.end_call(peer).await
    }

    // ── Trust ────────────────────────────────────────────────────────────────

    /// Run the identify flow against `peer`; the outcome arrives as a
    /// `Validation` or `ValidationFailure` event.
    pub async fn trust(&self, peer: &str) -> Result<(), Error> {
        self.handle.trust(peer).await
    }

    /// Challenge `peer` against its stored public key; outcome via events.
    pub async fn challenge(&self, peer: &str) -> Result<(), Error> {
        self.handle.challenge(peer).await
    }

    /// Forget `peer`'s stored key and validation status.
    pub async fn untrust(&self, peer: &str) -> Result<(), Error> {
        self.handle.untrust(peer).await
    }

    pub async fn peer_info(&self, peer: &str) -> Result<PeerInfo, Error> {
        self.handle.peer_info(peer).await
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    /// Rename this instance, broadcasting the change; returns the new
    /// decorated display name.
    pub async fn change_name(&self, name: &str) -> Result<String, Error> {
        self.handle.change_name(name).await
    }

    /// Adopt `identity` as this instance's own.
    pub async fn register(&self, identity: Identity) -> Result<(), Error> {
        self.handle.register(identity).await
    }

    /// Clear own key pair and all stored host records.
    pub async fn reset(&self) -> Result<(), Error> {
        self.handle.reset().await
    }

    // ── Introspection ────────────────────────────────────────────────────────

    /// Display names of peers with an open session.
    pub async fn connected_users(&self) -> Result<Vec<String>, Error> {
        self.handle.connected_users().await
    }

    /// The bounded signaling history, oldest first.
    pub async fn history(&self) -> Result<Vec<Envelope>, Error> {
        self.handle.history().await
    }

    // ── One-shot event helpers ───────────────────────────────────────────────

    async fn next_event<T>(
        &self,
        mut pick: impl FnMut(NodeEvent) -> Option<T>,
    ) -> Result<T, Error> {
        let mut rx = self.events();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(value) = pick(event) {
                        return Ok(value);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::Shutdown),
            }
        }
    }

    /// The next chat message, optionally from a specific peer.
    pub async fn next_chat(&self, target: Option<&str>) -> Result<(String, Value), Error> {
        self.next_event(|event| match event {
            NodeEvent::Chat { from, data } if matches_target(&from, target) => Some((from, data)),
            _ => None,
        })
        .await
    }

    /// The next direct message, optionally from a specific peer.
    pub async fn next_dm(&self, target: Option<&str>) -> Result<(String, Value), Error> {
        self.next_event(|event| match event {
            NodeEvent::Dm { from, data } if matches_target(&from, target) => Some((from, data)),
            _ => None,
        })
        .await
    }

    /// The next inbound question `(from, topic, content)`.
    pub async fn next_question(
        &self,
        target: Option<&str>,
    ) -> Result<(String, String, Value), Error> {
        self.next_event(|event| match event {
            NodeEvent::Question { from, topic, content } if matches_target(&from, target) => {
                Some((from, topic, content))
            }
            _ => None,
        })
        .await
    }

    /// The next answer frame observed on the overlay.
    pub async fn next_answer(&self, target: Option<&str>) -> Result<(String, Value), Error> {
        self.next_event(|event| match event {
            NodeEvent::RtcMessage { from, channel, data }
                if channel == "answer" && matches_target(&from, target) =>
            {
                Some((from, data))
            }
            _ => None,
        })
        .await
    }

    /// The next inbound ping.
    pub async fn next_ping(&self, target: Option<&str>) -> Result<String, Error> {
        self.next_event(|event| match event {
            NodeEvent::Ping { from } if matches_target(&from, target) => Some(from),
            _ => None,
        })
        .await
    }

    /// The next pong, with its measured latency.
    pub async fn next_pong(&self, target: Option<&str>) -> Result<(String, i64), Error> {
        self.next_event(|event| match event {
            NodeEvent::Pong { from, latency_ms } if matches_target(&from, target) => {
                Some((from, latency_ms))
            }
            _ => None,
        })
        .await
    }

    /// The next peer disconnection.
    pub async fn next_user_disconnection(&self, target: Option<&str>) -> Result<String, Error> {
        self.next_event(|event| match event {
            NodeEvent::DisconnectedFromPeer { peer } if matches_target(&peer, target) => {
                Some(peer)
            }
            _ => None,
        })
        .await
    }

    /// The next envelope the engine did not interpret.
    pub async fn next_mqtt_message(&self, target: Option<&str>) -> Result<Envelope, Error> {
        self.next_event(|event| match event {
            NodeEvent::MqttMessage(env) if matches_target(&env.sender, target) => Some(env),
            _ => None,
        })
        .await
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
