// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Two-client integration tests.
//!
//! Everything runs in-process: a `MemoryBrokerHub` stands in for the
//! pub/sub broker, a `MemoryTransportHub` for the peer transports, and a
//! `MemoryStore` per client for persistence. Time is paused, so the 1 s
//! verification delay and the 10 s channel-open deadline elapse instantly
//! once the runtime is idle.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

use rtchat::core::crypto::RsaPssCrypto;
use rtchat::core::signaling::memory::MemoryBrokerHub;
use rtchat::core::store::MemoryStore;
use rtchat::core::transport::memory::MemoryTransportHub;
use rtchat::core::transport::{MediaStream, StaticMediaSource};
use rtchat::core::trust::AutoGate;
use rtchat::{Client, ClientEvent, Collaborators, Config, Error, TrustMode};

// ── Helpers ───────────────────────────────────────────────────────────────────

struct Net {
    brokers: MemoryBrokerHub,
    transports: MemoryTransportHub,
}

impl Net {
    fn new() -> Self {
        // RUST_LOG=rtchat_core=debug makes a failing scenario readable.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        Self {
            brokers: MemoryBrokerHub::new(),
            transports: MemoryTransportHub::new(),
        }
    }

    fn collaborators(&self, store: MemoryStore, accept: bool) -> Collaborators {
        Collaborators {
            store: Arc::new(store),
            crypto: Arc::new(RsaPssCrypto::new()),
            broker: Box::new(self.brokers.broker()),
            transports: Arc::new(self.transports.clone()),
            gate: Arc::new(AutoGate(accept)),
            media: Arc::new(StaticMediaSource(Some(MediaStream::new("cam")))),
        }
    }
}

fn config(name: &str, room: &str, mode: TrustMode) -> Config {
    let mut cfg = Config::default();
    cfg.name = Some(name.into());
    cfg.topic.room = Some(room.into());
    cfg.trust_mode = mode;
    cfg
}

/// Wait for the first event the matcher accepts, with a generous deadline.
async fn wait_for<T>(
    rx: &mut broadcast::Receiver<ClientEvent>,
    label: &str,
    mut matcher: impl FnMut(&ClientEvent) -> Option<T>,
) -> T {
    timeout(Duration::from_secs(60), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(value) = matcher(&event) {
                        return value;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed ({label})"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {label}"))
}

async fn wait_connected(rx: &mut broadcast::Receiver<ClientEvent>, who: &str) -> String {
    wait_for(rx, "connectedtopeer", |event| match event {
        ClientEvent::ConnectedToPeer { peer } if peer.contains(who) => Some(peer.clone()),
        _ => None,
    })
    .await
}

async fn wait_validated(rx: &mut broadcast::Receiver<ClientEvent>, who: &str) -> bool {
    wait_for(rx, "validation", |event| match event {
        ClientEvent::Validation { peer, trusted } if peer.contains(who) => Some(*trusted),
        _ => None,
    })
    .await
}

/// Start a pair of clients in one room and return them with their event
/// receivers, once both report the other's session open.
async fn connected_pair(
    net: &Net,
    room: &str,
    mode: TrustMode,
) -> (
    Client,
    broadcast::Receiver<ClientEvent>,
    Client,
    broadcast::Receiver<ClientEvent>,
) {
    let a = Client::start(
        config("alice", room, mode),
        net.collaborators(MemoryStore::new(), true),
    )
    .unwrap();
    let mut a_events = a.events();
    let b = Client::start(
        config("bob", room, mode),
        net.collaborators(MemoryStore::new(), true),
    )
    .unwrap();
    let mut b_events = b.events();

    wait_connected(&mut a_events, "bob").await;
    wait_connected(&mut b_events, "alice").await;
    (a, a_events, b, b_events)
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn single_peer_connect_and_chat() {
    let net = Net::new();
    let (a, mut a_events, b, mut b_events) = connected_pair(&net, "r1", TrustMode::Lax).await;

    // Gating: before validation completes, application sends are refused.
    let early = a.send("bob", "chat", json!("too soon")).await;
    assert!(
        matches!(early, Err(Error::PeerUnverified(_))),
        "send before validation must fail, got {early:?}"
    );

    // Both sides validate: first meeting runs the identify flow.
    assert!(wait_validated(&mut a_events, "bob").await);
    assert!(wait_validated(&mut b_events, "alice").await);

    a.send("bob", "chat", json!("hi")).await.unwrap();
    let (from, data) = b.next_chat(Some("alice")).await.unwrap();
    assert_eq!(from, "alice");
    assert_eq!(data, json!("hi"));

    // The signaling history records our own publications as sent.
    let history = a.history().await.unwrap();
    assert!(!history.is_empty());
    assert!(history
        .iter()
        .any(|env| env.subtopic == "connect" && env.sent == Some(true)));

    assert_eq!(a.connected_users().await.unwrap(), vec!["bob".to_string()]);
    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn ask_and_answer_resolve_by_correlation() {
    let net = Net::new();
    let (a, mut a_events, b, mut b_events) = connected_pair(&net, "r2", TrustMode::Lax).await;
    wait_validated(&mut a_events, "bob").await;
    wait_validated(&mut b_events, "alice").await;

    a.on_question("sum", |content, _sender| async move {
        let x = content["a"].as_i64().unwrap_or(0);
        let y = content["b"].as_i64().unwrap_or(0);
        json!(x + y)
    })
    .await
    .unwrap();

    let answer = b.ask("alice", "sum", json!({"a": 2, "b": 3})).await.unwrap();
    assert_eq!(answer, json!(5));

    // A fresh ask correlates independently of the first.
    let answer = b.ask("alice", "sum", json!({"a": 10, "b": -4})).await.unwrap();
    assert_eq!(answer, json!(6));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn ping_measures_latency() {
    let net = Net::new();
    let (a, mut a_events, b, mut b_events) = connected_pair(&net, "r3", TrustMode::Lax).await;
    wait_validated(&mut a_events, "bob").await;
    wait_validated(&mut b_events, "alice").await;

    // Subscribe for the remote ping event concurrently: the helper only
    // sees events that fire after it subscribes.
    let (latency, pinged) = tokio::join!(a.ping("bob"), b.next_ping(Some("alice")));
    assert!(latency.unwrap() >= 0);
    assert_eq!(pinged.unwrap(), "alice");

    let latencies = a.ping_everyone().await.unwrap();
    assert_eq!(latencies.len(), 1);
    assert_eq!(latencies[0].0, "bob");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn media_call_connects_and_ends() {
    let net = Net::new();
    let (a, mut a_events, b, mut b_events) = connected_pair(&net, "r4", TrustMode::Lax).await;
    wait_validated(&mut a_events, "bob").await;
    wait_validated(&mut b_events, "alice").await;

    let remote = a.call_user("bob", MediaStream::new("alice-cam")).await.unwrap();
    assert_eq!(remote.id, "cam", "bob answers with his configured stream");

    wait_for(&mut b_events, "callconnected", |event| match event {
        ClientEvent::CallConnected { peer, stream } if peer.contains("alice") => {
            Some(stream.id.clone())
        }
        _ => None,
    })
    .await;

    a.end_call_with_user("bob").await.unwrap();
    wait_for(&mut b_events, "callended", |event| match event {
        ClientEvent::CallEnded { peer } if peer.contains("alice") => Some(()),
        _ => None,
    })
    .await;

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn name_change_renames_session_and_records() {
    let net = Net::new();
    let (a, mut a_events, b, mut b_events) = connected_pair(&net, "r5", TrustMode::Lax).await;
    wait_validated(&mut a_events, "bob").await;
    wait_validated(&mut b_events, "alice").await;

    let new_name = a.change_name("alicia").await.unwrap();
    assert_eq!(new_name, "alicia");

    wait_for(&mut b_events, "namechange", |event| match event {
        ClientEvent::NameChange { old, new } if old == "alice" && new == "alicia" => Some(()),
        _ => None,
    })
    .await;

    // The renamed session keeps working in both directions.
    b.send("alicia", "chat", json!("still there?")).await.unwrap();
    let (_, data) = a.next_chat(Some("bob")).await.unwrap();
    assert_eq!(data, json!("still there?"));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unload_disconnects_remote_peer() {
    let net = Net::new();
    let (a, mut a_events, b, mut b_events) = connected_pair(&net, "r6", TrustMode::Lax).await;
    wait_validated(&mut a_events, "bob").await;
    wait_validated(&mut b_events, "alice").await;

    // Watch for the disconnection while the shutdown runs; subscribing
    // afterwards could miss the event.
    let (shut, gone) = tokio::join!(a.shutdown(), b.next_user_disconnection(Some("alice")));
    shut.unwrap();
    assert_eq!(gone.unwrap(), "alice");
    assert!(b.connected_users().await.unwrap().is_empty());
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn send_to_unknown_peer_fails_fast() {
    let net = Net::new();
    let a = Client::start(
        config("alice", "r7", TrustMode::Lax),
        net.collaborators(MemoryStore::new(), true),
    )
    .unwrap();
    let outcome = a.send("nobody", "chat", json!("void")).await;
    assert!(matches!(outcome, Err(Error::PeerNotFound(_))));
    a.shutdown().await.unwrap();
}

// ── Sibling instances (shared store) ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sibling_instances_get_slots_and_reuse_them() {
    let net = Net::new();
    let store = MemoryStore::new();

    // Same persisted identity, separate rooms so the siblings stay apart.
    let first = Client::start(
        config("alice", "s1", TrustMode::Lax),
        net.collaborators(store.clone(), true),
    )
    .unwrap();
    assert_eq!(first.display_name(), "alice");

    let second = Client::start(
        config("alice", "s2", TrustMode::Lax),
        net.collaborators(store.clone(), true),
    )
    .unwrap();
    assert_eq!(second.display_name(), "alice(1)");

    let third = Client::start(
        config("alice", "s3", TrustMode::Lax),
        net.collaborators(store.clone(), true),
    )
    .unwrap();
    assert_eq!(third.display_name(), "alice(2)");

    // A clean exit releases the slot for the next sibling.
    second.shutdown().await.unwrap();
    let fourth = Client::start(
        config("alice", "s4", TrustMode::Lax),
        net.collaborators(store.clone(), true),
    )
    .unwrap();
    assert_eq!(fourth.display_name(), "alice(1)");

    first.shutdown().await.unwrap();
    third.shutdown().await.unwrap();
    fourth.shutdown().await.unwrap();
}
