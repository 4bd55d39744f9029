// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The rendezvous engine.
//!
//! One `Node` is one client instance: a single event loop owning every
//! session, driven by `tokio::select!` over broker envelopes, transport
//! events, commands from the handle, and timers. Obtain a [`NodeHandle`]
//! before calling `run()` so you can send commands and subscribe to events
//! while the loop runs inside a spawned task.
//!
//! Everything mutable lives in `NodeState`; the bus and the merged
//! transport-event streams are kept as separate locals so `tokio::select!`
//! can poll them without conflicting with the `&mut self` borrows taken by
//! the handler methods.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt, StreamMap};
use tracing::{debug, info, trace, warn};

use rtchat_config::Config;

use crate::{
    ask::{
        AnswerFrame, HandlerRegistry, IdentifyAnswer, PingFrame, QuestionBody, QuestionFrame,
        QuestionHandler, ANSWER_CHANNEL, CHALLENGE_TOPIC, CHAT_CHANNEL, CONNECTED_SENTINEL,
        DM_CHANNEL, IDENTIFY_TOPIC, PING_CHANNEL, QUESTION_CHANNEL,
    },
    crypto::{byte_string, make_challenge, string_bytes, CryptoProvider},
    error::Error,
    hosts::{HostRecords, OwnIdentity},
    identity::{extract_name, slotted_name, Identity},
    registry::InstanceRegistry,
    session::{
        media::{MediaSession, StreamIce, StreamSignal},
        ChannelSpec, ChannelState, Session, SessionRole, SessionState, CHANNEL_OPEN_TIMEOUT_SECS,
    },
    signaling::{
        bus::SignalBus,
        envelope::{subtopics, Envelope},
        Broker, BrokerOptions,
    },
    transport::{
        IceCandidate, MediaSource, MediaStream, SessionDescription, TransportEvent,
        TransportFactory,
    },
    trust::{assess_peer, keys_equal, ConnectionGate, PeerInfo, TrustAction, TrustPolicy},
    waiters::OneShot,
};

/// Delay between a session opening and its verification pass.
const VERIFY_DELAY: Duration = Duration::from_secs(1);
/// Presence beacon cadence: fast for the first few, then slow.
const BEACON_FAST: Duration = Duration::from_secs(3);
const BEACON_SLOW: Duration = Duration::from_secs(30);
const BEACON_FAST_COUNT: u32 = 5;

// ── Public event type ─────────────────────────────────────────────────────────

/// Events emitted to the host application.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The broker connection is up and the room topic is subscribed.
    MqttConnected,
    /// An envelope with a subtopic the engine does not interpret.
    MqttMessage(Envelope),
    ConnectedToPeer { peer: String },
    DisconnectedFromPeer { peer: String },
    Chat { from: String, data: Value },
    Dm { from: String, data: Value },
    Question { from: String, topic: String, content: Value },
    /// A frame on a channel without built-in semantics (JSON coding).
    RtcMessage { from: String, channel: String, data: Value },
    /// A frame on a channel declared raw.
    RawMessage { from: String, channel: String, data: Vec<u8> },
    CallConnected { peer: String, stream: MediaStream },
    CallEnded { peer: String },
    Ping { from: String },
    Pong { from: String, latency_ms: i64 },
    NameChange { old: String, new: String },
    /// A verification pass finished. `trusted` is true on the identify
    /// (first-meeting) path, false on the challenge (re-verification) path.
    Validation { peer: String, trusted: bool },
    ValidationFailure { peer: String, error: String },
    /// The policy asked for a prompt; the configured gate decides.
    ConnectionRequest { peer: String, info: PeerInfo },
}

// ── Commands ──────────────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, Error>>;

/// Payload for an outbound frame.
#[derive(Debug, Clone)]
pub enum SendPayload {
    Json(Value),
    Raw(Vec<u8>),
}

pub(crate) enum Command {
    Connect { reply: Reply<()> },
    Disconnect { peer: String, reply: Reply<()> },
    Send { peer: String, channel: String, payload: SendPayload, reply: Reply<()> },
    Ask { peer: String, topic: String, content: Value, reply: Reply<Value> },
    Ping { peer: String, reply: Reply<i64> },
    CallUser { peer: String, stream: MediaStream, reply: Reply<MediaStream> },
    EndCall { peer: String, reply: Reply<()> },
    Trust { peer: String, reply: Reply<()> },
    Challenge { peer: String, reply: Reply<()> },
    Untrust { peer: String, reply: Reply<()> },
    ChangeName { name: String, reply: Reply<String> },
    Register { identity: Identity, reply: Reply<()> },
    Reset { reply: Reply<()> },
    ConnectedUsers { reply: Reply<Vec<String>> },
    PeerInfoQuery { peer: String, reply: Reply<PeerInfo> },
    History { reply: Reply<Vec<Envelope>> },
    RegisterHandler { topic: String, handler: QuestionHandler, reply: Reply<()> },
    Shutdown { reply: Reply<()> },
    Internal(InternalCmd),
}

pub(crate) enum InternalCmd {
    /// Post-open verification timer fired.
    VerifyPeer { peer: String },
    /// A spawned verification flow finished.
    VerifyOutcome { peer: String, outcome: VerifyOutcome },
    /// A spawned question handler produced its answer.
    AnswerReady { peer: String, n: u64, question: QuestionBody, answer: Value },
    /// A parked send hit its open deadline.
    ParkExpired { peer: String, id: u64 },
}

pub(crate) enum VerifyOutcome {
    /// Signature over our challenge verified under the stored key.
    ChallengePassed,
    /// Identify round-trip verified under the key the peer presented.
    Identified { key: String },
    Failed(String),
}

// ── Wire payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectPayload {
    /// Serialized identity, `name|publicKeyString`.
    identity: String,
    #[serde(default)]
    user_info: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RtcSignal {
    target: String,
    sdp: SessionDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RtcCandidate {
    target: String,
    candidate: IceCandidate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NameChangePayload {
    old_name: String,
    new_name: String,
}

// ── Collaborators ─────────────────────────────────────────────────────────────

/// External collaborators, passed in at construction. No global singletons:
/// the only process-wide state is whatever the store implementation shares.
pub struct Collaborators {
    pub store: Arc<dyn crate::store::KeyValueStore>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub broker: Box<dyn Broker>,
    pub transports: Arc<dyn TransportFactory>,
    pub gate: Arc<dyn ConnectionGate>,
    pub media: Arc<dyn MediaSource>,
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap-to-clone handle to a running [`Node`].
#[derive(Clone)]
pub struct NodeHandle {
    cmd_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<NodeEvent>,
}

impl NodeHandle {
    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_tx.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Connect the broker and subscribe the room topic.
    pub async fn connect(&self) -> Result<(), Error> {
        self.request(|reply| Command::Connect { reply }).await
    }

    /// Close the session with `peer`.
    pub async fn disconnect(&self, peer: &str) -> Result<(), Error> {
        let peer = peer.to_string();
        self.request(|reply| Command::Disconnect { peer, reply }).await
    }

    /// Send one frame to one peer on `channel`.
    pub async fn send(&self, peer: &str, channel: &str, payload: SendPayload) -> Result<(), Error> {
        let (peer, channel) = (peer.to_string(), channel.to_string());
        self.request(|reply| Command::Send { peer, channel, payload, reply })
            .await
    }

    /// Ask `peer` a question and await the correlated answer. The future has
    /// no intrinsic timeout; it is cancelled when the session closes.
    pub async fn ask(&self, peer: &str, topic: &str, content: Value) -> Result<Value, Error> {
        let (peer, topic) = (peer.to_string(), topic.to_string());
        self.request(|reply| Command::Ask { peer, topic, content, reply })
            .await
    }

    /// Round-trip latency to `peer`, in milliseconds.
    pub async fn ping(&self, peer: &str) -> Result<i64, Error> {
        let peer = peer.to_string();
        self.request(|reply| Command::Ping { peer, reply }).await
    }

    /// Start a call, offering `stream`; resolves with the remote stream.
    pub async fn call_user(&self, peer: &str, stream: MediaStream) -> Result<MediaStream, Error> {
        let peer = peer.to_string();
        self.request(|reply| Command::CallUser { peer, stream, reply })
            .await
    }

    pub async fn end_call(&self, peer: &str) -> Result<(), Error> {
        let peer = peer.to_string();
        self.request(|reply| Command::EndCall { peer, reply }).await
    }

    /// Start the identify (first-trust) flow; the outcome arrives as a
    /// `Validation` or `ValidationFailure` event.
    pub async fn trust(&self, peer: &str) -> Result<(), Error> {
        let peer = peer.to_string();
        self.request(|reply| Command::Trust { peer, reply }).await
    }

    /// Start a challenge against the stored key; outcome via events.
    pub async fn challenge(&self, peer: &str) -> Result<(), Error> {
        let peer = peer.to_string();
        self.request(|reply| Command::Challenge { peer, reply }).await
    }

    /// Drop the stored key and validation status for `peer`.
    pub async fn untrust(&self, peer: &str) -> Result<(), Error> {
        let peer = peer.to_string();
        self.request(|reply| Command::Untrust { peer, reply }).await
    }

    /// Rename this instance; returns the new decorated display name.
    pub async fn change_name(&self, name: &str) -> Result<String, Error> {
        let name = name.to_string();
        self.request(|reply| Command::ChangeName { name, reply }).await
    }

    /// Adopt `identity` as this instance's own (name persistence included).
    pub async fn register(&self, identity: Identity) -> Result<(), Error> {
        self.request(|reply| Command::Register { identity, reply })
            .await
    }

    /// Clear own key pair and every stored host record.
    pub async fn reset(&self) -> Result<(), Error> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Peers with an open session, by display name.
    pub async fn connected_users(&self) -> Result<Vec<String>, Error> {
        self.request(|reply| Command::ConnectedUsers { reply }).await
    }

    pub async fn peer_info(&self, peer: &str) -> Result<PeerInfo, Error> {
        let peer = peer.to_string();
        self.request(|reply| Command::PeerInfoQuery { peer, reply })
            .await
    }

    /// The bounded envelope history, oldest first.
    pub async fn history(&self) -> Result<Vec<Envelope>, Error> {
        self.request(|reply| Command::History { reply }).await
    }

    /// Register a question handler for `topic`.
    pub async fn on_question(&self, topic: &str, handler: QuestionHandler) -> Result<(), Error> {
        let topic = topic.to_string();
        self.request(|reply| Command::RegisterHandler { topic, handler, reply })
            .await
    }

    /// Stop the node: publish `unload`, close every session, release the
    /// instance slot.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

// ── Node ──────────────────────────────────────────────────────────────────────

pub struct Node {
    state: NodeState,
    bus: SignalBus,
    cmd_rx: mpsc::Receiver<Command>,
}

impl Node {
    /// Validate the configuration, load the persisted identity, and claim
    /// an instance slot. The broker is not touched until [`run`](Self::run).
    pub fn new(config: Config, collab: Collaborators) -> Result<Self, Error> {
        config.validate()?;

        let own = OwnIdentity::load_or_generate(
            collab.store.as_ref(),
            collab.crypto.as_ref(),
            config.name.as_deref(),
        )?;

        let (registry, slot) = if config.tabs.enabled {
            let registry = InstanceRegistry::acquire(Arc::clone(&collab.store), &config.tabs)?;
            let slot = registry.slot();
            (Some(registry), slot)
        } else {
            (None, 0)
        };

        let display_name = slotted_name(&own.bare_name, slot);
        info!(name = %display_name, "node identity ready");

        let bus = SignalBus::new(
            collab.broker,
            display_name.clone(),
            config.compression.clone(),
            config.history.clone(),
        );
        let records = HostRecords::load(Arc::clone(&collab.store));
        let policy = TrustPolicy::for_mode(config.trust_mode);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, _) = broadcast::channel(256);

        let channel_specs = vec![
            ChannelSpec::json(CHAT_CHANNEL),
            ChannelSpec::json(DM_CHANNEL),
            ChannelSpec::json(QUESTION_CHANNEL),
            ChannelSpec::json(ANSWER_CHANNEL),
            ChannelSpec::json(PING_CHANNEL),
        ];

        let state = NodeState {
            config,
            own,
            slot,
            display_name,
            records,
            policy,
            validated: HashSet::new(),
            admitted: HashSet::new(),
            peer_keys: HashMap::new(),
            info_cache: HashMap::new(),
            sessions: HashMap::new(),
            pending_candidates: HashMap::new(),
            parked_asks: HashMap::new(),
            channel_specs,
            handlers: HandlerRegistry::new(),
            store: collab.store,
            crypto: collab.crypto,
            transports: collab.transports,
            gate: collab.gate,
            media_source: collab.media,
            registry,
            event_tx,
            cmd_tx,
            connected: false,
            beacons_sent: 0,
            next_beacon: Instant::now() + BEACON_FAST,
        };

        Ok(Self {
            state,
            bus,
            cmd_rx,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            cmd_tx: self.state.cmd_tx.clone(),
            event_tx: self.state.event_tx.clone(),
        }
    }

    pub fn display_name(&self) -> &str {
        &self.state.display_name
    }

    /// Run the event loop until shutdown. Honours
    /// `connection.auto_connect`.
    pub async fn run(mut self) -> Result<(), Error> {
        if let Some(registry) = self.state.registry.as_mut() {
            let tabs = self.state.config.tabs.clone();
            registry.start_heartbeat(&tabs);
        }
        if self.state.config.connection.auto_connect {
            if let Err(e) = self.state.do_connect(&mut self.bus).await {
                warn!("auto-connect failed: {e}");
            }
        }
        let streams = StreamMap::new();
        self.state.event_loop(self.bus, self.cmd_rx, streams).await
    }
}

// ── NodeState ─────────────────────────────────────────────────────────────────

type TransportStreams = StreamMap<String, UnboundedReceiverStream<TransportEvent>>;

fn rtc_key(peer: &str) -> String {
    format!("rtc:{peer}")
}

fn media_key(peer: &str) -> String {
    format!("media:{peer}")
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct NodeState {
    config: Config,
    own: OwnIdentity,
    slot: u32,
    /// Our decorated display name, `bare(slot)`.
    display_name: String,
    records: HostRecords,
    policy: TrustPolicy,
    /// Bare names that passed verification on the current connection.
    validated: HashSet<String>,
    /// Bare names whose admission prompt already resolved to accept.
    admitted: HashSet<String>,
    /// Public key presented per bare name (from `connect` envelopes).
    peer_keys: HashMap<String, String>,
    /// PeerInfo snapshots, invalidated on disconnect or record change.
    info_cache: HashMap<String, PeerInfo>,
    /// Sessions keyed by the remote's decorated display name.
    sessions: HashMap<String, Session>,
    /// One queued ICE candidate per bare name without a session.
    pending_candidates: HashMap<String, IceCandidate>,
    /// Parked question sends: `(peer key, parked id) → question n`.
    parked_asks: HashMap<(String, u64), u64>,
    channel_specs: Vec<ChannelSpec>,
    handlers: HandlerRegistry,
    store: Arc<dyn crate::store::KeyValueStore>,
    crypto: Arc<dyn CryptoProvider>,
    transports: Arc<dyn TransportFactory>,
    gate: Arc<dyn ConnectionGate>,
    media_source: Arc<dyn MediaSource>,
    registry: Option<InstanceRegistry>,
    event_tx: broadcast::Sender<NodeEvent>,
    cmd_tx: mpsc::Sender<Command>,
    connected: bool,
    beacons_sent: u32,
    next_beacon: Instant,
}

impl NodeState {
    // ── Event loop ───────────────────────────────────────────────────────────

    async fn event_loop(
        mut self,
        mut bus: SignalBus,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut streams: TransportStreams,
    ) -> Result<(), Error> {
        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    if self.on_command(&mut bus, &mut streams, cmd).await {
                        break;
                    }
                }
                env = bus.recv(), if self.connected => {
                    match env {
                        Some(env) => self.on_envelope(&mut bus, &mut streams, env).await,
                        None => self.on_broker_lost(&mut bus).await,
                    }
                }
                Some((key, event)) = streams.next(), if !streams.is_empty() => {
                    self.on_transport_event(&mut bus, &mut streams, key, event).await;
                }
                _ = tokio::time::sleep_until(self.next_beacon), if self.connected => {
                    self.on_beacon(&mut bus).await;
                }
            }
        }
        self.cleanup(&mut bus).await;
        Ok(())
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.event_tx.send(event);
    }

    // ── Broker connection ────────────────────────────────────────────────────

    async fn do_connect(&mut self, bus: &mut SignalBus) -> Result<(), Error> {
        let opts = BrokerOptions::from_config(&self.config.mqtt);
        bus.connect(&opts).await?;
        let room = self
            .config
            .topic
            .room
            .clone()
            .unwrap_or_else(rtchat_config::default_room);
        let topic = self.config.topic.full_topic(&room);
        bus.subscribe(&topic).await?;
        self.connected = true;
        self.emit(NodeEvent::MqttConnected);
        // Announce immediately; the beacon keeps announcing while lonely.
        self.publish_connect(bus).await;
        self.beacons_sent = 0;
        self.next_beacon = Instant::now() + BEACON_FAST;
        Ok(())
    }

    async fn publish_connect(&mut self, bus: &mut SignalBus) {
        let identity = Identity::with_key(&self.own.bare_name, &self.own.public_jwk);
        let payload = ConnectPayload {
            identity: identity.serialize(),
            user_info: self.config.user_info.clone(),
        };
        if let Err(e) = bus
            .publish(subtopics::CONNECT, json!(payload))
            .await
        {
            warn!("connect publish failed: {e}");
        }
    }

    /// The broker's inbound stream ended. Re-establish per the
    /// `connection` settings, re-announcing once the room is subscribed
    /// again.
    async fn on_broker_lost(&mut self, bus: &mut SignalBus) {
        self.connected = false;
        if !self.config.connection.auto_reconnect {
            warn!("broker connection lost");
            return;
        }
        let delay = Duration::from_millis(self.config.connection.reconnect_delay.max(1));
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if let Some(max) = self.config.connection.max_reconnect_attempts {
                if attempt > max {
                    warn!("giving up after {max} reconnect attempts");
                    return;
                }
            }
            tokio::time::sleep(delay).await;
            match self.do_connect(bus).await {
                Ok(()) => {
                    info!(attempt, "broker reconnected");
                    return;
                }
                Err(e) => debug!(attempt, "reconnect failed: {e}"),
            }
        }
    }

    async fn on_beacon(&mut self, bus: &mut SignalBus) {
        let any_open = self
            .sessions
            .values()
            .any(|s| s.state == SessionState::Open);
        if !any_open {
            trace!("presence beacon");
            self.publish_connect(bus).await;
        }
        self.beacons_sent = self.beacons_sent.saturating_add(1);
        let period = if self.beacons_sent < BEACON_FAST_COUNT {
            BEACON_FAST
        } else {
            BEACON_SLOW
        };
        self.next_beacon = Instant::now() + period;
    }

    // ── Envelope dispatch ────────────────────────────────────────────────────

    async fn on_envelope(
        &mut self,
        bus: &mut SignalBus,
        streams: &mut TransportStreams,
        env: Envelope,
    ) {
        match env.subtopic.as_str() {
            subtopics::CONNECT => self.on_connect_envelope(bus, streams, env).await,
            subtopics::RTC_OFFER => self.on_rtc_offer(bus, streams, env).await,
            subtopics::RTC_ANSWER => self.on_rtc_answer(env).await,
            subtopics::RTC_ICE_CANDIDATE => self.on_rtc_candidate(env).await,
            subtopics::NAME_CHANGE => self.on_name_change(streams, env),
            subtopics::UNLOAD => self.on_unload(streams, &env.sender),
            _ => self.emit(NodeEvent::MqttMessage(env)),
        }
    }

    /// Learn the identity a `connect` envelope carries.
    fn learn_identity(&mut self, env: &Envelope) {
        if let Ok(payload) = serde_json::from_value::<ConnectPayload>(env.data.clone()) {
            let identity = Identity::parse(&payload.identity);
            if let Some(key) = identity.public_key {
                let bare = extract_name(&env.sender);
                self.peer_keys.insert(bare.clone(), key);
                self.info_cache.remove(&bare);
            }
        }
    }

    async fn on_connect_envelope(
        &mut self,
        bus: &mut SignalBus,
        streams: &mut TransportStreams,
        env: Envelope,
    ) {
        let sender = env.sender.clone();
        self.learn_identity(&env);

        if let Some(session) = self.sessions.get(&sender) {
            let dead = session.state == SessionState::Closed
                || session.transport.state().is_terminal();
            if !dead {
                // Open or in progress: info updated above, nothing else.
                trace!(peer = %sender, "connect from known peer ignored");
                return;
            }
            debug!(peer = %sender, "connect from peer with dead session; restarting");
            self.destroy_session(streams, &sender, false);
        }

        if !self.admit(&sender).await {
            debug!(peer = %sender, "connection refused by policy");
            return;
        }
        self.open_offer_session(bus, streams, sender).await;
    }

    /// Admission decision for `peer`, caching accepted prompts.
    async fn admit(&mut self, peer: &str) -> bool {
        let bare = extract_name(peer);
        if self.admitted.contains(&bare) {
            return true;
        }
        let info = self.peer_info_for(peer);
        let accepted = match info.trust_level {
            TrustAction::Reject => false,
            TrustAction::ConnectAndTrust => true,
            TrustAction::PromptAndTrust | TrustAction::ConnectAndPrompt => {
                if self.config.connection.auto_accept_connections {
                    true
                } else {
                    self.emit(NodeEvent::ConnectionRequest {
                        peer: peer.to_string(),
                        info: info.clone(),
                    });
                    self.gate.connection_request(peer, &info).await
                }
            }
        };
        if accepted {
            self.admitted.insert(bare);
        }
        accepted
    }

    fn peer_info_for(&mut self, peer: &str) -> PeerInfo {
        let bare = extract_name(peer);
        if let Some(info) = self.info_cache.get(&bare) {
            return info.clone();
        }
        let provided = self.peer_keys.get(&bare).map(String::as_str);
        let info = assess_peer(
            &self.records,
            &self.policy,
            peer,
            provided,
            self.validated.contains(&bare),
        );
        self.info_cache.insert(bare, info.clone());
        info
    }

    async fn open_offer_session(
        &mut self,
        bus: &mut SignalBus,
        streams: &mut TransportStreams,
        sender: String,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = self.transports.create(&self.config.webrtc, tx);
        let mut session =
            match Session::new(sender.clone(), SessionRole::Offerer, transport, &self.channel_specs)
            {
                Ok(s) => s,
                Err(e) => {
                    warn!(peer = %sender, "session setup failed: {e}");
                    return;
                }
            };
        let offer = match session.transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(peer = %sender, "offer creation failed: {e}");
                return;
            }
        };
        session.state = SessionState::Offering;
        self.apply_pending_candidate(&mut session).await;
        streams.insert(rtc_key(&sender), UnboundedReceiverStream::new(rx));
        self.sessions.insert(sender.clone(), session);
        debug!(peer = %sender, "offering session");
        if let Err(e) = bus
            .publish(
                subtopics::RTC_OFFER,
                json!(RtcSignal { target: sender, sdp: offer }),
            )
            .await
        {
            warn!("offer publish failed: {e}");
        }
    }

    async fn on_rtc_offer(
        &mut self,
        bus: &mut SignalBus,
        streams: &mut TransportStreams,
        env: Envelope,
    ) {
        let Ok(signal) = serde_json::from_value::<RtcSignal>(env.data.clone()) else {
            debug!("dropping malformed RTCOffer");
            return;
        };
        if signal.target != self.display_name {
            return;
        }
        let sender = env.sender.clone();

        if let Some(existing) = self.sessions.get(&sender) {
            if existing.state == SessionState::Offering && self.display_name >= sender {
                // Offer glare: the lexicographically smaller name yields.
                // Ours is not smaller, so the remote answers our offer.
                debug!(peer = %sender, "ignoring inbound offer, remote yields");
                return;
            }
            debug!(peer = %sender, "replacing existing session with inbound offer");
            self.destroy_session(streams, &sender, false);
        }

        if !self.admit(&sender).await {
            debug!(peer = %sender, "offer refused by policy");
            return;
        }
        self.open_answer_session(bus, streams, sender, signal.sdp).await;
    }

    async fn open_answer_session(
        &mut self,
        bus: &mut SignalBus,
        streams: &mut TransportStreams,
        sender: String,
        offer: SessionDescription,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = self.transports.create(&self.config.webrtc, tx);
        let mut session = match Session::new(
            sender.clone(),
            SessionRole::Answerer,
            transport,
            &self.channel_specs,
        ) {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = %sender, "session setup failed: {e}");
                return;
            }
        };
        let answer = match async {
            session.transport.set_remote_description(offer).await?;
            session.transport.create_answer().await
        }
        .await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!(peer = %sender, "answering failed: {e}");
                return;
            }
        };
        session.state = SessionState::Negotiating;
        self.apply_pending_candidate(&mut session).await;
        streams.insert(rtc_key(&sender), UnboundedReceiverStream::new(rx));
        self.sessions.insert(sender.clone(), session);
        debug!(peer = %sender, "answering session");
        if let Err(e) = bus
            .publish(
                subtopics::RTC_ANSWER,
                json!(RtcSignal { target: sender, sdp: answer }),
            )
            .await
        {
            warn!("answer publish failed: {e}");
        }
    }

    async fn apply_pending_candidate(&mut self, session: &mut Session) {
        let bare = extract_name(&session.remote);
        if let Some(candidate) = self.pending_candidates.remove(&bare) {
            if let Err(e) = session.transport.add_ice_candidate(candidate).await {
                debug!(peer = %session.remote, "queued candidate rejected: {e}");
            }
        }
    }

    async fn on_rtc_answer(&mut self, env: Envelope) {
        let Ok(signal) = serde_json::from_value::<RtcSignal>(env.data.clone()) else {
            debug!("dropping malformed RTCAnswer");
            return;
        };
        if signal.target != self.display_name {
            return;
        }
        let Some(session) = self.sessions.get_mut(&env.sender) else {
            debug!(peer = %env.sender, "answer without a session dropped");
            return;
        };
        if session.role != SessionRole::Offerer || session.state != SessionState::Offering {
            debug!(peer = %env.sender, "unexpected answer dropped");
            return;
        }
        match session.transport.set_remote_description(signal.sdp).await {
            Ok(()) => session.state = SessionState::Negotiating,
            Err(e) => warn!(peer = %env.sender, "applying answer failed: {e}"),
        }
    }

    async fn on_rtc_candidate(&mut self, env: Envelope) {
        let Ok(signal) = serde_json::from_value::<RtcCandidate>(env.data.clone()) else {
            debug!("dropping malformed RTCIceCandidate");
            return;
        };
        if signal.target != self.display_name {
            return;
        }
        match self.sessions.get_mut(&env.sender) {
            Some(session) => {
                if let Err(e) = session.transport.add_ice_candidate(signal.candidate).await {
                    debug!(peer = %env.sender, "candidate rejected: {e}");
                }
            }
            None => {
                // One queued candidate per peer; newest wins.
                self.pending_candidates
                    .insert(extract_name(&env.sender), signal.candidate);
            }
        }
    }

    fn on_name_change(&mut self, streams: &mut TransportStreams, env: Envelope) {
        let Ok(payload) = serde_json::from_value::<NameChangePayload>(env.data.clone()) else {
            debug!("dropping malformed nameChange");
            return;
        };
        let (old, new) = (payload.old_name, payload.new_name);
        let (old_bare, new_bare) = (extract_name(&old), extract_name(&new));
        debug!(%old, %new, "peer renamed");

        if let Some(mut session) = self.sessions.remove(&old) {
            session.remote = new.clone();
            self.sessions.insert(new.clone(), session);
            if let Some(stream) = streams.remove(&rtc_key(&old)) {
                streams.insert(rtc_key(&new), stream);
            }
            if let Some(stream) = streams.remove(&media_key(&old)) {
                streams.insert(media_key(&new), stream);
            }
            // Pending ask deadlines follow the session to its new key.
            let moved: Vec<(u64, u64)> = self
                .parked_asks
                .iter()
                .filter(|((p, _), _)| p == &old)
                .map(|((_, id), n)| (*id, *n))
                .collect();
            for (id, n) in moved {
                self.parked_asks.remove(&(old.clone(), id));
                self.parked_asks.insert((new.clone(), id), n);
            }
        }
        if let Err(e) = self.records.rename(&old_bare, &new_bare) {
            warn!("record rename failed: {e}");
        }
        if self.validated.remove(&old_bare) {
            self.validated.insert(new_bare.clone());
        }
        if self.admitted.remove(&old_bare) {
            self.admitted.insert(new_bare.clone());
        }
        if let Some(key) = self.peer_keys.remove(&old_bare) {
            self.peer_keys.insert(new_bare.clone(), key);
        }
        self.info_cache.remove(&old_bare);
        self.info_cache.remove(&new_bare);
        self.emit(NodeEvent::NameChange { old, new });
    }

    fn on_unload(&mut self, streams: &mut TransportStreams, sender: &str) {
        debug!(peer = %sender, "peer unloaded");
        let bare = extract_name(sender);
        self.admitted.remove(&bare);
        self.peer_keys.remove(&bare);
        self.pending_candidates.remove(&bare);
        if self.sessions.contains_key(sender) {
            self.destroy_session(streams, sender, true);
        }
    }

    /// Close and forget a session. Validation state is connection-scoped
    /// and dies with it.
    fn destroy_session(&mut self, streams: &mut TransportStreams, peer: &str, announce: bool) {
        let bare = extract_name(peer);
        if let Some(mut session) = self.sessions.remove(peer) {
            session.close();
        }
        streams.remove(&rtc_key(peer));
        streams.remove(&media_key(peer));
        self.parked_asks.retain(|(p, _), _| p.as_str() != peer);
        self.validated.remove(&bare);
        self.info_cache.remove(&bare);
        if announce {
            self.emit(NodeEvent::DisconnectedFromPeer {
                peer: peer.to_string(),
            });
        }
    }

    // ── Transport events ─────────────────────────────────────────────────────

    async fn on_transport_event(
        &mut self,
        bus: &mut SignalBus,
        streams: &mut TransportStreams,
        key: String,
        event: TransportEvent,
    ) {
        if let Some(peer) = key.strip_prefix("rtc:").map(str::to_string) {
            self.on_session_transport_event(bus, streams, &peer, event)
                .await;
        } else if let Some(peer) = key.strip_prefix("media:").map(str::to_string) {
            self.on_media_transport_event(streams, &peer, event);
        }
    }

    async fn on_session_transport_event(
        &mut self,
        bus: &mut SignalBus,
        streams: &mut TransportStreams,
        peer: &str,
        event: TransportEvent,
    ) {
        match event {
            TransportEvent::ChannelOpen { label } => {
                let Some(session) = self.sessions.get_mut(peer) else {
                    return;
                };
                let barrier_completed = session.on_channel_open(&label);
                session.flush_parked(&label);
                if barrier_completed {
                    self.on_session_open(peer.to_string());
                }
            }
            TransportEvent::ChannelClosed { label } => {
                if let Some(session) = self.sessions.get_mut(peer) {
                    session.on_channel_closed(&label);
                }
            }
            TransportEvent::ChannelMessage { label, data } => {
                self.on_frame(streams, peer.to_string(), label, data).await;
            }
            TransportEvent::IceCandidate(candidate) => {
                let signal = RtcCandidate {
                    target: peer.to_string(),
                    candidate,
                };
                if let Err(e) = bus
                    .publish(subtopics::RTC_ICE_CANDIDATE, json!(signal))
                    .await
                {
                    warn!("candidate publish failed: {e}");
                }
            }
            TransportEvent::ConnectionState(state) if state.is_terminal() => {
                debug!(peer, ?state, "transport reached terminal state");
                self.destroy_session(streams, peer, true);
            }
            TransportEvent::ConnectionState(_) | TransportEvent::Track { .. } => {}
        }
    }

    /// The load barrier resolved: the session is open for traffic.
    fn on_session_open(&mut self, peer: String) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        if session.announced {
            // A channel bounced and re-opened; the session was already
            // announced once.
            return;
        }
        session.state = SessionState::Open;
        session.announced = true;
        info!(peer = %peer, "session open");
        if session.role == SessionRole::Offerer {
            let sentinel = serde_json::to_vec(&json!(CONNECTED_SENTINEL)).unwrap_or_default();
            if let Err(e) = session.transport.send(CHAT_CHANNEL, &sentinel) {
                debug!(peer = %peer, "sentinel send failed: {e}");
            }
        }
        self.emit(NodeEvent::ConnectedToPeer { peer: peer.clone() });
        self.spawn_internal(VERIFY_DELAY, InternalCmd::VerifyPeer { peer });
    }

    fn on_media_transport_event(
        &mut self,
        _streams: &mut TransportStreams,
        peer: &str,
        event: TransportEvent,
    ) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        match event {
            TransportEvent::Track { stream } => {
                if let Some(media) = session.media.as_mut() {
                    media.on_track(stream.clone());
                    self.emit(NodeEvent::CallConnected {
                        peer: peer.to_string(),
                        stream,
                    });
                }
            }
            TransportEvent::IceCandidate(candidate) => {
                // Media candidates travel over the parent session, not the
                // broker.
                let frame = serde_json::to_vec(&StreamIce { candidate }).unwrap_or_default();
                if let Err(e) = session.transport.send("streamice", &frame) {
                    debug!(peer, "streamice send failed: {e}");
                }
            }
            TransportEvent::ConnectionState(state) if state.is_terminal() => {
                if let Some(mut media) = session.media.take() {
                    media.close();
                    self.emit(NodeEvent::CallEnded {
                        peer: peer.to_string(),
                    });
                }
            }
            _ => {}
        }
    }

    // ── Inbound frames ───────────────────────────────────────────────────────

    async fn on_frame(
        &mut self,
        streams: &mut TransportStreams,
        peer: String,
        label: String,
        data: Vec<u8>,
    ) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        if session.channel_is_raw(&label) {
            self.emit(NodeEvent::RawMessage {
                from: peer,
                channel: label,
                data,
            });
            return;
        }
        let Ok(value) = serde_json::from_slice::<Value>(&data) else {
            debug!(peer = %peer, label, "dropping undecodable frame");
            return;
        };
        match label.as_str() {
            CHAT_CHANNEL if value == json!(CONNECTED_SENTINEL) => {
                trace!(peer = %peer, "remote confirmed open");
            }
            CHAT_CHANNEL => self.emit(NodeEvent::Chat {
                from: peer,
                data: value,
            }),
            DM_CHANNEL => self.emit(NodeEvent::Dm {
                from: peer,
                data: value,
            }),
            QUESTION_CHANNEL => self.on_question_frame(peer, value),
            ANSWER_CHANNEL => self.on_answer_frame(peer, value),
            PING_CHANNEL => self.on_ping_frame(peer, value),
            "streamoffer" => self.on_stream_offer(streams, peer, value).await,
            "streamanswer" => self.on_stream_answer(peer, value).await,
            "streamice" => self.on_stream_ice(peer, value).await,
            "endcall" => self.on_end_call_frame(peer),
            _ => self.emit(NodeEvent::RtcMessage {
                from: peer,
                channel: label,
                data: value,
            }),
        }
    }

    fn on_question_frame(&mut self, peer: String, value: Value) {
        let Ok(frame) = serde_json::from_value::<QuestionFrame>(value) else {
            debug!(peer = %peer, "malformed question frame");
            return;
        };
        let QuestionFrame { n, question } = frame;
        self.emit(NodeEvent::Question {
            from: peer.clone(),
            topic: question.topic.clone(),
            content: question.content.clone(),
        });

        match question.topic.as_str() {
            CHALLENGE_TOPIC => {
                let crypto = Arc::clone(&self.crypto);
                let private = self.own.private_jwk.clone();
                let cmd_tx = self.cmd_tx.clone();
                let challenge = question.content.as_str().unwrap_or_default().to_string();
                tokio::spawn(async move {
                    let answer = match crypto.sign(&private, &string_bytes(&challenge)) {
                        Ok(sig) => json!(byte_string(&sig)),
                        Err(e) => {
                            warn!("challenge signing failed: {e}");
                            return;
                        }
                    };
                    let _ = cmd_tx
                        .send(Command::Internal(InternalCmd::AnswerReady {
                            peer,
                            n,
                            question,
                            answer,
                        }))
                        .await;
                });
            }
            IDENTIFY_TOPIC => {
                let crypto = Arc::clone(&self.crypto);
                let private = self.own.private_jwk.clone();
                let public = self.own.public_jwk.clone();
                let cmd_tx = self.cmd_tx.clone();
                let challenge = question.content.as_str().unwrap_or_default().to_string();
                tokio::spawn(async move {
                    let answer = match crypto.sign(&private, &string_bytes(&challenge)) {
                        Ok(sig) => json!(IdentifyAnswer {
                            public_key_string: public,
                            signature: byte_string(&sig),
                        }),
                        Err(e) => {
                            warn!("identify signing failed: {e}");
                            return;
                        }
                    };
                    let _ = cmd_tx
                        .send(Command::Internal(InternalCmd::AnswerReady {
                            peer,
                            n,
                            question,
                            answer,
                        }))
                        .await;
                });
            }
            topic => match self.handlers.get(topic) {
                Some(handler) => {
                    let cmd_tx = self.cmd_tx.clone();
                    let content = question.content.clone();
                    let sender = peer.clone();
                    tokio::spawn(async move {
                        let answer = handler(content, sender.clone()).await;
                        let _ = cmd_tx
                            .send(Command::Internal(InternalCmd::AnswerReady {
                                peer: sender,
                                n,
                                question,
                                answer,
                            }))
                            .await;
                    });
                }
                None => {
                    // The asker's future stays pending until its session
                    // closes; that is the contract for unknown topics.
                    warn!(peer = %peer, topic, "{}", Error::NoHandler(topic.to_string()));
                }
            },
        }
    }

    fn on_answer_frame(&mut self, peer: String, value: Value) {
        let Ok(frame) = serde_json::from_value::<AnswerFrame>(value.clone()) else {
            debug!(peer = %peer, "malformed answer frame");
            return;
        };
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        if !session.asked.resolve(&frame.n, frame.answer.clone()) {
            debug!(peer = %peer, n = frame.n, "answer without a pending question");
        }
        self.emit(NodeEvent::RtcMessage {
            from: peer,
            channel: ANSWER_CHANNEL.into(),
            data: value,
        });
    }

    fn on_ping_frame(&mut self, peer: String, value: Value) {
        let Ok(frame) = serde_json::from_value::<PingFrame>(value) else {
            debug!(peer = %peer, "malformed ping frame");
            return;
        };
        let bare = extract_name(&peer);
        match frame {
            PingFrame::Ping { timestamp } => {
                self.emit(NodeEvent::Ping { from: peer.clone() });
                if !self.gating_allows(&bare, PING_CHANNEL, None) {
                    debug!(peer = %peer, "pong withheld from unverified peer");
                    return;
                }
                if let Some(session) = self.sessions.get_mut(&peer) {
                    let pong =
                        serde_json::to_vec(&PingFrame::Pong { timestamp }).unwrap_or_default();
                    if let Err(e) = session.transport.send(PING_CHANNEL, &pong) {
                        debug!(peer = %peer, "pong send failed: {e}");
                    }
                }
            }
            PingFrame::Pong { timestamp } => {
                let latency = now_ms() - timestamp;
                if let Some(session) = self.sessions.get_mut(&peer) {
                    session.pings.resolve(&timestamp, latency);
                }
                self.emit(NodeEvent::Pong {
                    from: peer,
                    latency_ms: latency,
                });
            }
        }
    }

    // ── Media frames ─────────────────────────────────────────────────────────

    /// Inbound call: build the answering media sub-session and reply over
    /// the `streamanswer` channel.
    async fn on_stream_offer(
        &mut self,
        streams: &mut TransportStreams,
        peer: String,
        value: Value,
    ) {
        let Ok(signal) = serde_json::from_value::<StreamSignal>(value) else {
            debug!(peer = %peer, "malformed streamoffer");
            return;
        };
        let Some(local_stream) = self.media_source.local_stream() else {
            debug!(peer = %peer, "no local media, declining call");
            if let Some(session) = self.sessions.get_mut(&peer) {
                let _ = session.transport.send("endcall", b"{}");
            }
            return;
        };
        if !self.sessions.contains_key(&peer) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = self.transports.create(&self.config.webrtc, tx);
        let mut media =
            MediaSession::new(transport, SessionRole::Answerer, local_stream.clone());
        let answer = match async {
            media.transport.add_track(local_stream).await?;
            media.transport.set_remote_description(signal.sdp).await?;
            media.transport.create_answer().await
        }
        .await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!(peer = %peer, "media answer failed: {e}");
                return;
            }
        };
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        if let Some(mut stale) = session.media.take() {
            stale.close();
        }
        session.media = Some(media);
        streams.insert(media_key(&peer), UnboundedReceiverStream::new(rx));
        let frame = serde_json::to_vec(&StreamSignal { sdp: answer }).unwrap_or_default();
        if let Err(e) = session.transport.send("streamanswer", &frame) {
            debug!(peer = %peer, "streamanswer send failed: {e}");
        }
    }

    async fn on_stream_answer(&mut self, peer: String, value: Value) {
        let Ok(signal) = serde_json::from_value::<StreamSignal>(value) else {
            debug!(peer = %peer, "malformed streamanswer");
            return;
        };
        if let Some(session) = self.sessions.get_mut(&peer) {
            if let Some(media) = session.media.as_mut() {
                if let Err(e) = media.transport.set_remote_description(signal.sdp).await {
                    warn!(peer = %peer, "applying media answer failed: {e}");
                }
            }
        }
    }

    async fn on_stream_ice(&mut self, peer: String, value: Value) {
        let Ok(signal) = serde_json::from_value::<StreamIce>(value) else {
            debug!(peer = %peer, "malformed streamice");
            return;
        };
        if let Some(session) = self.sessions.get_mut(&peer) {
            if let Some(media) = session.media.as_mut() {
                if let Err(e) = media.transport.add_ice_candidate(signal.candidate).await {
                    debug!(peer = %peer, "media candidate rejected: {e}");
                }
            }
        }
    }

    fn on_end_call_frame(&mut self, peer: String) {
        if let Some(session) = self.sessions.get_mut(&peer) {
            if let Some(mut media) = session.media.take() {
                media.close();
                self.emit(NodeEvent::CallEnded { peer });
            }
        }
    }

    // ── Gating ───────────────────────────────────────────────────────────────

    /// Outbound gating: only identify/challenge question traffic may reach
    /// a peer that has not completed validation.
    fn gating_allows(&self, bare: &str, label: &str, topic: Option<&str>) -> bool {
        if self.validated.contains(bare) {
            return true;
        }
        matches!(label, QUESTION_CHANNEL | ANSWER_CHANNEL)
            && matches!(topic, Some(IDENTIFY_TOPIC) | Some(CHALLENGE_TOPIC))
    }

    // ── Command handling ─────────────────────────────────────────────────────

    /// Returns true when the loop should exit.
    async fn on_command(
        &mut self,
        bus: &mut SignalBus,
        streams: &mut TransportStreams,
        cmd: Command,
    ) -> bool {
        match cmd {
            Command::Connect { reply } => {
                let outcome = self.do_connect(bus).await;
                let _ = reply.send(outcome);
            }
            Command::Disconnect { peer, reply } => {
                let outcome = match self.find_session_key(&peer) {
                    Some(key) => {
                        self.destroy_session(streams, &key, true);
                        Ok(())
                    }
                    None => Err(Error::PeerNotFound(peer)),
                };
                let _ = reply.send(outcome);
            }
            Command::Send { peer, channel, payload, reply } => {
                self.on_send(peer, channel, payload, reply);
            }
            Command::Ask { peer, topic, content, reply } => {
                self.on_ask(peer, topic, content, reply);
            }
            Command::Ping { peer, reply } => {
                self.on_ping_command(peer, reply);
            }
            Command::CallUser { peer, stream, reply } => {
                self.on_call_user(streams, peer, stream, reply).await;
            }
            Command::EndCall { peer, reply } => {
                let outcome = self.on_end_call_command(&peer);
                let _ = reply.send(outcome);
            }
            Command::Trust { peer, reply } => {
                let outcome = match self.find_session_key(&peer) {
                    Some(key) => {
                        self.spawn_identify_flow(key);
                        Ok(())
                    }
                    None => Err(Error::PeerNotFound(peer)),
                };
                let _ = reply.send(outcome);
            }
            Command::Challenge { peer, reply } => {
                let outcome = match self.find_session_key(&peer) {
                    Some(key) => {
                        let bare = extract_name(&key);
                        match self.records.key_for(&bare).map(str::to_string) {
                            Some(stored) => {
                                self.spawn_challenge_flow(key, stored);
                                Ok(())
                            }
                            None => Err(Error::Crypto(format!(
                                "no stored public key for {bare:?}"
                            ))),
                        }
                    }
                    None => Err(Error::PeerNotFound(peer)),
                };
                let _ = reply.send(outcome);
            }
            Command::Untrust { peer, reply } => {
                let outcome = self.untrust(&peer);
                let _ = reply.send(outcome);
            }
            Command::ChangeName { name, reply } => {
                let outcome = self.on_change_name(bus, name).await;
                let _ = reply.send(outcome);
            }
            Command::Register { identity, reply } => {
                let outcome = self.on_register(identity);
                let _ = reply.send(outcome);
            }
            Command::Reset { reply } => {
                let outcome = self.on_reset(streams);
                let _ = reply.send(outcome);
            }
            Command::ConnectedUsers { reply } => {
                let users = self
                    .sessions
                    .iter()
                    .filter(|(_, s)| s.state == SessionState::Open)
                    .map(|(k, _)| k.clone())
                    .collect();
                let _ = reply.send(Ok(users));
            }
            Command::PeerInfoQuery { peer, reply } => {
                let info = self.peer_info_for(&peer);
                let _ = reply.send(Ok(info));
            }
            Command::History { reply } => {
                let _ = reply.send(Ok(bus.history().cloned().collect()));
            }
            Command::RegisterHandler { topic, handler, reply } => {
                self.handlers.register(topic, handler);
                let _ = reply.send(Ok(()));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
                return true;
            }
            Command::Internal(internal) => {
                self.on_internal(internal);
            }
        }
        false
    }

    fn find_session_key(&self, peer: &str) -> Option<String> {
        if self.sessions.contains_key(peer) {
            return Some(peer.to_string());
        }
        let bare = extract_name(peer);
        self.sessions
            .keys()
            .find(|key| extract_name(key) == bare)
            .cloned()
    }

    fn on_send(
        &mut self,
        peer: String,
        channel: String,
        payload: SendPayload,
        reply: Reply<()>,
    ) {
        let Some(key) = self.find_session_key(&peer) else {
            let _ = reply.send(Err(Error::PeerNotFound(peer)));
            return;
        };
        let bare = extract_name(&key);
        if !self.gating_allows(&bare, &channel, None) {
            let _ = reply.send(Err(Error::PeerUnverified(key)));
            return;
        }
        let bytes = match payload {
            SendPayload::Raw(bytes) => bytes,
            SendPayload::Json(value) => match serde_json::to_vec(&value) {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = reply.send(Err(Error::Transport(e.to_string())));
                    return;
                }
            },
        };
        self.dispatch_frame(&key, &channel, bytes, reply);
    }

    /// Route one frame respecting channel state: send now, park behind the
    /// open event with a deadline, or fail fast.
    fn dispatch_frame(&mut self, key: &str, channel: &str, bytes: Vec<u8>, reply: Reply<()>) {
        let Some(session) = self.sessions.get_mut(key) else {
            let _ = reply.send(Err(Error::PeerNotFound(key.to_string())));
            return;
        };
        match session.channel_state(channel) {
            ChannelState::Open => {
                let outcome = session.transport.send(channel, &bytes);
                let _ = reply.send(outcome);
            }
            ChannelState::Connecting => {
                let id = session.park_send(channel, bytes, reply);
                self.spawn_internal(
                    Duration::from_secs(CHANNEL_OPEN_TIMEOUT_SECS),
                    InternalCmd::ParkExpired {
                        peer: key.to_string(),
                        id,
                    },
                );
            }
            ChannelState::Closing | ChannelState::Closed => {
                let _ = reply.send(Err(Error::ChannelClosed(channel.to_string())));
            }
        }
    }

    fn on_ask(&mut self, peer: String, topic: String, content: Value, reply: Reply<Value>) {
        let Some(key) = self.find_session_key(&peer) else {
            let _ = reply.send(Err(Error::PeerNotFound(peer)));
            return;
        };
        let bare = extract_name(&key);
        if !self.gating_allows(&bare, QUESTION_CHANNEL, Some(&topic)) {
            let _ = reply.send(Err(Error::PeerUnverified(key)));
            return;
        }
        let session = self.sessions.get_mut(&key).expect("session key resolved");
        let n = session.next_question_id();
        let rx = session.asked.register(n);
        // Forward the correlated answer (or its cancellation) to the caller.
        tokio::spawn(async move {
            let outcome = match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::Shutdown),
            };
            let _ = reply.send(outcome);
        });

        let frame = QuestionFrame {
            n,
            question: QuestionBody { topic, content },
        };
        let bytes = match serde_json::to_vec(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                session.asked.fail(&n, Error::Transport(e.to_string()));
                return;
            }
        };
        match session.channel_state(QUESTION_CHANNEL) {
            ChannelState::Open => {
                if let Err(e) = session.transport.send(QUESTION_CHANNEL, &bytes) {
                    session.asked.fail(&n, e);
                }
            }
            ChannelState::Connecting => {
                let (sink, _ignored) = oneshot::channel();
                let id = session.park_send(QUESTION_CHANNEL, bytes, sink);
                self.parked_asks.insert((key.clone(), id), n);
                self.spawn_internal(
                    Duration::from_secs(CHANNEL_OPEN_TIMEOUT_SECS),
                    InternalCmd::ParkExpired { peer: key, id },
                );
            }
            ChannelState::Closing | ChannelState::Closed => {
                session
                    .asked
                    .fail(&n, Error::ChannelClosed(QUESTION_CHANNEL.into()));
            }
        }
    }

    fn on_ping_command(&mut self, peer: String, reply: Reply<i64>) {
        let Some(key) = self.find_session_key(&peer) else {
            let _ = reply.send(Err(Error::PeerNotFound(peer)));
            return;
        };
        let bare = extract_name(&key);
        if !self.gating_allows(&bare, PING_CHANNEL, None) {
            let _ = reply.send(Err(Error::PeerUnverified(key)));
            return;
        }
        let session = self.sessions.get_mut(&key).expect("session key resolved");
        // Millisecond timestamps double as correlation keys; nudge forward
        // on collision so two pings in one millisecond stay distinct.
        let mut timestamp = now_ms();
        while session.pings.contains(&timestamp) {
            timestamp += 1;
        }
        let rx = session.pings.register(timestamp);
        tokio::spawn(async move {
            let outcome = match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::Shutdown),
            };
            let _ = reply.send(outcome);
        });
        let frame = serde_json::to_vec(&PingFrame::Ping { timestamp }).unwrap_or_default();
        if let Err(e) = session.transport.send(PING_CHANNEL, &frame) {
            session.pings.fail(&timestamp, e);
        }
    }

    async fn on_call_user(
        &mut self,
        streams: &mut TransportStreams,
        peer: String,
        stream: MediaStream,
        reply: Reply<MediaStream>,
    ) {
        let Some(key) = self.find_session_key(&peer) else {
            let _ = reply.send(Err(Error::PeerNotFound(peer)));
            return;
        };
        let bare = extract_name(&key);
        if !self.gating_allows(&bare, "streamoffer", None) {
            let _ = reply.send(Err(Error::PeerUnverified(key)));
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = self.transports.create(&self.config.webrtc, tx);
        let session = self.sessions.get_mut(&key).expect("session key resolved");
        if session.media.is_some() {
            let _ = reply.send(Err(Error::CallInProgress(key)));
            return;
        }
        let mut media = MediaSession::new(transport, SessionRole::Offerer, stream.clone());
        let offer = match async {
            media.transport.add_track(stream).await?;
            media.transport.create_offer().await
        }
        .await
        {
            Ok(offer) => offer,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let (slot, start_rx) = OneShot::new();
        media.call_start = Some(slot);
        session.media = Some(media);
        streams.insert(media_key(&key), UnboundedReceiverStream::new(rx));
        tokio::spawn(async move {
            let outcome = match start_rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::Shutdown),
            };
            let _ = reply.send(outcome);
        });

        let frame = serde_json::to_vec(&StreamSignal { sdp: offer }).unwrap_or_default();
        if let Err(e) = session.transport.send("streamoffer", &frame) {
            warn!(peer = %key, "streamoffer send failed: {e}");
            if let Some(mut media) = session.media.take() {
                media.close();
            }
        }
    }

    fn on_end_call_command(&mut self, peer: &str) -> Result<(), Error> {
        let key = self
            .find_session_key(peer)
            .ok_or_else(|| Error::PeerNotFound(peer.to_string()))?;
        let session = self.sessions.get_mut(&key).expect("session key resolved");
        let Some(mut media) = session.media.take() else {
            return Ok(());
        };
        let _ = session.transport.send("endcall", b"{}");
        media.close();
        self.emit(NodeEvent::CallEnded { peer: key });
        Ok(())
    }

    async fn on_change_name(
        &mut self,
        bus: &mut SignalBus,
        name: String,
    ) -> Result<String, Error> {
        rtchat_config::validate_name(&name).map_err(Error::ConfigInvalid)?;
        let old_display = self.display_name.clone();
        OwnIdentity::store_name(self.store.as_ref(), &name)?;
        self.own.bare_name = name.clone();
        self.display_name = slotted_name(&name, self.slot);
        bus.set_name(self.display_name.clone());
        let payload = NameChangePayload {
            old_name: old_display.clone(),
            new_name: self.display_name.clone(),
        };
        if self.connected {
            bus.publish(subtopics::NAME_CHANGE, json!(payload)).await?;
        }
        self.emit(NodeEvent::NameChange {
            old: old_display,
            new: self.display_name.clone(),
        });
        Ok(self.display_name.clone())
    }

    fn on_register(&mut self, identity: Identity) -> Result<(), Error> {
        rtchat_config::validate_name(&identity.bare_name).map_err(Error::ConfigInvalid)?;
        OwnIdentity::store_name(self.store.as_ref(), &identity.bare_name)?;
        self.own.bare_name = identity.bare_name;
        self.display_name = slotted_name(&self.own.bare_name, self.slot);
        Ok(())
    }

    fn on_reset(&mut self, streams: &mut TransportStreams) -> Result<(), Error> {
        let keys: Vec<String> = self.sessions.keys().cloned().collect();
        for key in keys {
            self.destroy_session(streams, &key, true);
        }
        self.records.clear()?;
        OwnIdentity::clear(self.store.as_ref())?;
        self.validated.clear();
        self.admitted.clear();
        self.peer_keys.clear();
        self.info_cache.clear();
        // Regenerate so the instance keeps working after the wipe.
        self.own = OwnIdentity::load_or_generate(
            self.store.as_ref(),
            self.crypto.as_ref(),
            None,
        )?;
        self.display_name = slotted_name(&self.own.bare_name, self.slot);
        Ok(())
    }

    fn untrust(&mut self, peer: &str) -> Result<(), Error> {
        let bare = extract_name(peer);
        self.records.remove(&bare)?;
        self.validated.remove(&bare);
        self.info_cache.remove(&bare);
        Ok(())
    }

    // ── Internal commands ────────────────────────────────────────────────────

    fn on_internal(&mut self, cmd: InternalCmd) {
        match cmd {
            InternalCmd::VerifyPeer { peer } => self.on_verify_peer(peer),
            InternalCmd::VerifyOutcome { peer, outcome } => {
                self.on_verify_outcome(peer, outcome)
            }
            InternalCmd::AnswerReady { peer, n, question, answer } => {
                self.on_answer_ready(peer, n, question, answer)
            }
            InternalCmd::ParkExpired { peer, id } => {
                let expired = self
                    .sessions
                    .get_mut(&peer)
                    .is_some_and(|session| session.expire_parked(id));
                if let Some(n) = self.parked_asks.remove(&(peer.clone(), id)) {
                    if expired {
                        if let Some(session) = self.sessions.get_mut(&peer) {
                            session.asked.fail(
                                &n,
                                Error::ChannelOpenTimeout(
                                    QUESTION_CHANNEL.into(),
                                    CHANNEL_OPEN_TIMEOUT_SECS,
                                ),
                            );
                        }
                    }
                }
            }
        }
    }

    /// 1 s after a session opens: verify the peer unless already validated.
    fn on_verify_peer(&mut self, peer: String) {
        let Some(session) = self.sessions.get(&peer) else {
            return;
        };
        if session.state != SessionState::Open {
            return;
        }
        let bare = extract_name(&peer);
        if self.validated.contains(&bare) {
            return;
        }
        match self.records.key_for(&bare).map(str::to_string) {
            Some(stored) => self.spawn_challenge_flow(peer, stored),
            None => self.spawn_identify_flow(peer),
        }
    }

    /// Challenge path: the peer proves possession of the key we stored.
    fn spawn_challenge_flow(&self, peer: String, stored_key: String) {
        let cmd_tx = self.cmd_tx.clone();
        let crypto = Arc::clone(&self.crypto);
        tokio::spawn(async move {
            let challenge = make_challenge(crypto.as_ref());
            let outcome =
                match ask_via(&cmd_tx, &peer, CHALLENGE_TOPIC, json!(challenge.clone())).await {
                    Ok(answer) => {
                        let signature = answer.as_str().map(string_bytes).unwrap_or_default();
                        match crypto.verify(&stored_key, &string_bytes(&challenge), &signature) {
                            Ok(true) => VerifyOutcome::ChallengePassed,
                            Ok(false) => VerifyOutcome::Failed(
                                Error::SignatureInvalid.to_string(),
                            ),
                            Err(e) => VerifyOutcome::Failed(e.to_string()),
                        }
                    }
                    Err(e) => VerifyOutcome::Failed(e.to_string()),
                };
            let _ = cmd_tx
                .send(Command::Internal(InternalCmd::VerifyOutcome { peer, outcome }))
                .await;
        });
    }

    /// Identify path: the peer presents its key and proves possession; we
    /// adopt the binding on success.
    fn spawn_identify_flow(&self, peer: String) {
        let cmd_tx = self.cmd_tx.clone();
        let crypto = Arc::clone(&self.crypto);
        tokio::spawn(async move {
            let challenge = make_challenge(crypto.as_ref());
            let outcome =
                match ask_via(&cmd_tx, &peer, IDENTIFY_TOPIC, json!(challenge.clone())).await {
                    Ok(answer) => match serde_json::from_value::<IdentifyAnswer>(answer) {
                        Ok(identify) => {
                            let signature = string_bytes(&identify.signature);
                            match crypto.verify(
                                &identify.public_key_string,
                                &string_bytes(&challenge),
                                &signature,
                            ) {
                                Ok(true) => VerifyOutcome::Identified {
                                    key: identify.public_key_string,
                                },
                                Ok(false) => VerifyOutcome::Failed(
                                    Error::SignatureInvalid.to_string(),
                                ),
                                Err(e) => VerifyOutcome::Failed(e.to_string()),
                            }
                        }
                        Err(e) => VerifyOutcome::Failed(format!("malformed identify answer: {e}")),
                    },
                    Err(e) => VerifyOutcome::Failed(e.to_string()),
                };
            let _ = cmd_tx
                .send(Command::Internal(InternalCmd::VerifyOutcome { peer, outcome }))
                .await;
        });
    }

    fn on_verify_outcome(&mut self, peer: String, outcome: VerifyOutcome) {
        let bare = extract_name(&peer);
        match outcome {
            VerifyOutcome::ChallengePassed => {
                self.validated.insert(bare.clone());
                self.info_cache.remove(&bare);
                info!(peer = %peer, "challenge verified");
                self.emit(NodeEvent::Validation {
                    peer,
                    trusted: false,
                });
            }
            VerifyOutcome::Identified { key } => {
                if let Some(stored) = self.records.key_for(&bare) {
                    if !keys_equal(stored, &key) {
                        let error = Error::PublicKeyChanged(bare.clone());
                        warn!(peer = %peer, "{error}");
                        self.fail_validation(peer, error.to_string());
                        return;
                    }
                } else {
                    // Single-owner policy: prior names bound to this key
                    // yield to the name that just proved possession.
                    for prior in self.records.names_for(&key) {
                        if let Err(e) = self.records.remove(&prior) {
                            warn!("rebind cleanup failed: {e}");
                        }
                    }
                    if let Err(e) = self.records.save(&bare, &key) {
                        self.fail_validation(peer, e.to_string());
                        return;
                    }
                }
                self.validated.insert(bare.clone());
                self.peer_keys.insert(bare.clone(), key);
                self.info_cache.remove(&bare);
                info!(peer = %peer, "peer identified and trusted");
                self.emit(NodeEvent::Validation { peer, trusted: true });
            }
            VerifyOutcome::Failed(error) => {
                warn!(peer = %peer, "validation failed: {error}");
                self.fail_validation(peer, error);
            }
        }
    }

    fn fail_validation(&mut self, peer: String, error: String) {
        if let Err(e) = self.untrust(&peer) {
            warn!("untrust failed: {e}");
        }
        self.emit(NodeEvent::ValidationFailure { peer, error });
    }

    fn on_answer_ready(
        &mut self,
        peer: String,
        n: u64,
        question: QuestionBody,
        answer: Value,
    ) {
        let bare = extract_name(&peer);
        if !self.gating_allows(&bare, ANSWER_CHANNEL, Some(&question.topic)) {
            debug!(peer = %peer, topic = %question.topic, "answer withheld from unverified peer");
            return;
        }
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        let frame = AnswerFrame { n, answer, question };
        let bytes = match serde_json::to_vec(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("answer serialization failed: {e}");
                return;
            }
        };
        match session.channel_state(ANSWER_CHANNEL) {
            ChannelState::Open => {
                if let Err(e) = session.transport.send(ANSWER_CHANNEL, &bytes) {
                    debug!(peer = %peer, "answer send failed: {e}");
                }
            }
            ChannelState::Connecting => {
                let (sink, _ignored) = oneshot::channel();
                let id = session.park_send(ANSWER_CHANNEL, bytes, sink);
                self.spawn_internal(
                    Duration::from_secs(CHANNEL_OPEN_TIMEOUT_SECS),
                    InternalCmd::ParkExpired { peer, id },
                );
            }
            _ => debug!(peer = %peer, "answer dropped, channel closed"),
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn spawn_internal(&self, delay: Duration, cmd: InternalCmd) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(Command::Internal(cmd)).await;
        });
    }

    async fn cleanup(&mut self, bus: &mut SignalBus) {
        if self.connected {
            let _ = bus.publish(subtopics::UNLOAD, json!({})).await;
        }
        let keys: Vec<String> = self.sessions.keys().cloned().collect();
        for key in keys {
            if let Some(mut session) = self.sessions.remove(&key) {
                session.close();
            }
        }
        if let Some(mut registry) = self.registry.take() {
            registry.release();
        }
        info!("node shut down");
    }
}

// ── Flow helpers ──────────────────────────────────────────────────────────────

/// Ask a question through the command channel, from a spawned flow task.
async fn ask_via(
    cmd_tx: &mpsc::Sender<Command>,
    peer: &str,
    topic: &str,
    content: Value,
) -> Result<Value, Error> {
    let (reply, rx) = oneshot::channel();
    cmd_tx
        .send(Command::Ask {
            peer: peer.to_string(),
            topic: topic.to_string(),
            content,
            reply,
        })
        .await
        .map_err(|_| Error::Shutdown)?;
    rx.await.map_err(|_| Error::Shutdown)?
}
