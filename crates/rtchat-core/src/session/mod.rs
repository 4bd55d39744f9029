// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-peer session state.
//!
//! A session owns one peer transport, the named data channels multiplexed
//! over it, the question correlation table, and (once a call starts) the
//! media sub-session. The rendezvous engine drives it: transport events and
//! timer expiries arrive as method calls, and everything pending dies with
//! the session.

pub mod media;

use std::collections::HashMap;

use tracing::debug;

use crate::{
    error::Error,
    transport::PeerConnection,
    waiters::CorrelationTable,
};

use media::MediaSession;

/// The four fixed media-control channels, opened alongside the application
/// channels on every session.
pub const MEDIA_CONTROL_LABELS: [&str; 4] =
    ["streamoffer", "streamanswer", "streamice", "endcall"];

/// How long a send may wait for its channel to open.
pub const CHANNEL_OPEN_TIMEOUT_SECS: u64 = 10;

/// Which side of the offer/answer exchange this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Offering,
    Answering,
    Negotiating,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A named channel and its declared coding.
#[derive(Debug, Clone)]
pub struct Channel {
    pub label: String,
    pub state: ChannelState,
    /// Raw channels bypass JSON coding.
    pub raw: bool,
}

/// A channel declared by the application, with its coding.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub label: String,
    pub raw: bool,
}

impl ChannelSpec {
    pub fn json(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            raw: false,
        }
    }

    pub fn raw(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            raw: true,
        }
    }
}

/// A send parked behind a channel that has not opened yet.
#[derive(Debug)]
pub struct ParkedSend {
    pub id: u64,
    pub label: String,
    pub payload: Vec<u8>,
    pub reply: tokio::sync::oneshot::Sender<Result<(), Error>>,
}

pub struct Session {
    /// Remote display name, slot decoration included. Unique per session.
    pub remote: String,
    pub role: SessionRole,
    pub state: SessionState,
    pub transport: Box<dyn PeerConnection>,
    pub channels: HashMap<String, Channel>,
    /// Labels whose open events the load barrier waits for.
    expected: Vec<String>,
    /// Sends waiting for their channel, in arrival order.
    pub parked: Vec<ParkedSend>,
    next_parked_id: u64,
    /// Outstanding questions: `n → answer`.
    pub asked: CorrelationTable<u64, serde_json::Value>,
    question_counter: u64,
    /// Outstanding pings: sent-timestamp → latency ms.
    pub pings: CorrelationTable<i64, i64>,
    pub media: Option<MediaSession>,
    /// Whether `connectedtopeer` has fired for this session.
    pub announced: bool,
}

impl Session {
    /// Build a session around `transport`. The offerer declares every
    /// channel up front; the answerer has them mirrored by the transport.
    pub fn new(
        remote: impl Into<String>,
        role: SessionRole,
        mut transport: Box<dyn PeerConnection>,
        specs: &[ChannelSpec],
    ) -> Result<Self, Error> {
        let mut channels = HashMap::new();
        let mut expected = Vec::new();
        let all_specs = specs
            .iter()
            .cloned()
            .chain(MEDIA_CONTROL_LABELS.iter().map(|l| ChannelSpec::json(*l)));
        for spec in all_specs {
            if role == SessionRole::Offerer {
                transport.open_channel(&spec.label)?;
            }
            expected.push(spec.label.clone());
            channels.insert(
                spec.label.clone(),
                Channel {
                    label: spec.label,
                    state: ChannelState::Connecting,
                    raw: spec.raw,
                },
            );
        }
        Ok(Self {
            remote: remote.into(),
            role,
            state: match role {
                SessionRole::Offerer => SessionState::Idle,
                SessionRole::Answerer => SessionState::Answering,
            },
            transport,
            channels,
            expected,
            parked: Vec::new(),
            next_parked_id: 0,
            asked: CorrelationTable::new(),
            question_counter: 0,
            pings: CorrelationTable::new(),
            media: None,
            announced: false,
        })
    }

    /// Next question id, unique for this session's lifetime.
    pub fn next_question_id(&mut self) -> u64 {
        self.question_counter += 1;
        self.question_counter
    }

    pub fn channel_state(&self, label: &str) -> ChannelState {
        self.channels
            .get(label)
            .map(|c| c.state)
            .unwrap_or(ChannelState::Closed)
    }

    pub fn channel_is_raw(&self, label: &str) -> bool {
        self.channels.get(label).is_some_and(|c| c.raw)
    }

    /// All expected channels are open.
    pub fn barrier_ready(&self) -> bool {
        self.expected
            .iter()
            .all(|label| self.channel_state(label) == ChannelState::Open)
    }

    /// Record a channel-open event. Returns true when this event completed
    /// the load barrier.
    pub fn on_channel_open(&mut self, label: &str) -> bool {
        let was_ready = self.barrier_ready();
        match self.channels.get_mut(label) {
            Some(channel) => channel.state = ChannelState::Open,
            None => {
                // Mirrored channel we did not declare (answerer side of a
                // peer with extra channels). Track it, but the barrier only
                // covers declared labels.
                self.channels.insert(
                    label.to_string(),
                    Channel {
                        label: label.to_string(),
                        state: ChannelState::Open,
                        raw: false,
                    },
                );
            }
        }
        !was_ready && self.barrier_ready()
    }

    pub fn on_channel_closed(&mut self, label: &str) {
        if let Some(channel) = self.channels.get_mut(label) {
            channel.state = ChannelState::Closed;
        }
    }

    /// Park a send behind `label`'s open event. Returns the parked id the
    /// expiry timer refers to.
    pub fn park_send(
        &mut self,
        label: &str,
        payload: Vec<u8>,
        reply: tokio::sync::oneshot::Sender<Result<(), Error>>,
    ) -> u64 {
        self.next_parked_id += 1;
        let id = self.next_parked_id;
        debug!(remote = %self.remote, label, id, "parking send until channel opens");
        self.parked.push(ParkedSend {
            id,
            label: label.to_string(),
            payload,
            reply,
        });
        id
    }

    /// Flush parked sends for a label that just opened, in arrival order.
    pub fn flush_parked(&mut self, label: &str) {
        let mut remaining = Vec::new();
        for parked in self.parked.drain(..) {
            if parked.label == label {
                let outcome = self.transport.send(&parked.label, &parked.payload);
                let _ = parked.reply.send(outcome);
            } else {
                remaining.push(parked);
            }
        }
        self.parked = remaining;
    }

    /// Expire one parked send by id; the waiting caller gets
    /// [`Error::ChannelOpenTimeout`]. Returns false when the send already
    /// flushed or failed.
    pub fn expire_parked(&mut self, id: u64) -> bool {
        let Some(pos) = self.parked.iter().position(|p| p.id == id) else {
            return false;
        };
        let parked = self.parked.remove(pos);
        let _ = parked.reply.send(Err(Error::ChannelOpenTimeout(
            parked.label,
            CHANNEL_OPEN_TIMEOUT_SECS,
        )));
        true
    }

    /// Tear the session down: cancel everything pending, close the media
    /// sub-session and the transport, and enter `Closed`.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        debug!(remote = %self.remote, "closing session");
        self.state = SessionState::Closed;
        for channel in self.channels.values_mut() {
            channel.state = ChannelState::Closed;
        }
        for parked in self.parked.drain(..) {
            let _ = parked
                .reply
                .send(Err(Error::ChannelClosed(parked.label.clone())));
        }
        self.asked
            .fail_all(|| Error::ChannelClosed(crate::ask::QUESTION_CHANNEL.into()));
        self.pings
            .fail_all(|| Error::ChannelClosed(crate::ask::PING_CHANNEL.into()));
        if let Some(mut media) = self.media.take() {
            media.close();
        }
        self.transport.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{memory::MemoryTransportHub, TransportFactory};
    use rtchat_config::WebrtcConfig;
    use tokio::sync::{mpsc, oneshot};

    fn specs() -> Vec<ChannelSpec> {
        vec![ChannelSpec::json("chat"), ChannelSpec::json("question")]
    }

    fn offerer_session() -> Session {
        let hub = MemoryTransportHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = hub.create(&WebrtcConfig::default(), tx);
        Session::new("bob", SessionRole::Offerer, transport, &specs()).unwrap()
    }

    #[test]
    fn new_session_expects_app_and_media_channels() {
        let s = offerer_session();
        assert_eq!(s.channels.len(), 2 + MEDIA_CONTROL_LABELS.len());
        assert_eq!(s.channel_state("chat"), ChannelState::Connecting);
        assert_eq!(s.channel_state("streamice"), ChannelState::Connecting);
        assert!(!s.barrier_ready());
    }

    #[test]
    fn barrier_resolves_when_all_expected_open() {
        let mut s = offerer_session();
        let mut completed = false;
        let mut labels: Vec<String> = s.channels.keys().cloned().collect();
        labels.sort();
        for label in &labels {
            completed = s.on_channel_open(label);
        }
        assert!(completed, "last open event must complete the barrier");
        assert!(s.barrier_ready());
        // A surprise extra channel must not re-trigger.
        assert!(!s.on_channel_open("extra"));
    }

    #[test]
    fn question_ids_are_monotonic() {
        let mut s = offerer_session();
        assert_eq!(s.next_question_id(), 1);
        assert_eq!(s.next_question_id(), 2);
        assert_eq!(s.next_question_id(), 3);
    }

    #[tokio::test]
    async fn expired_park_fails_with_timeout() {
        let mut s = offerer_session();
        let (tx, rx) = oneshot::channel();
        let id = s.park_send("chat", b"hello".to_vec(), tx);
        s.expire_parked(id);
        assert!(matches!(
            rx.await.unwrap(),
            Err(Error::ChannelOpenTimeout(label, _)) if label == "chat"
        ));
    }

    #[tokio::test]
    async fn close_cancels_everything_pending() {
        let mut s = offerer_session();
        let (tx, parked_rx) = oneshot::channel();
        s.park_send("chat", b"hello".to_vec(), tx);
        let ask_rx = s.asked.register(1);
        s.close();

        assert!(matches!(
            parked_rx.await.unwrap(),
            Err(Error::ChannelClosed(_))
        ));
        assert!(matches!(
            ask_rx.await.unwrap(),
            Err(Error::ChannelClosed(_))
        ));
        assert_eq!(s.state, SessionState::Closed);
        assert_eq!(s.channel_state("chat"), ChannelState::Closed);
    }
}
