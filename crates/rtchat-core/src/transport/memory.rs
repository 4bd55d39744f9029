// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! In-process peer transport.
//!
//! Endpoints created from the same hub can be linked by exchanging their
//! token "SDP" blobs through any signaling path. Linking opens the offerer's
//! declared channels on both sides, per-channel frame order is the send
//! order, and closing one endpoint surfaces a terminal connection state on
//! the other — enough behavior to exercise every session state machine
//! transition without a network.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use rtchat_config::WebrtcConfig;

use crate::error::Error;

use super::{
    IceCandidate, IceConnectionState, MediaStream, PeerConnection, SessionDescription, SdpKind,
    TransportEvent, TransportFactory,
};

const OFFER_PREFIX: &str = "mem-offer:";
const ANSWER_PREFIX: &str = "mem-answer:";

#[derive(Debug)]
struct Endpoint {
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Channels declared locally before linking.
    declared: Vec<String>,
    /// Channels open for traffic (both sides, once linked).
    open: HashSet<String>,
    /// Tracks added before the link was established.
    queued_tracks: Vec<MediaStream>,
    peer: Option<u64>,
    /// Remote endpoint learned from a received offer, before answering.
    pending_remote: Option<u64>,
    state: IceConnectionState,
}

impl Endpoint {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Debug, Default)]
struct Inner {
    endpoints: HashMap<u64, Endpoint>,
    next_id: u64,
}

/// Process-wide registry of in-memory endpoints. Clones share state; use
/// one hub per simulated network.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransportHub {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTransportHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, events: mpsc::UnboundedSender<TransportEvent>) -> u64 {
        let mut g = self.inner.lock().unwrap();
        g.next_id += 1;
        let id = g.next_id;
        g.endpoints.insert(
            id,
            Endpoint {
                events,
                declared: Vec::new(),
                open: HashSet::new(),
                queued_tracks: Vec::new(),
                peer: None,
                pending_remote: None,
                state: IceConnectionState::New,
            },
        );
        id
    }

    /// Wire two endpoints together: open the union of declared channels on
    /// both sides, flush queued tracks, and report the connected state.
    fn link(&self, a: u64, b: u64) -> Result<(), Error> {
        let mut g = self.inner.lock().unwrap();
        if !g.endpoints.contains_key(&a) || !g.endpoints.contains_key(&b) {
            return Err(Error::Transport("linking a closed endpoint".into()));
        }
        let mut labels: Vec<String> = Vec::new();
        for id in [a, b] {
            let ep = g.endpoints.get(&id).unwrap();
            for label in &ep.declared {
                if !labels.contains(label) {
                    labels.push(label.clone());
                }
            }
        }

        for (this, other) in [(a, b), (b, a)] {
            let ep = g.endpoints.get_mut(&this).unwrap();
            ep.peer = Some(other);
            ep.pending_remote = None;
            ep.state = IceConnectionState::Connected;
            ep.open.extend(labels.iter().cloned());
            ep.emit(TransportEvent::ConnectionState(IceConnectionState::Checking));
            ep.emit(TransportEvent::ConnectionState(
                IceConnectionState::Connected,
            ));
            for label in &labels {
                ep.emit(TransportEvent::ChannelOpen {
                    label: label.clone(),
                });
            }
        }

        // Tracks queued before the link flow to the remote side now.
        for (this, other) in [(a, b), (b, a)] {
            let queued =
                std::mem::take(&mut g.endpoints.get_mut(&this).unwrap().queued_tracks);
            let remote = g.endpoints.get(&other).unwrap();
            for stream in queued {
                remote.emit(TransportEvent::Track { stream });
            }
        }
        Ok(())
    }

    fn deliver(&self, from: u64, label: &str, payload: &[u8]) -> Result<(), Error> {
        let g = self.inner.lock().unwrap();
        let ep = g
            .endpoints
            .get(&from)
            .ok_or_else(|| Error::Transport("endpoint closed".into()))?;
        if !ep.open.contains(label) {
            return Err(Error::ChannelClosed(label.to_string()));
        }
        let peer = ep
            .peer
            .and_then(|p| g.endpoints.get(&p))
            .ok_or_else(|| Error::Transport("not linked".into()))?;
        peer.emit(TransportEvent::ChannelMessage {
            label: label.to_string(),
            data: payload.to_vec(),
        });
        Ok(())
    }

    fn close(&self, id: u64) {
        let mut g = self.inner.lock().unwrap();
        let Some(ep) = g.endpoints.remove(&id) else {
            return;
        };
        ep.emit(TransportEvent::ConnectionState(IceConnectionState::Closed));
        if let Some(peer) = ep.peer.and_then(|p| g.endpoints.get_mut(&p)) {
            peer.peer = None;
            peer.state = IceConnectionState::Disconnected;
            peer.emit(TransportEvent::ConnectionState(
                IceConnectionState::Disconnected,
            ));
        }
    }
}

impl TransportFactory for MemoryTransportHub {
    fn create(
        &self,
        _config: &WebrtcConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn PeerConnection> {
        let id = self.register(events);
        Box::new(MemoryPeerConnection {
            hub: self.clone(),
            id,
            closed: false,
        })
    }
}

/// One endpoint's handle. Created through [`MemoryTransportHub`].
pub struct MemoryPeerConnection {
    hub: MemoryTransportHub,
    id: u64,
    closed: bool,
}

fn parse_token(prefix: &str, sdp: &str) -> Result<u64, Error> {
    sdp.strip_prefix(prefix)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| Error::Transport(format!("unintelligible SDP {sdp:?}")))
}

#[async_trait]
impl PeerConnection for MemoryPeerConnection {
    async fn create_offer(&mut self) -> Result<SessionDescription, Error> {
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("{OFFER_PREFIX}{}", self.id),
        })
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, Error> {
        let g = self.hub.inner.lock().unwrap();
        let ep = g
            .endpoints
            .get(&self.id)
            .ok_or_else(|| Error::Transport("endpoint closed".into()))?;
        if ep.pending_remote.is_none() {
            return Err(Error::Transport("answer without a remote offer".into()));
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("{ANSWER_PREFIX}{}", self.id),
        })
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), Error> {
        match desc.kind {
            SdpKind::Offer => {
                let remote = parse_token(OFFER_PREFIX, &desc.sdp)?;
                let mut g = self.hub.inner.lock().unwrap();
                let ep = g
                    .endpoints
                    .get_mut(&self.id)
                    .ok_or_else(|| Error::Transport("endpoint closed".into()))?;
                ep.pending_remote = Some(remote);
                Ok(())
            }
            SdpKind::Answer => {
                // The offerer applies the answer; that completes the pair.
                let remote = parse_token(ANSWER_PREFIX, &desc.sdp)?;
                self.hub.link(self.id, remote)
            }
        }
    }

    async fn add_ice_candidate(&mut self, _candidate: IceCandidate) -> Result<(), Error> {
        // Candidates carry no information in-process; accepting them keeps
        // the signaling path honest.
        Ok(())
    }

    fn open_channel(&mut self, label: &str) -> Result<(), Error> {
        let mut g = self.hub.inner.lock().unwrap();
        let ep = g
            .endpoints
            .get_mut(&self.id)
            .ok_or_else(|| Error::Transport("endpoint closed".into()))?;
        let label = label.to_string();
        if !ep.declared.contains(&label) {
            ep.declared.push(label);
        }
        Ok(())
    }

    fn send(&mut self, label: &str, payload: &[u8]) -> Result<(), Error> {
        self.hub.deliver(self.id, label, payload)
    }

    async fn add_track(&mut self, stream: MediaStream) -> Result<(), Error> {
        let mut g = self.hub.inner.lock().unwrap();
        let peer_id = {
            let ep = g
                .endpoints
                .get_mut(&self.id)
                .ok_or_else(|| Error::Transport("endpoint closed".into()))?;
            match ep.peer {
                Some(p) => Some(p),
                None => {
                    ep.queued_tracks.push(stream.clone());
                    None
                }
            }
        };
        if let Some(peer) = peer_id.and_then(|p| g.endpoints.get(&p)) {
            peer.emit(TransportEvent::Track { stream });
        }
        Ok(())
    }

    fn state(&self) -> IceConnectionState {
        self.hub
            .inner
            .lock()
            .unwrap()
            .endpoints
            .get(&self.id)
            .map(|ep| ep.state)
            .unwrap_or(IceConnectionState::Closed)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.hub.close(self.id);
        }
    }
}

impl Drop for MemoryPeerConnection {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(
        hub: &MemoryTransportHub,
    ) -> (
        Box<dyn PeerConnection>,
        mpsc::UnboundedReceiver<TransportEvent>,
        Box<dyn PeerConnection>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let cfg = WebrtcConfig::default();
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (hub.create(&cfg, tx_a), rx_a, hub.create(&cfg, tx_b), rx_b)
    }

    async fn link(
        a: &mut Box<dyn PeerConnection>,
        b: &mut Box<dyn PeerConnection>,
    ) {
        let offer = a.create_offer().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(answer).await.unwrap();
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn offer_answer_opens_declared_channels_on_both_sides() {
        let hub = MemoryTransportHub::new();
        let (mut a, mut rx_a, mut b, mut rx_b) = pair(&hub);
        a.open_channel("chat").unwrap();
        a.open_channel("question").unwrap();
        link(&mut a, &mut b).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let events = drain(rx);
            let opened: Vec<&str> = events
                .iter()
                .filter_map(|e| match e {
                    TransportEvent::ChannelOpen { label } => Some(label.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(opened, vec!["chat", "question"]);
            assert!(events.iter().any(|e| matches!(
                e,
                TransportEvent::ConnectionState(IceConnectionState::Connected)
            )));
        }
        assert_eq!(a.state(), IceConnectionState::Connected);
        assert_eq!(b.state(), IceConnectionState::Connected);
    }

    #[tokio::test]
    async fn frames_arrive_in_send_order() {
        let hub = MemoryTransportHub::new();
        let (mut a, _rx_a, mut b, mut rx_b) = pair(&hub);
        a.open_channel("chat").unwrap();
        link(&mut a, &mut b).await;
        drain(&mut rx_b);

        for i in 0..5u8 {
            a.send("chat", &[i]).unwrap();
        }
        let frames: Vec<Vec<u8>> = drain(&mut rx_b)
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::ChannelMessage { data, .. } => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
    }

    #[tokio::test]
    async fn send_on_undeclared_channel_fails() {
        let hub = MemoryTransportHub::new();
        let (mut a, _rx_a, mut b, _rx_b) = pair(&hub);
        a.open_channel("chat").unwrap();
        link(&mut a, &mut b).await;
        assert!(matches!(
            a.send("nosuch", b"x"),
            Err(Error::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn close_surfaces_terminal_state_on_peer() {
        let hub = MemoryTransportHub::new();
        let (mut a, _rx_a, mut b, mut rx_b) = pair(&hub);
        a.open_channel("chat").unwrap();
        link(&mut a, &mut b).await;
        drain(&mut rx_b);

        a.close();
        let events = drain(&mut rx_b);
        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::ConnectionState(IceConnectionState::Disconnected)
        )));
        assert!(matches!(
            b.send("chat", b"x"),
            Err(Error::Transport(_)),
        ));
    }

    #[tokio::test]
    async fn tracks_queued_before_link_flush_to_peer() {
        let hub = MemoryTransportHub::new();
        let (mut a, _rx_a, mut b, mut rx_b) = pair(&hub);
        a.add_track(MediaStream::new("cam")).await.unwrap();
        link(&mut a, &mut b).await;
        let events = drain(&mut rx_b);
        assert!(events
            .iter()
            .any(|e| matches!(e, TransportEvent::Track { stream } if stream.id == "cam")));
    }

    #[tokio::test]
    async fn answer_without_offer_is_an_error() {
        let hub = MemoryTransportHub::new();
        let (_a, _rx_a, mut b, _rx_b) = pair(&hub);
        assert!(b.create_answer().await.is_err());
    }
}
