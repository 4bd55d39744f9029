// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Peer transport abstraction.
//!
//! `PeerConnection` is the seam between the session layer and the actual
//! peer-to-peer stack: an offer/answer/candidate lifecycle, named data
//! channels, and opaque media tracks. Events flow back through the
//! `mpsc::UnboundedSender<TransportEvent>` supplied at creation, which the
//! engine folds into its single select loop.
//!
//! The crate ships [`memory::MemoryTransportHub`] for tests and in-process
//! demos; a production binding wraps a real WebRTC peer connection.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use rtchat_config::WebrtcConfig;

use crate::error::Error;

/// Offer/answer discriminator carried alongside the SDP blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An opaque session description as produced by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// An opaque ICE candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

/// Transport connection state, after the ICE state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// States that end the session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IceConnectionState::Disconnected
                | IceConnectionState::Failed
                | IceConnectionState::Closed
        )
    }
}

/// Opaque handle to a media stream. Capture and rendering live with the
/// host application; the substrate only moves the handle around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: String,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Events a transport pushes back to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectionState(IceConnectionState),
    IceCandidate(IceCandidate),
    /// A data channel reached the open state (mirrored channels included).
    ChannelOpen { label: String },
    ChannelClosed { label: String },
    ChannelMessage { label: String, data: Vec<u8> },
    /// A remote media track arrived.
    Track { stream: MediaStream },
}

/// One peer connection: offer/answer lifecycle plus label-addressed
/// channels.
#[async_trait]
pub trait PeerConnection: Send + 'static {
    async fn create_offer(&mut self) -> Result<SessionDescription, Error>;
    async fn create_answer(&mut self) -> Result<SessionDescription, Error>;
    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), Error>;
    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), Error>;

    /// Declare a data channel. On the offering side channels are declared
    /// before the offer; the answering side has them mirrored by the
    /// transport and learns about them through [`TransportEvent::ChannelOpen`].
    fn open_channel(&mut self, label: &str) -> Result<(), Error>;

    /// Send a frame on an open channel.
    fn send(&mut self, label: &str, payload: &[u8]) -> Result<(), Error>;

    /// Attach an outbound media track.
    async fn add_track(&mut self, stream: MediaStream) -> Result<(), Error>;

    fn state(&self) -> IceConnectionState;
    fn close(&mut self);
}

/// Creates transports configured from the `webrtc` section.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(
        &self,
        config: &WebrtcConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn PeerConnection>;
}

/// Where the local media stream comes from when a call starts. Capture
/// itself is the host application's business.
pub trait MediaSource: Send + Sync + 'static {
    /// Stream to attach when answering an inbound call. `None` declines
    /// the call.
    fn local_stream(&self) -> Option<MediaStream>;
}

/// Media source with a fixed answer.
pub struct StaticMediaSource(pub Option<MediaStream>);

impl MediaSource for StaticMediaSource {
    fn local_stream(&self) -> Option<MediaStream> {
        self.0.clone()
    }
}
