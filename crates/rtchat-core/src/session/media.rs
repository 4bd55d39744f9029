// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Media sub-session.
//!
//! A call rides on a second peer connection created lazily on the first
//! `call` or inbound `streamoffer`. Its offer/answer and candidates travel
//! over the already-open `streamoffer`/`streamanswer`/`streamice` data
//! channels of the parent session — the broker is never involved. An
//! `endcall` frame tears the sub-session down on both sides.

use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    transport::{IceCandidate, MediaStream, PeerConnection, SessionDescription},
    waiters::OneShot,
};

use super::SessionRole;

/// `streamoffer` / `streamanswer` frame: the media SDP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSignal {
    pub sdp: SessionDescription,
}

/// `streamice` frame: one media ICE candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamIce {
    pub candidate: IceCandidate,
}

pub struct MediaSession {
    pub transport: Box<dyn PeerConnection>,
    pub role: SessionRole,
    pub local_stream: MediaStream,
    /// Resolved with the remote stream when its track arrives.
    pub call_start: Option<OneShot<Result<MediaStream, Error>>>,
    /// Set once the remote's track has arrived.
    pub remote_stream: Option<MediaStream>,
}

impl MediaSession {
    pub fn new(
        transport: Box<dyn PeerConnection>,
        role: SessionRole,
        local_stream: MediaStream,
    ) -> Self {
        Self {
            transport,
            role,
            local_stream,
            call_start: None,
            remote_stream: None,
        }
    }

    /// The remote track arrived: record it and resolve the call-start
    /// future when one is waiting.
    pub fn on_track(&mut self, stream: MediaStream) {
        self.remote_stream = Some(stream.clone());
        if let Some(mut waiter) = self.call_start.take() {
            waiter.resolve(Ok(stream));
        }
    }

    /// Tear down the sub-session, failing a still-pending call start.
    pub fn close(&mut self) {
        if let Some(mut waiter) = self.call_start.take() {
            waiter.resolve(Err(Error::Transport("call ended".into())));
        }
        self.transport.close();
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{memory::MemoryTransportHub, TransportFactory};
    use rtchat_config::WebrtcConfig;
    use tokio::sync::mpsc;

    fn media_session() -> MediaSession {
        let hub = MemoryTransportHub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = hub.create(&WebrtcConfig::default(), tx);
        MediaSession::new(transport, SessionRole::Offerer, MediaStream::new("local"))
    }

    #[tokio::test]
    async fn track_resolves_call_start() {
        let mut media = media_session();
        let (slot, rx) = OneShot::new();
        media.call_start = Some(slot);
        media.on_track(MediaStream::new("remote"));
        let stream = rx.await.unwrap().unwrap();
        assert_eq!(stream.id, "remote");
        assert_eq!(media.remote_stream.as_ref().unwrap().id, "remote");
    }

    #[tokio::test]
    async fn close_fails_pending_call_start() {
        let mut media = media_session();
        let (slot, rx) = OneShot::new();
        media.call_start = Some(slot);
        media.close();
        assert!(rx.await.unwrap().is_err());
    }

    #[test]
    fn stream_signal_round_trips() {
        let frame = StreamSignal {
            sdp: SessionDescription {
                kind: crate::transport::SdpKind::Offer,
                sdp: "blob".into(),
            },
        };
        let text = serde_json::to_string(&frame).unwrap();
        let back: StreamSignal = serde_json::from_str(&text).unwrap();
        assert_eq!(back, frame);
    }
}
