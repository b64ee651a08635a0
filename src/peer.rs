//! Capability interface every peer connection backend exposes to the
//! orchestrator: signaling input/output, track senders, statistics.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::connection::SignalingRole;
use crate::error::PeerError;
use crate::media::{LocalTrack, TrackKind};
use crate::orchestrator::Input;

/// One signaling message for a single pair. Opaque to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
    /// Sent by a responder asking the initiator for a fresh offer.
    Renegotiate,
}

impl SignalPayload {
    pub fn label(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate { .. } => "candidate",
            SignalPayload::Renegotiate => "renegotiate",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// Cumulative video byte counters read from the transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportCounters {
    pub video_bytes_sent: u64,
    pub video_bytes_received: u64,
    pub at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    /// Trickled ICE candidate to relay to the remote side.
    Signal(SignalPayload),
    /// Media from the remote side started flowing.
    RemoteTrack(RemoteTrack),
    NegotiationNeeded,
    /// The transport gave up; the link must be closed.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub peer_id: String,
    /// Identifies the link instance; events from a replaced link are stale.
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// Handed to a backend at creation; stamps every event with its link.
#[derive(Clone)]
pub struct PeerEventSink {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<Input>,
}

impl PeerEventSink {
    pub fn new(peer_id: impl Into<String>, generation: u64, tx: mpsc::UnboundedSender<Input>) -> Self {
        Self {
            peer_id: peer_id.into(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Returns false once the orchestrator is gone.
    pub fn emit(&self, kind: PeerEventKind) -> bool {
        self.tx
            .send(Input::Peer(PeerEvent {
                peer_id: self.peer_id.clone(),
                generation: self.generation,
                kind,
            }))
            .is_ok()
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Creates and applies a local offer. Only initiators call this.
    async fn create_offer(&self) -> Result<SignalPayload, PeerError>;

    /// Applies an inbound offer, answer or candidate. An offer yields the
    /// answer to send back.
    async fn apply_signal(&self, payload: SignalPayload) -> Result<Option<SignalPayload>, PeerError>;

    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Swaps the track on the existing sender of the same kind.
    async fn replace_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Detaches and drops the sender of `kind`, if any.
    async fn remove_track(&self, kind: TrackKind) -> Result<(), PeerError>;

    /// Whether an outgoing sender of `kind` currently carries a track.
    async fn has_sender(&self, kind: TrackKind) -> bool;

    async fn stats(&self) -> Result<TransportCounters, PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        peer_id: &str,
        role: SignalingRole,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_wire_shape() {
        let offer = SignalPayload::Offer { sdp: "v=0".into() };
        assert_eq!(
            serde_json::to_value(&offer).unwrap(),
            serde_json::json!({"type": "offer", "sdp": "v=0"})
        );

        let candidate: SignalPayload = serde_json::from_value(serde_json::json!({
            "type": "candidate",
            "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
        }))
        .unwrap();
        match candidate {
            SignalPayload::Candidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert!(candidate.username_fragment.is_none());
            }
            other => panic!("unexpected payload {:?}", other),
        }

        assert_eq!(
            serde_json::to_string(&SignalPayload::Renegotiate).unwrap(),
            r#"{"type":"renegotiate"}"#
        );
    }

    #[test]
    fn sink_stamps_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = PeerEventSink::new("p1", 7, tx);
        assert!(sink.emit(PeerEventKind::NegotiationNeeded));
        match rx.try_recv().unwrap() {
            Input::Peer(event) => {
                assert_eq!(event.peer_id, "p1");
                assert_eq!(event.generation, 7);
                assert_eq!(event.kind, PeerEventKind::NegotiationNeeded);
            }
            _ => panic!("expected a peer event"),
        }
        drop(rx);
        assert!(!sink.emit(PeerEventKind::NegotiationNeeded));
    }
}
