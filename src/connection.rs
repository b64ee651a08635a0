use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::media::MediaStatus;
use crate::peer::{PeerConnection, RemoteTrack};
use crate::room::RoomPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    SignalingInProgress,
    /// Remote media has been observed.
    Connected,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Idle => write!(f, "Idle"),
            LinkState::SignalingInProgress => write!(f, "SignalingInProgress"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingRole {
    /// Creates every offer for the pair.
    Initiator,
    Responder,
}

impl fmt::Display for SignalingRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingRole::Initiator => write!(f, "initiator"),
            SignalingRole::Responder => write!(f, "responder"),
        }
    }
}

/// The orchestrator's record of one remote participant's connection.
pub struct PeerLink {
    pub peer_id: String,
    pub connection: Arc<dyn PeerConnection>,
    pub role: SignalingRole,
    pub generation: u64,
    state: LinkState,
    signaling_since: Instant,
    sdp_complete: bool,
    offer_outstanding: bool,
    renegotiation_pending: bool,
    remote_tracks: Vec<RemoteTrack>,
}

impl PeerLink {
    pub fn new(
        peer_id: impl Into<String>,
        connection: Arc<dyn PeerConnection>,
        role: SignalingRole,
        generation: u64,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            connection,
            role,
            generation,
            state: LinkState::Idle,
            signaling_since: Instant::now(),
            sdp_complete: false,
            offer_outstanding: false,
            renegotiation_pending: false,
            remote_tracks: Vec::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state != LinkState::Closed
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn begin_signaling(&mut self, now: Instant) {
        if self.state == LinkState::Idle {
            self.state = LinkState::SignalingInProgress;
            self.signaling_since = now;
        }
    }

    /// True while an offer/answer exchange is unfinished.
    pub fn negotiating(&self) -> bool {
        !self.sdp_complete || self.offer_outstanding
    }

    pub fn offer_sent(&mut self) {
        self.offer_outstanding = true;
    }

    pub fn defer_renegotiation(&mut self) {
        self.renegotiation_pending = true;
    }

    /// Ends the current exchange. Returns whether a renegotiation was
    /// deferred while it ran.
    pub fn complete_sdp(&mut self) -> bool {
        self.sdp_complete = true;
        self.offer_outstanding = false;
        std::mem::take(&mut self.renegotiation_pending)
    }

    /// Records remote media; returns true on the transition to `Connected`.
    pub fn remote_track_arrived(&mut self, track: RemoteTrack) -> bool {
        if self.state == LinkState::Closed {
            return false;
        }
        if !self.remote_tracks.iter().any(|t| t.id == track.id) {
            self.remote_tracks.push(track);
        }
        let first = self.state != LinkState::Connected;
        self.state = LinkState::Connected;
        first
    }

    /// True while the offer/answer exchange is still open after `timeout`.
    pub fn handshake_stalled(&self, now: Instant, timeout: Duration) -> bool {
        self.state == LinkState::SignalingInProgress
            && !self.sdp_complete
            && now.saturating_duration_since(self.signaling_since) >= timeout
    }

    pub fn mark_closed(&mut self) {
        self.state = LinkState::Closed;
        self.remote_tracks.clear();
    }
}

/// Snapshot of the client as seen by a presentation layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub local_id: Option<String>,
    pub room_id: Option<String>,
    pub phase: RoomPhase,
    pub peers: BTreeMap<String, LinkState>,
    pub media: MediaStatus,
}

#[derive(Clone)]
pub struct SessionMonitor {
    status: Arc<watch::Sender<SessionStatus>>,
    receiver: watch::Receiver<SessionStatus>,
}

impl Default for SessionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(SessionStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    /// Publishes `next` only if it differs from the current snapshot.
    pub fn publish(&self, next: SessionStatus) {
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    pub fn current(&self) -> SessionStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.receiver.clone()
    }
}
