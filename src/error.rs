use thiserror::Error;

use crate::media::TrackKind;

/// Capture device could not produce a track.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("{0} capture permission denied")]
    PermissionDenied(TrackKind),
    #[error("no {0} capture device available")]
    NoDevice(TrackKind),
    #[error("device error: {0}")]
    Device(String),
}

/// The relay could not be reached or refused the request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingDeliveryError {
    #[error("failed to connect to relay: {0}")]
    Connect(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("failed to encode signaling message: {0}")]
    Encode(String),
    #[error("relay rejected request: {0}")]
    Relay(String),
}

/// Offer/answer/candidate exchange went wrong for one peer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("unexpected signaling state: {0}")]
    UnexpectedState(String),
    #[error("handshake did not complete within {0} seconds")]
    Timeout(u64),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// A single peer rejected a track change.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("peer {peer_id} rejected {kind} track change: {reason}")]
pub struct TrackApplyError {
    pub peer_id: String,
    pub kind: TrackKind,
    pub reason: String,
}

/// Failure reported by a peer connection backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("peer connection backend: {0}")]
    Backend(String),
    #[error("peer connection closed")]
    Closed,
}

impl From<webrtc::Error> for PeerError {
    fn from(err: webrtc::Error) -> Self {
        PeerError::Backend(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    MediaAccess(#[from] MediaAccessError),
    #[error(transparent)]
    Signaling(#[from] SignalingDeliveryError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    TrackApply(#[from] TrackApplyError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("a {0} toggle is already in progress")]
    ToggleInProgress(TrackKind),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("client stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;
