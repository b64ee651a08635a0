use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceConfig;
use crate::connection::SignalingRole;
use crate::error::{NegotiationError, PeerError};
use crate::media::{LocalTrack, TrackKind};
use crate::peer::{
    IceCandidate, PeerConnection, PeerConnector, PeerEventKind, PeerEventSink, RemoteTrack, SignalPayload,
    TransportCounters,
};

/// Builds `RtcPeer`s sharing one media engine and ICE configuration.
pub struct RtcConnector {
    api: API,
    config: RTCConfiguration,
}

impl RtcConnector {
    pub fn new(ice: &IceConfig) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Default::default(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice
            .stun_urls
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(ice.turn.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        Ok(Self {
            api,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        peer_id: &str,
        role: SignalingRole,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        info!(peer_id, %role, "peer connection created");
        RtcPeer::wire_handlers(&peer_connection, events);
        Ok(Arc::new(RtcPeer {
            peer_id: peer_id.to_string(),
            peer_connection,
            senders: Mutex::new(HashMap::new()),
            pending_candidates: Mutex::new(Vec::new()),
        }))
    }
}

pub struct RtcPeer {
    peer_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
    /// Candidates that arrived before the remote description.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

fn track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

fn invalid(err: webrtc::Error) -> PeerError {
    NegotiationError::InvalidDescription(err.to_string()).into()
}

impl RtcPeer {
    fn wire_handlers(peer_connection: &Arc<RTCPeerConnection>, events: PeerEventSink) {
        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(PeerEventKind::Signal(SignalPayload::Candidate {
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            },
                        }));
                    }
                    Err(e) => warn!(peer_id = sink.peer_id(), error = %e, "unserializable ice candidate"),
                }
            })
        }));

        let sink = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let Some(kind) = track_kind(track.kind()) else {
                        return;
                    };
                    sink.emit(PeerEventKind::RemoteTrack(RemoteTrack {
                        id: track.id(),
                        kind,
                        stream_id: track.stream_id(),
                    }));
                    // Rendering is external; keep the receiver drained.
                    tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
                })
            },
        ));

        let sink = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                debug!(peer_id = sink.peer_id(), %state, "peer connection state changed");
                if state == RTCPeerConnectionState::Failed {
                    sink.emit(PeerEventKind::Failed("peer connection failed".into()));
                }
            })
        }));

        let sink = events;
        let weak = Arc::downgrade(peer_connection);
        peer_connection.on_negotiation_needed(Box::new(move || {
            let sink = sink.clone();
            let weak = weak.clone();
            Box::pin(async move {
                let Some(pc) = weak.upgrade() else {
                    return;
                };
                // The first exchange is driven explicitly.
                if pc.remote_description().await.is_some() {
                    sink.emit(PeerEventKind::NegotiationNeeded);
                }
            })
        }));
    }

    /// Adds receive-only transceivers for kinds we do not send, so the
    /// offer still asks for the remote side's media.
    async fn ensure_receivers(&self) -> Result<(), PeerError> {
        let transceivers = self.peer_connection.get_transceivers().await;
        for kind in [TrackKind::Audio, TrackKind::Video] {
            let codec = codec_type(kind);
            if transceivers.iter().any(|t| t.kind() == codec) {
                continue;
            }
            self.peer_connection
                .add_transceiver_from_kind(
                    codec,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }
        Ok(())
    }

    async fn flush_candidates(&self) -> Result<(), PeerError> {
        let pending: Vec<_> = self.pending_candidates.lock().await.drain(..).collect();
        for candidate in pending {
            self.peer_connection.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<SignalPayload, PeerError> {
        self.ensure_receivers().await?;
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        Ok(SignalPayload::Offer { sdp: offer.sdp })
    }

    async fn apply_signal(&self, payload: SignalPayload) -> Result<Option<SignalPayload>, PeerError> {
        match payload {
            SignalPayload::Offer { sdp } => {
                let offer = RTCSessionDescription::offer(sdp).map_err(invalid)?;
                self.peer_connection
                    .set_remote_description(offer)
                    .await
                    .map_err(invalid)?;
                self.flush_candidates().await?;

                let answer = self.peer_connection.create_answer(None).await?;
                self.peer_connection
                    .set_local_description(answer.clone())
                    .await?;
                Ok(Some(SignalPayload::Answer { sdp: answer.sdp }))
            }
            SignalPayload::Answer { sdp } => {
                let answer = RTCSessionDescription::answer(sdp).map_err(invalid)?;
                self.peer_connection
                    .set_remote_description(answer)
                    .await
                    .map_err(invalid)?;
                self.flush_candidates().await?;
                Ok(None)
            }
            SignalPayload::Candidate { candidate } => {
                let init = RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    username_fragment: candidate.username_fragment,
                };
                if self.peer_connection.remote_description().await.is_none() {
                    self.pending_candidates.lock().await.push(init);
                } else {
                    self.peer_connection.add_ice_candidate(init).await?;
                }
                Ok(None)
            }
            SignalPayload::Renegotiate => Err(NegotiationError::UnexpectedState(
                "renegotiation request reached the transport".into(),
            )
            .into()),
        }
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let mut senders = self.senders.lock().await;
        let local: Arc<dyn TrackLocal + Send + Sync> = track.sample_track();
        if let Some(sender) = senders.get(&track.kind()) {
            sender.replace_track(Some(local)).await?;
            return Ok(());
        }

        let sender = self.peer_connection.add_track(local).await?;
        // Read incoming RTCP so interceptors (NACK, reports) keep working.
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });
        senders.insert(track.kind(), sender);
        debug!(peer_id = %self.peer_id, kind = %track.kind(), track_id = %track.id(), "sender added");
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let senders = self.senders.lock().await;
        let sender = senders
            .get(&track.kind())
            .ok_or_else(|| PeerError::Backend(format!("no {} sender to replace", track.kind())))?;
        let local: Arc<dyn TrackLocal + Send + Sync> = track.sample_track();
        sender.replace_track(Some(local)).await?;
        Ok(())
    }

    async fn remove_track(&self, kind: TrackKind) -> Result<(), PeerError> {
        let Some(sender) = self.senders.lock().await.remove(&kind) else {
            return Ok(());
        };
        self.peer_connection.remove_track(&sender).await?;
        debug!(peer_id = %self.peer_id, %kind, "sender removed");
        Ok(())
    }

    async fn has_sender(&self, kind: TrackKind) -> bool {
        self.senders.lock().await.contains_key(&kind)
    }

    async fn stats(&self) -> Result<TransportCounters, PeerError> {
        let report = self.peer_connection.get_stats().await;
        let mut counters = TransportCounters {
            video_bytes_sent: 0,
            video_bytes_received: 0,
            at: Instant::now(),
        };
        for stats in report.reports.values() {
            match stats {
                StatsReportType::OutboundRTP(outbound) if outbound.kind == "video" => {
                    counters.video_bytes_sent += outbound.bytes_sent;
                }
                StatsReportType::InboundRTP(inbound) if inbound.kind == "video" => {
                    counters.video_bytes_received += inbound.bytes_received;
                }
                _ => {}
            }
        }
        Ok(counters)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.senders.lock().await.clear();
        self.pending_candidates.lock().await.clear();
        self.peer_connection.close().await?;
        info!(peer_id = %self.peer_id, "peer connection closed");
        Ok(())
    }
}
