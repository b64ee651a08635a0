//! Room membership and per-peer connection orchestration.
//!
//! `PeerOrchestrator` is owned by a single task (see `client`) and mutated
//! one `Input` at a time. Slow work (capture, stats) runs in spawned tasks
//! whose results come back as `Input`s and are re-validated on arrival.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::Command;
use crate::config::ClientConfig;
use crate::connection::{LinkState, PeerLink, SessionMonitor, SessionStatus, SignalingRole};
use crate::error::{
    Error, MediaAccessError, NegotiationError, PeerError, Result, SignalingDeliveryError, TrackApplyError,
};
use crate::media::{
    LocalMediaManager, LocalTrack, MediaDevices, MediaState, MediaStatus, QualityProfile, TrackChange, TrackKind,
};
use crate::metrics::{QualityMonitor, QualitySample, QualityTier};
use crate::peer::{PeerConnection, PeerConnector, PeerEvent, PeerEventKind, PeerEventSink, RemoteTrack, SignalPayload, TransportCounters};
use crate::room::{JoinRequest, Participant, RoomPhase, RoomSession};
use crate::signaling::{ChannelEvent, ClientEvent, RelayEvent, SignalingChannel};

/// Why a track acquisition was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    Toggle,
    Adapt(QualityTier),
}

/// Everything the owning task feeds into the orchestrator.
pub enum Input {
    Channel(ChannelEvent),
    Peer(PeerEvent),
    MediaAcquired {
        kind: TrackKind,
        purpose: Acquisition,
        result: std::result::Result<LocalTrack, MediaAccessError>,
    },
    StatsSampled {
        peer_id: String,
        generation: u64,
        result: std::result::Result<TransportCounters, PeerError>,
    },
    Command(Command),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The relay reported the peer gone.
    PeerLeft,
    LocalLeave,
    /// Dropped from an authoritative membership refresh.
    NotAMember,
    Negotiation(String),
    ChannelLost,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerLeft => write!(f, "peer left"),
            CloseReason::LocalLeave => write!(f, "left room"),
            CloseReason::NotAMember => write!(f, "no longer a member"),
            CloseReason::Negotiation(e) => write!(f, "negotiation failed: {}", e),
            CloseReason::ChannelLost => write!(f, "signaling channel lost"),
        }
    }
}

/// Events for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    RoomCreated(String),
    RoomJoined { room_id: String, members: Vec<Participant> },
    RoomLeft,
    PeerJoined(Participant),
    PeerConnected(String),
    PeerClosed { peer_id: String, reason: CloseReason },
    RemoteStatus { peer_id: String, status: MediaStatus },
    Quality { peer_id: String, tier: QualityTier, sample: QualitySample },
    MediaChanged(MediaStatus),
    Error(String),
    ChannelLost,
}

pub struct PeerOrchestrator {
    channel: Arc<dyn SignalingChannel>,
    connector: Arc<dyn PeerConnector>,
    media: LocalMediaManager,
    quality: QualityMonitor,
    monitor: SessionMonitor,
    inbox: mpsc::UnboundedSender<Input>,
    notices: mpsc::UnboundedSender<ClientNotice>,
    notices_rx: Option<mpsc::UnboundedReceiver<ClientNotice>>,
    handshake_timeout: Duration,
    adaptive_video: bool,
    start_camera: bool,
    start_mic: bool,
    username: Option<String>,
    local_id: Option<String>,
    phase: RoomPhase,
    session: Option<RoomSession>,
    links: HashMap<String, PeerLink>,
    /// Peers whose departure was processed; their late signals are dropped.
    departed: HashSet<String>,
    /// Signals that overtook the join acknowledgement, in arrival order.
    early_signals: Vec<(String, SignalPayload)>,
    remote_status: HashMap<String, MediaStatus>,
    /// Room to re-join after the channel reconnects.
    last_room: Option<String>,
    next_generation: u64,
    channel_closed: bool,
    stopped: bool,
}

impl PeerOrchestrator {
    pub fn new(
        config: &ClientConfig,
        channel: Arc<dyn SignalingChannel>,
        connector: Arc<dyn PeerConnector>,
        devices: Arc<dyn MediaDevices>,
        inbox: mpsc::UnboundedSender<Input>,
    ) -> Self {
        let (notices, notices_rx) = mpsc::unbounded_channel();
        Self {
            channel,
            connector,
            media: LocalMediaManager::new(devices, config.media.profile),
            quality: QualityMonitor::new(&config.quality),
            monitor: SessionMonitor::new(),
            inbox,
            notices,
            notices_rx: Some(notices_rx),
            handshake_timeout: config.negotiation.handshake_timeout(),
            adaptive_video: config.quality.adaptive_video,
            start_camera: config.media.start_camera,
            start_mic: config.media.start_mic,
            username: None,
            local_id: None,
            phase: RoomPhase::Idle,
            session: None,
            links: HashMap::new(),
            departed: HashSet::new(),
            early_signals: Vec::new(),
            remote_status: HashMap::new(),
            last_room: None,
            next_generation: 1,
            channel_closed: false,
            stopped: false,
        }
    }

    /// Receiver for `ClientNotice`s; available once.
    pub fn take_notices(&mut self) -> Option<mpsc::UnboundedReceiver<ClientNotice>> {
        self.notices_rx.take()
    }

    pub fn monitor(&self) -> SessionMonitor {
        self.monitor.clone()
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn phase(&self) -> &RoomPhase {
        &self.phase
    }

    pub fn room_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.room_id())
    }

    pub fn in_room(&self) -> bool {
        self.session.is_some()
    }

    pub fn channel_closed(&self) -> bool {
        self.channel_closed
    }

    /// True once the owning task should stop feeding inputs.
    pub fn is_finished(&self) -> bool {
        self.stopped || self.channel_closed
    }

    pub fn members(&self) -> Vec<String> {
        self.session
            .as_ref()
            .map(|s| s.member_ids().cloned().collect())
            .unwrap_or_default()
    }

    pub fn link_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.links.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn link_state(&self, peer_id: &str) -> Option<LinkState> {
        self.links.get(peer_id).map(|l| l.state())
    }

    pub fn link_role(&self, peer_id: &str) -> Option<SignalingRole> {
        self.links.get(peer_id).map(|l| l.role)
    }

    pub fn remote_tracks(&self, peer_id: &str) -> &[RemoteTrack] {
        self.links
            .get(peer_id)
            .map(|l| l.remote_tracks())
            .unwrap_or(&[])
    }

    pub fn remote_status(&self, peer_id: &str) -> Option<MediaStatus> {
        self.remote_status.get(peer_id).copied()
    }

    pub fn media_state(&self) -> &MediaState {
        self.media.state()
    }

    pub fn video_tier(&self) -> QualityTier {
        self.media.tier()
    }

    pub fn quality_tier(&self, peer_id: &str) -> Option<QualityTier> {
        self.quality.tier(peer_id)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            local_id: self.local_id.clone(),
            room_id: self.room_id().map(str::to_string),
            phase: self.phase.clone(),
            peers: self
                .links
                .iter()
                .map(|(id, link)| (id.clone(), link.state()))
                .collect(),
            media: self.media.status(),
        }
    }

    fn publish(&self) {
        self.monitor.publish(self.status());
    }

    fn notify(&self, notice: ClientNotice) {
        let _ = self.notices.send(notice);
    }

    async fn emit(&self, event: ClientEvent) -> Result<()> {
        self.channel.emit(event).await.map_err(|e| {
            warn!(error = %e, "signaling send failed");
            Error::from(e)
        })
    }

    pub async fn handle(&mut self, input: Input) {
        match input {
            Input::Channel(event) => self.on_channel_event(event).await,
            Input::Peer(event) => self.on_peer_event(event).await,
            Input::MediaAcquired { kind, purpose, result } => self.on_media_acquired(kind, purpose, result).await,
            Input::StatsSampled {
                peer_id,
                generation,
                result,
            } => self.on_stats_sampled(&peer_id, generation, result).await,
            Input::Command(command) => command.apply(self).await,
        }
        self.publish();
    }

    // ---- identity and rooms ----

    pub async fn register(&mut self, username: &str) -> Result<()> {
        self.username = Some(username.to_string());
        self.emit(ClientEvent::RegisterUsername(username.to_string()))
            .await
    }

    /// Creates a room (`None` or empty id) or joins an existing one. Does not
    /// wait for capture; tracks are attached to links as they arrive.
    pub async fn join_room(&mut self, room_id: Option<String>) -> Result<()> {
        let request = match room_id.filter(|id| !id.is_empty()) {
            Some(id) => JoinRequest::Join(id),
            None => JoinRequest::Create,
        };

        if let (Some(session), JoinRequest::Join(id)) = (&self.session, &request) {
            if session.room_id() == id {
                return Ok(());
            }
        }
        if self.session.is_some() {
            self.leave_room().await?;
        }

        let event = match &request {
            JoinRequest::Create => ClientEvent::CreateRoom,
            JoinRequest::Join(id) => ClientEvent::JoinRoom(id.clone()),
        };
        info!(?request, "joining room");
        self.early_signals.clear();
        self.phase = RoomPhase::Joining(request);
        if let Err(e) = self.emit(event).await {
            self.phase = RoomPhase::Idle;
            self.publish();
            return Err(e);
        }
        self.publish();
        Ok(())
    }

    /// Closes every link and notifies the relay. No-op outside a room.
    pub async fn leave_room(&mut self) -> Result<()> {
        self.early_signals.clear();
        let Some(session) = self.session.take() else {
            if self.phase != RoomPhase::Idle {
                self.phase = RoomPhase::Idle;
                self.publish();
            }
            return Ok(());
        };

        info!(room_id = session.room_id(), "leaving room");
        self.close_all(CloseReason::LocalLeave).await;
        self.phase = RoomPhase::Idle;
        self.last_room = None;
        self.reset_room_state();
        self.notify(ClientNotice::RoomLeft);
        self.publish();

        self.emit(ClientEvent::LeaveRoom(session.room_id().to_string()))
            .await
    }

    fn reset_room_state(&mut self) {
        self.departed.clear();
        self.remote_status.clear();
        self.quality.clear();
    }

    async fn enter_room(&mut self, room_id: &str, created: bool) {
        if self.room_id() == Some(room_id) {
            self.phase = RoomPhase::InRoom;
            return;
        }
        if let Some(previous) = self.session.take() {
            warn!(previous = previous.room_id(), room_id, "relay moved us to another room");
            self.close_all(CloseReason::NotAMember).await;
        }
        let local_id = self.local_id.clone().unwrap_or_default();
        self.session = Some(RoomSession::new(room_id, local_id));
        self.phase = RoomPhase::InRoom;
        self.last_room = Some(room_id.to_string());
        self.reset_room_state();
        info!(room_id, "entered room");
        if created {
            self.notify(ClientNotice::RoomCreated(room_id.to_string()));
        }
    }

    /// Applies signals that arrived while the join was pending.
    async fn replay_early_signals(&mut self) {
        for (from, payload) in std::mem::take(&mut self.early_signals) {
            self.on_signal(&from, payload).await;
        }
    }

    async fn broadcast_status(&self) {
        let (Some(room_id), Some(id)) = (self.room_id(), self.local_id.as_deref()) else {
            return;
        };
        let status = self.media.status();
        let _ = self
            .emit(ClientEvent::CameraMicStatus {
                room_id: room_id.to_string(),
                id: id.to_string(),
                camera: status.camera,
                mic: status.mic,
            })
            .await;
    }

    // ---- relay events ----

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Relay(event) => self.on_relay_event(event).await,
            ChannelEvent::Reconnected => self.on_reconnected().await,
            ChannelEvent::Closed => {
                warn!("signaling channel closed for good");
                self.close_all(CloseReason::ChannelLost).await;
                self.session = None;
                self.phase = RoomPhase::Idle;
                self.early_signals.clear();
                self.reset_room_state();
                self.channel_closed = true;
                self.notify(ClientNotice::ChannelLost);
            }
        }
    }

    async fn on_reconnected(&mut self) {
        let room = self.last_room.clone();
        info!(?room, "signaling reconnected, restoring session");
        // Peer ids are per relay session; every link is stale now.
        self.close_all(CloseReason::ChannelLost).await;
        self.session = None;
        self.phase = RoomPhase::Idle;
        self.local_id = None;
        self.early_signals.clear();
        self.reset_room_state();

        if let Some(username) = self.username.clone() {
            let _ = self.register(&username).await;
        }
        if let Some(room) = room {
            if let Err(e) = self.join_room(Some(room)).await {
                self.notify(ClientNotice::Error(e.to_string()));
            }
        }
    }

    async fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connect(id) => {
                debug!(local_id = %id, "relay session assigned");
                self.local_id = Some(id);
            }
            RelayEvent::RoomId(room_id) => {
                let created = matches!(self.phase, RoomPhase::Joining(JoinRequest::Create));
                self.enter_room(&room_id, created).await;
                self.broadcast_status().await;
                self.replay_early_signals().await;
            }
            RelayEvent::RoomJoined { room_id, users } => {
                let fresh = self.room_id() != Some(room_id.as_str());
                self.enter_room(&room_id, false).await;
                self.on_membership_snapshot(users).await;
                if fresh {
                    let members = self
                        .session
                        .as_ref()
                        .map(|s| s.member_ids().filter_map(|id| s.member(id).cloned()).collect())
                        .unwrap_or_default();
                    self.notify(ClientNotice::RoomJoined { room_id, members });
                    self.broadcast_status().await;
                }
                self.replay_early_signals().await;
            }
            RelayEvent::UserJoined(participant) => self.on_peer_joined(participant).await,
            RelayEvent::UserLeft(peer_id) => self.on_peer_left(&peer_id).await,
            RelayEvent::UserList(users) => {
                if self.in_room() {
                    self.on_membership_snapshot(users).await;
                }
            }
            RelayEvent::Signal { from, signal } => self.on_signal(&from, signal).await,
            RelayEvent::CameraMicStatus { id, camera, mic } => {
                let status = MediaStatus { camera, mic };
                self.remote_status.insert(id.clone(), status);
                self.notify(ClientNotice::RemoteStatus { peer_id: id, status });
            }
            RelayEvent::Error(message) => {
                let err = SignalingDeliveryError::Relay(message);
                warn!(error = %err, "relay reported an error");
                if matches!(self.phase, RoomPhase::Joining(_)) {
                    self.early_signals.clear();
                    self.phase = if self.session.is_some() {
                        RoomPhase::InRoom
                    } else {
                        RoomPhase::Idle
                    };
                }
                self.notify(ClientNotice::Error(err.to_string()));
            }
        }
    }

    /// Replaces the member set. Never initiates: existing members call the
    /// newcomer. Links to peers missing from the snapshot are closed.
    pub async fn on_membership_snapshot(&mut self, users: Vec<Participant>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.replace_members(users);
        let stale: Vec<String> = self
            .links
            .keys()
            .filter(|id| !session.contains(id))
            .cloned()
            .collect();
        self.departed.retain(|id| !session.contains(id));
        debug!(members = session.len(), "membership snapshot applied");

        for peer_id in stale {
            self.close_link(&peer_id, CloseReason::NotAMember).await;
        }
    }

    /// The already-present side initiates toward a newcomer.
    pub async fn on_peer_joined(&mut self, participant: Participant) {
        let Some(session) = self.session.as_mut() else {
            debug!(peer_id = %participant.id, "user-joined outside a room");
            return;
        };
        if Some(participant.id.as_str()) == self.local_id.as_deref() {
            return;
        }
        let peer_id = participant.id.clone();
        session.add_member(participant.clone());
        self.departed.remove(&peer_id);
        info!(%peer_id, name = %participant.display_name, "peer joined");
        self.notify(ClientNotice::PeerJoined(participant));
        self.start_call(&peer_id).await;
    }

    pub async fn on_peer_left(&mut self, peer_id: &str) {
        if let Some(session) = self.session.as_mut() {
            session.remove_member(peer_id);
            self.departed.insert(peer_id.to_string());
        }
        self.remote_status.remove(peer_id);
        info!(peer_id, "peer left");
        self.close_link(peer_id, CloseReason::PeerLeft).await;
    }

    /// Routes a signal to its link, creating a responder link for an unknown
    /// sender. Signals are applied in arrival order; those arriving while a
    /// join is pending are held until the room is entered.
    pub async fn on_signal(&mut self, from: &str, payload: SignalPayload) {
        if !self.in_room() {
            if matches!(self.phase, RoomPhase::Joining(_)) {
                debug!(from, kind = payload.label(), "signal ahead of join ack held");
                self.early_signals.push((from.to_string(), payload));
            } else {
                debug!(from, kind = payload.label(), "signal outside a room dropped");
            }
            return;
        }
        if Some(from) == self.local_id.as_deref() || self.departed.contains(from) {
            debug!(from, kind = payload.label(), "signal from departed peer dropped");
            return;
        }
        if payload == SignalPayload::Renegotiate {
            match self.links.get(from).map(|l| l.role) {
                Some(SignalingRole::Initiator) => self.renegotiate(from).await,
                Some(SignalingRole::Responder) => {
                    warn!(peer_id = from, "renegotiation request received as responder")
                }
                None => debug!(peer_id = from, "renegotiation request without a link dropped"),
            }
            return;
        }
        if !self.links.contains_key(from) {
            if let Err(e) = self.create_link(from, SignalingRole::Responder).await {
                warn!(peer_id = from, error = %e, "could not create responder link");
                self.notify(ClientNotice::Error(e.to_string()));
                return;
            }
        }
        let Some(link) = self.links.get(from) else {
            return;
        };
        let connection = Arc::clone(&link.connection);
        debug!(from, kind = payload.label(), "applying signal");

        let completes = matches!(payload, SignalPayload::Offer { .. } | SignalPayload::Answer { .. });
        match connection.apply_signal(payload).await {
            Ok(reply) => {
                // The link may have closed while the transport was busy.
                let Some(link) = self.links.get_mut(from) else {
                    return;
                };
                let deferred = completes && link.complete_sdp();
                if let Some(reply) = reply {
                    let _ = self
                        .emit(ClientEvent::Signal {
                            to: from.to_string(),
                            signal: reply,
                        })
                        .await;
                }
                if deferred {
                    debug!(peer_id = from, "running deferred renegotiation");
                    self.renegotiate(from).await;
                }
            }
            Err(e) => {
                warn!(peer_id = from, error = %e, "signal rejected");
                self.close_link(from, CloseReason::Negotiation(e.to_string()))
                    .await;
            }
        }
    }

    // ---- links ----

    /// Idempotent: returns false when a link for `peer_id` already exists.
    async fn create_link(&mut self, peer_id: &str, role: SignalingRole) -> Result<bool> {
        if self.links.contains_key(peer_id) {
            return Ok(false);
        }
        let generation = self.next_generation;
        self.next_generation += 1;

        let sink = PeerEventSink::new(peer_id, generation, self.inbox.clone());
        let connection = self.connector.connect(peer_id, role, sink).await?;
        let mut link = PeerLink::new(peer_id, Arc::clone(&connection), role, generation);
        link.begin_signaling(Instant::now());

        for track in self.media.state().local_stream.tracks() {
            if let Err(e) = connection.add_track(track).await {
                let err = TrackApplyError {
                    peer_id: peer_id.to_string(),
                    kind: track.kind(),
                    reason: e.to_string(),
                };
                warn!(error = %err, "initial track not attached");
            }
        }

        info!(peer_id, %role, generation, "peer link created");
        self.links.insert(peer_id.to_string(), link);
        Ok(true)
    }

    async fn start_call(&mut self, peer_id: &str) {
        match self.create_link(peer_id, SignalingRole::Initiator).await {
            Ok(true) => self.send_offer(peer_id).await,
            Ok(false) => debug!(peer_id, "link already exists"),
            Err(e) => {
                warn!(peer_id, error = %e, "could not create initiator link");
                self.notify(ClientNotice::Error(e.to_string()));
            }
        }
    }

    async fn send_offer(&mut self, peer_id: &str) {
        let Some(connection) = self.open_connection(peer_id) else {
            return;
        };
        match connection.create_offer().await {
            Ok(offer) => {
                let Some(link) = self.links.get_mut(peer_id) else {
                    return;
                };
                link.offer_sent();
                let _ = self
                    .emit(ClientEvent::Signal {
                        to: peer_id.to_string(),
                        signal: offer,
                    })
                    .await;
            }
            Err(e) => {
                warn!(peer_id, error = %e, "offer failed");
                self.close_link(peer_id, CloseReason::Negotiation(e.to_string()))
                    .await;
            }
        }
    }

    /// Starts a new exchange, or queues one while the current exchange runs.
    async fn renegotiate(&mut self, peer_id: &str) {
        let Some(link) = self.links.get_mut(peer_id) else {
            return;
        };
        if !link.is_open() {
            return;
        }
        if link.negotiating() {
            debug!(peer_id, "exchange in progress, renegotiation deferred");
            link.defer_renegotiation();
            return;
        }
        let role = link.role;
        match role {
            SignalingRole::Initiator => self.send_offer(peer_id).await,
            SignalingRole::Responder => {
                let _ = self
                    .emit(ClientEvent::Signal {
                        to: peer_id.to_string(),
                        signal: SignalPayload::Renegotiate,
                    })
                    .await;
            }
        }
    }

    fn open_connection(&self, peer_id: &str) -> Option<Arc<dyn PeerConnection>> {
        self.links
            .get(peer_id)
            .filter(|l| l.is_open())
            .map(|l| Arc::clone(&l.connection))
    }

    fn open_connections(&self) -> Vec<(String, Arc<dyn PeerConnection>)> {
        let mut open: Vec<_> = self
            .links
            .values()
            .filter(|l| l.is_open())
            .map(|l| (l.peer_id.clone(), Arc::clone(&l.connection)))
            .collect();
        open.sort_by(|a, b| a.0.cmp(&b.0));
        open
    }

    async fn close_link(&mut self, peer_id: &str, reason: CloseReason) {
        let Some(mut link) = self.links.remove(peer_id) else {
            return;
        };
        link.mark_closed();
        self.quality.forget(peer_id);
        if let Err(e) = link.connection.close().await {
            debug!(peer_id, error = %e, "close reported an error");
        }
        info!(peer_id, %reason, "peer link closed");
        self.notify(ClientNotice::PeerClosed {
            peer_id: peer_id.to_string(),
            reason,
        });
    }

    async fn close_all(&mut self, reason: CloseReason) {
        for peer_id in self.link_ids() {
            self.close_link(&peer_id, reason.clone()).await;
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        let current = self
            .links
            .get(&event.peer_id)
            .is_some_and(|l| l.generation == event.generation && l.is_open());
        if !current {
            debug!(peer_id = %event.peer_id, generation = event.generation, "stale peer event dropped");
            return;
        }
        let peer_id = event.peer_id;

        match event.kind {
            PeerEventKind::Signal(signal) => {
                let _ = self
                    .emit(ClientEvent::Signal {
                        to: peer_id,
                        signal,
                    })
                    .await;
            }
            PeerEventKind::RemoteTrack(track) => {
                let Some(link) = self.links.get_mut(&peer_id) else {
                    return;
                };
                debug!(%peer_id, kind = %track.kind, track_id = %track.id, "remote track");
                if link.remote_track_arrived(track) {
                    info!(%peer_id, "peer connected");
                    self.notify(ClientNotice::PeerConnected(peer_id));
                }
            }
            PeerEventKind::NegotiationNeeded => self.renegotiate(&peer_id).await,
            PeerEventKind::Failed(reason) => {
                let err = NegotiationError::Transport(reason);
                warn!(%peer_id, error = %err, "peer transport failed");
                self.close_link(&peer_id, CloseReason::Negotiation(err.to_string()))
                    .await;
            }
        }
    }

    /// Closes links whose offer/answer exchange outlived the handshake timeout.
    pub async fn sweep_stalled_handshakes(&mut self, now: Instant) {
        let timeout = self.handshake_timeout;
        let stalled: Vec<String> = self
            .links
            .values()
            .filter(|l| l.handshake_stalled(now, timeout))
            .map(|l| l.peer_id.clone())
            .collect();
        for peer_id in stalled {
            let err = NegotiationError::Timeout(timeout.as_secs());
            warn!(%peer_id, error = %err, "abandoning handshake");
            self.close_link(&peer_id, CloseReason::Negotiation(err.to_string()))
                .await;
        }
        if !self.links.is_empty() {
            self.publish();
        }
    }

    // ---- local media ----

    /// Starts capture for the kinds enabled in the configuration without
    /// waiting for it.
    pub fn start_media(&mut self) {
        let wanted = [(TrackKind::Audio, self.start_mic), (TrackKind::Video, self.start_camera)]
            .into_iter()
            .filter_map(|(kind, wanted)| wanted.then_some(kind));
        for (kind, profile) in self.media.acquire(wanted) {
            self.spawn_acquire(kind, Acquisition::Toggle, profile);
        }
    }

    pub async fn toggle_local_track(&mut self, kind: TrackKind) -> Result<()> {
        let enabled = self.media.state().is_enabled(kind);
        self.set_local_track(kind, !enabled).await
    }

    /// Disabling stops the track and removes its sender from every link;
    /// enabling re-acquires in the background and attaches on arrival.
    pub async fn set_local_track(&mut self, kind: TrackKind, enabled: bool) -> Result<()> {
        match self.media.set_enabled(kind, enabled)? {
            TrackChange::Unchanged => return Ok(()),
            TrackChange::Acquire(profile) => {
                self.spawn_acquire(kind, Acquisition::Toggle, profile);
                return Ok(());
            }
            TrackChange::Detached(_) => {}
        }

        for (peer_id, connection) in self.open_connections() {
            match connection.remove_track(kind).await {
                Ok(()) => self.track_changed(&peer_id),
                Err(e) => self.report_track_error(peer_id, kind, e),
            }
        }
        self.media_changed().await;
        Ok(())
    }

    fn spawn_acquire(&self, kind: TrackKind, purpose: Acquisition, profile: QualityProfile) {
        let devices = self.media.devices();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = devices.acquire(kind, profile).await;
            let _ = inbox.send(Input::MediaAcquired { kind, purpose, result });
        });
    }

    async fn on_media_acquired(
        &mut self,
        kind: TrackKind,
        purpose: Acquisition,
        result: std::result::Result<LocalTrack, MediaAccessError>,
    ) {
        let adapted = match purpose {
            Acquisition::Adapt(tier) => Some(tier),
            Acquisition::Toggle => None,
        };
        let track = match self.media.complete_acquire(kind, adapted, result) {
            Ok(Some(track)) => track,
            Ok(None) => return,
            Err(e) => {
                self.notify(ClientNotice::Error(e.to_string()));
                return;
            }
        };

        for (peer_id, connection) in self.open_connections() {
            let applied = if connection.has_sender(kind).await {
                connection.replace_track(&track).await
            } else {
                connection.add_track(&track).await.map(|()| self.track_changed(&peer_id))
            };
            if let Err(e) = applied {
                self.report_track_error(peer_id, kind, e);
            }
        }
        self.media_changed().await;
    }

    /// Sender changes on a link mid-exchange are not seen by the transport's
    /// own negotiation trigger; queue a round for when the exchange ends.
    fn track_changed(&mut self, peer_id: &str) {
        if let Some(link) = self.links.get_mut(peer_id) {
            if link.negotiating() {
                link.defer_renegotiation();
            }
        }
    }

    fn report_track_error(&self, peer_id: String, kind: TrackKind, err: PeerError) {
        let err = TrackApplyError {
            peer_id,
            kind,
            reason: err.to_string(),
        };
        warn!(error = %err, "track change not applied");
        self.notify(ClientNotice::Error(err.to_string()));
    }

    async fn media_changed(&mut self) {
        self.notify(ClientNotice::MediaChanged(self.media.status()));
        self.broadcast_status().await;
        self.publish();
    }

    // ---- quality ----

    /// Fetches transport statistics for every open link in the background.
    pub fn sample_quality(&self) {
        if !self.in_room() {
            return;
        }
        for link in self.links.values().filter(|l| l.is_open()) {
            let connection = Arc::clone(&link.connection);
            let peer_id = link.peer_id.clone();
            let generation = link.generation;
            let inbox = self.inbox.clone();
            tokio::spawn(async move {
                let result = connection.stats().await;
                let _ = inbox.send(Input::StatsSampled {
                    peer_id,
                    generation,
                    result,
                });
            });
        }
    }

    async fn on_stats_sampled(
        &mut self,
        peer_id: &str,
        generation: u64,
        result: std::result::Result<TransportCounters, PeerError>,
    ) {
        let current = self
            .links
            .get(peer_id)
            .is_some_and(|l| l.generation == generation && l.is_open());
        if !current {
            return;
        }
        let counters = match result {
            Ok(counters) => counters,
            Err(e) => {
                debug!(peer_id, error = %e, "stats unavailable");
                return;
            }
        };
        let Some(sample) = self.quality.observe(peer_id, counters) else {
            return;
        };
        let tier = self.quality.record(&sample);
        debug!(
            peer_id,
            send_kbps = sample.send_bitrate_kbps,
            recv_kbps = sample.recv_bitrate_kbps,
            %tier,
            "link quality"
        );
        self.notify(ClientNotice::Quality {
            peer_id: peer_id.to_string(),
            tier,
            sample,
        });
        self.maybe_adapt();
    }

    /// Follows the worst link with the outgoing video profile, under the
    /// same guard as a manual camera toggle.
    fn maybe_adapt(&mut self) {
        if !self.adaptive_video {
            return;
        }
        let Some(worst) = self.quality.worst_tier() else {
            return;
        };
        if let Some(profile) = self.media.begin_adapt(worst) {
            self.spawn_acquire(TrackKind::Video, Acquisition::Adapt(worst), profile);
        }
    }

    /// Closes everything and releases capture devices.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.leave_room().await {
            debug!(error = %e, "leave during shutdown");
        }
        self.close_all(CloseReason::LocalLeave).await;
        self.media.stop_all();
        self.stopped = true;
        self.publish();
    }
}
