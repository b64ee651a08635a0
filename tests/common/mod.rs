#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use roomcall::config::ClientConfig;
use roomcall::connection::SignalingRole;
use roomcall::devices::SampleTrackDevices;
use roomcall::error::{NegotiationError, PeerError, SignalingDeliveryError};
use roomcall::media::{LocalTrack, TrackKind};
use roomcall::orchestrator::{ClientNotice, Input, PeerOrchestrator};
use roomcall::peer::{
    IceCandidate, PeerConnection, PeerConnector, PeerEventKind, PeerEventSink, RemoteTrack, SignalPayload,
    TransportCounters,
};
use roomcall::room::Participant;
use roomcall::signaling::{ChannelEvent, ClientEvent, RelayEvent, SignalingChannel};

pub fn config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.username = "tester".into();
    config
}

/// Records outgoing events instead of sending them.
#[derive(Default)]
pub struct RecordingChannel {
    events: Mutex<Vec<ClientEvent>>,
    broken: AtomicBool,
}

impl RecordingChannel {
    pub fn take(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingChannel for RecordingChannel {
    async fn emit(&self, event: ClientEvent) -> Result<(), SignalingDeliveryError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(SignalingDeliveryError::ChannelClosed);
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeState {
    pub senders: HashSet<TrackKind>,
    pub negotiated: bool,
    pub closed: bool,
    pub offers: usize,
    pub replaced: Vec<TrackKind>,
    pub candidates: Vec<String>,
    pub stats: VecDeque<TransportCounters>,
}

/// In-memory peer connection. Descriptions list the sender kinds of their
/// author ("offer:audio,video"); applying one reports a remote track per kind.
pub struct FakeConnection {
    pub local_id: String,
    pub peer_id: String,
    pub role: SignalingRole,
    events: PeerEventSink,
    state: Mutex<FakeState>,
}

impl FakeConnection {
    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn push_stats(&self, counters: TransportCounters) {
        self.state().stats.push_back(counters);
    }

    fn description(&self, prefix: &str) -> String {
        let state = self.state();
        let mut kinds: Vec<String> = state.senders.iter().map(|k| k.to_string()).collect();
        kinds.sort();
        format!("{}:{}", prefix, kinds.join(","))
    }

    fn remote_description(&self, sdp: &str, prefix: &str) -> Result<(), PeerError> {
        let kinds = sdp
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| NegotiationError::InvalidDescription(sdp.to_string()))?;
        self.state().negotiated = true;
        for kind in kinds.split(',').filter(|k| !k.is_empty()) {
            let kind = match kind {
                "audio" => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            self.events.emit(PeerEventKind::RemoteTrack(RemoteTrack {
                id: format!("{}-{}", self.peer_id, kind),
                kind,
                stream_id: self.peer_id.clone(),
            }));
        }
        Ok(())
    }

    fn renegotiate_if_needed(&self) {
        if self.state().negotiated {
            self.events.emit(PeerEventKind::NegotiationNeeded);
        }
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&self) -> Result<SignalPayload, PeerError> {
        let sdp = self.description("offer");
        self.state().offers += 1;
        self.events
            .emit(PeerEventKind::Signal(SignalPayload::Candidate {
                candidate: IceCandidate {
                    candidate: format!("candidate:{}", self.local_id),
                    ..Default::default()
                },
            }));
        Ok(SignalPayload::Offer { sdp })
    }

    async fn apply_signal(&self, payload: SignalPayload) -> Result<Option<SignalPayload>, PeerError> {
        if self.state().closed {
            return Err(PeerError::Closed);
        }
        match payload {
            SignalPayload::Offer { sdp } => {
                self.remote_description(&sdp, "offer")?;
                Ok(Some(SignalPayload::Answer {
                    sdp: self.description("answer"),
                }))
            }
            SignalPayload::Answer { sdp } => {
                self.remote_description(&sdp, "answer")?;
                Ok(None)
            }
            SignalPayload::Candidate { candidate } => {
                self.state().candidates.push(candidate.candidate);
                Ok(None)
            }
            SignalPayload::Renegotiate => {
                Err(NegotiationError::UnexpectedState("renegotiate".into()).into())
            }
        }
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.state().senders.insert(track.kind());
        self.renegotiate_if_needed();
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.state().replaced.push(track.kind());
        Ok(())
    }

    async fn remove_track(&self, kind: TrackKind) -> Result<(), PeerError> {
        if self.state().senders.remove(&kind) {
            self.renegotiate_if_needed();
        }
        Ok(())
    }

    async fn has_sender(&self, kind: TrackKind) -> bool {
        self.state().senders.contains(&kind)
    }

    async fn stats(&self) -> Result<TransportCounters, PeerError> {
        self.state().stats.pop_front().ok_or(PeerError::Closed)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.state().closed = true;
        Ok(())
    }
}

pub struct FakeConnector {
    local_id: String,
    created: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeConnector {
    pub fn new(local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Every connection ever created toward `peer_id`, oldest first.
    pub fn connections_to(&self, peer_id: &str) -> Vec<Arc<FakeConnection>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.peer_id == peer_id)
            .cloned()
            .collect()
    }

    pub fn latest(&self, peer_id: &str) -> Arc<FakeConnection> {
        self.connections_to(peer_id)
            .pop()
            .expect("no connection to peer")
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        peer_id: &str,
        role: SignalingRole,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let connection = Arc::new(FakeConnection {
            local_id: self.local_id.clone(),
            peer_id: peer_id.to_string(),
            role,
            events,
            state: Mutex::new(FakeState::default()),
        });
        self.created.lock().unwrap().push(Arc::clone(&connection));
        Ok(connection)
    }
}

/// One client driven by hand: inputs are pumped explicitly.
pub struct Node {
    pub id: String,
    pub orchestrator: PeerOrchestrator,
    pub channel: Arc<RecordingChannel>,
    pub connector: Arc<FakeConnector>,
    pub devices: Arc<SampleTrackDevices>,
    inbox: mpsc::UnboundedReceiver<Input>,
    tx: mpsc::UnboundedSender<Input>,
    notices: mpsc::UnboundedReceiver<ClientNotice>,
}

impl Node {
    pub async fn new(id: &str, config: ClientConfig) -> Self {
        Self::with_devices(id, config, |_| {}).await
    }

    /// `prepare` runs before capture starts, e.g. to unplug a device.
    pub async fn with_devices(id: &str, config: ClientConfig, prepare: impl FnOnce(&SampleTrackDevices)) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        let channel = Arc::new(RecordingChannel::default());
        let connector = Arc::new(FakeConnector::new(id));
        let devices = Arc::new(SampleTrackDevices::new(format!("{}-stream", id)));
        prepare(devices.as_ref());

        let mut orchestrator = PeerOrchestrator::new(
            &config,
            channel.clone(),
            connector.clone(),
            devices.clone(),
            tx.clone(),
        );
        let notices = orchestrator.take_notices().unwrap();
        let mut node = Self {
            id: id.to_string(),
            orchestrator,
            channel,
            connector,
            devices,
            inbox,
            tx,
            notices,
        };
        node.inject(RelayEvent::Connect(id.to_string()));
        node.orchestrator.start_media();
        node.pump().await;
        node
    }

    pub fn inject(&self, event: RelayEvent) {
        self.send(Input::Channel(ChannelEvent::Relay(event)));
    }

    pub fn send(&self, input: Input) {
        let _ = self.tx.send(input);
    }

    /// Handles queued inputs, yielding so spawned capture and stats tasks
    /// can report back. Returns whether anything was handled.
    pub async fn pump(&mut self) -> bool {
        let mut worked = false;
        let mut idle = 0;
        while idle < 3 {
            match self.inbox.try_recv() {
                Ok(input) => {
                    self.orchestrator.handle(input).await;
                    worked = true;
                    idle = 0;
                }
                Err(_) => {
                    idle += 1;
                    tokio::task::yield_now().await;
                }
            }
        }
        worked
    }

    pub fn notices(&mut self) -> Vec<ClientNotice> {
        let mut out = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            out.push(notice);
        }
        out
    }
}

/// A set of nodes plus an in-process relay with the websocket server's
/// room semantics.
#[derive(Default)]
pub struct Mesh {
    pub nodes: BTreeMap<String, Node>,
    names: HashMap<String, String>,
    rooms: BTreeMap<String, Vec<String>>,
    next_room: u32,
    /// Every event a node sent, in routing order.
    pub log: Vec<(String, ClientEvent)>,
}

impl Mesh {
    pub async fn with_nodes(ids: &[&str]) -> Self {
        let mut mesh = Self::default();
        for id in ids {
            mesh.add(Node::new(id, config()).await);
        }
        mesh
    }

    pub fn add(&mut self, node: Node) {
        self.names.insert(node.id.clone(), format!("user-{}", node.id));
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn node(&mut self, id: &str) -> &mut Node {
        self.nodes.get_mut(id).expect("unknown node")
    }

    pub fn room_members(&self, room_id: &str) -> Vec<String> {
        self.rooms.get(room_id).cloned().unwrap_or_default()
    }

    /// Pumps every node once and routes what they sent. Returns whether
    /// anything moved.
    pub async fn step(&mut self) -> bool {
        let mut busy = false;
        for node in self.nodes.values_mut() {
            busy |= node.pump().await;
        }
        let outgoing: Vec<(String, ClientEvent)> = self
            .nodes
            .iter()
            .flat_map(|(id, node)| node.channel.take().into_iter().map(move |e| (id.clone(), e)))
            .collect();
        busy |= !outgoing.is_empty();
        for (from, event) in outgoing {
            self.log.push((from.clone(), event.clone()));
            self.route(&from, event);
        }
        busy
    }

    /// Pumps every node and routes relay traffic until nothing moves.
    pub async fn settle(&mut self) {
        for _ in 0..200 {
            if !self.step().await {
                return;
            }
        }
        panic!("mesh did not settle");
    }

    fn participant(&self, id: &str) -> Participant {
        Participant::new(id, self.names.get(id).cloned().unwrap_or_default())
    }

    fn deliver(&self, to: &str, event: RelayEvent) {
        if let Some(node) = self.nodes.get(to) {
            node.inject(event);
        }
    }

    fn route(&mut self, from: &str, event: ClientEvent) {
        match event {
            ClientEvent::RegisterUsername(name) => {
                self.names.insert(from.to_string(), name);
            }
            ClientEvent::CreateRoom => {
                self.next_room += 1;
                let room_id = format!("room-{}", self.next_room);
                self.rooms.insert(room_id.clone(), vec![from.to_string()]);
                self.deliver(from, RelayEvent::RoomId(room_id));
            }
            ClientEvent::JoinRoom(room_id) => {
                let Some(existing) = self.rooms.get(&room_id).cloned() else {
                    self.deliver(from, RelayEvent::Error("Room not found".into()));
                    return;
                };
                let users = existing.iter().map(|id| self.participant(id)).collect();
                self.deliver(from, RelayEvent::RoomJoined { room_id: room_id.clone(), users });
                let newcomer = self.participant(from);
                for member in &existing {
                    self.deliver(member, RelayEvent::UserJoined(newcomer.clone()));
                }
                if let Some(members) = self.rooms.get_mut(&room_id) {
                    members.push(from.to_string());
                }
            }
            ClientEvent::LeaveRoom(room_id) => {
                let remaining = match self.rooms.get_mut(&room_id) {
                    Some(members) => {
                        members.retain(|id| id != from);
                        members.clone()
                    }
                    None => return,
                };
                for member in remaining {
                    self.deliver(&member, RelayEvent::UserLeft(from.to_string()));
                }
            }
            ClientEvent::Signal { to, signal } => {
                self.deliver(
                    &to,
                    RelayEvent::Signal {
                        from: from.to_string(),
                        signal,
                    },
                );
            }
            ClientEvent::CameraMicStatus {
                room_id,
                id,
                camera,
                mic,
            } => {
                for member in self.room_members(&room_id) {
                    if member != from {
                        self.deliver(&member, RelayEvent::CameraMicStatus { id: id.clone(), camera, mic });
                    }
                }
            }
        }
    }
}
