//! The task that owns a `PeerOrchestrator`, and the handle used to drive it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::connection::SessionStatus;
use crate::error::{Error, Result};
use crate::media::{MediaDevices, TrackKind};
use crate::orchestrator::{ClientNotice, Input, PeerOrchestrator};
use crate::peer::PeerConnector;
use crate::signaling::SignalingChannel;

/// User-facing requests, answered over a oneshot.
pub enum Command {
    Register {
        username: String,
        reply: oneshot::Sender<Result<()>>,
    },
    JoinRoom {
        room_id: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    LeaveRoom {
        reply: oneshot::Sender<Result<()>>,
    },
    ToggleTrack {
        kind: TrackKind,
        reply: oneshot::Sender<Result<()>>,
    },
    SetTrack {
        kind: TrackKind,
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl Command {
    pub(crate) async fn apply(self, orchestrator: &mut PeerOrchestrator) {
        // A dropped receiver only means the caller stopped waiting.
        match self {
            Command::Register { username, reply } => {
                let _ = reply.send(orchestrator.register(&username).await);
            }
            Command::JoinRoom { room_id, reply } => {
                let _ = reply.send(orchestrator.join_room(room_id).await);
            }
            Command::LeaveRoom { reply } => {
                let _ = reply.send(orchestrator.leave_room().await);
            }
            Command::ToggleTrack { kind, reply } => {
                let _ = reply.send(orchestrator.toggle_local_track(kind).await);
            }
            Command::SetTrack {
                kind,
                enabled,
                reply,
            } => {
                let _ = reply.send(orchestrator.set_local_track(kind, enabled).await);
            }
            Command::Status { reply } => {
                let _ = reply.send(orchestrator.status());
            }
            Command::Shutdown { reply } => {
                orchestrator.shutdown().await;
                let _ = reply.send(());
            }
        }
    }
}

/// Cloneable front end for a running client.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Input>,
    status: watch::Receiver<SessionStatus>,
}

impl ClientHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Input::Command(build(reply)))
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }

    pub async fn register(&self, username: impl Into<String>) -> Result<()> {
        let username = username.into();
        self.request(|reply| Command::Register { username, reply })
            .await?
    }

    /// `None` creates a new room.
    pub async fn join_room(&self, room_id: Option<String>) -> Result<()> {
        self.request(|reply| Command::JoinRoom { room_id, reply })
            .await?
    }

    pub async fn leave_room(&self) -> Result<()> {
        self.request(|reply| Command::LeaveRoom { reply }).await?
    }

    pub async fn toggle(&self, kind: TrackKind) -> Result<()> {
        self.request(|reply| Command::ToggleTrack { kind, reply })
            .await?
    }

    pub async fn set_track(&self, kind: TrackKind, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetTrack {
            kind,
            enabled,
            reply,
        })
        .await?
    }

    /// Snapshot taken inside the client task.
    pub async fn status(&self) -> Result<SessionStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Latest published snapshot, without a round trip.
    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

pub struct Client {
    orchestrator: PeerOrchestrator,
    inbox: mpsc::UnboundedReceiver<Input>,
    tx: mpsc::UnboundedSender<Input>,
    sample_interval: Duration,
    sweep_interval: Duration,
}

impl Client {
    /// `inbox` must be the pair whose sender was handed to the signaling
    /// channel, so relay events reach this client.
    pub fn new(
        config: &ClientConfig,
        channel: Arc<dyn SignalingChannel>,
        connector: Arc<dyn PeerConnector>,
        devices: Arc<dyn MediaDevices>,
        inbox: (mpsc::UnboundedSender<Input>, mpsc::UnboundedReceiver<Input>),
    ) -> Self {
        let (tx, rx) = inbox;
        let orchestrator = PeerOrchestrator::new(config, channel, connector, devices, tx.clone());
        Self {
            orchestrator,
            inbox: rx,
            tx,
            sample_interval: config.quality.sample_interval(),
            sweep_interval: config.negotiation.sweep_interval(),
        }
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            tx: self.tx.clone(),
            status: self.orchestrator.monitor().subscribe(),
        }
    }

    pub fn take_notices(&mut self) -> Option<mpsc::UnboundedReceiver<ClientNotice>> {
        self.orchestrator.take_notices()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Processes inputs one at a time until shutdown or permanent channel
    /// loss. Quality sampling and the handshake sweep only tick in a room.
    pub async fn run(mut self) {
        self.orchestrator.start_media();

        let mut quality = interval(self.sample_interval);
        quality.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let in_room = self.orchestrator.in_room();
            tokio::select! {
                input = self.inbox.recv() => match input {
                    Some(input) => self.orchestrator.handle(input).await,
                    None => break,
                },
                _ = quality.tick(), if in_room => self.orchestrator.sample_quality(),
                now = sweep.tick(), if in_room => self.orchestrator.sweep_stalled_handshakes(now).await,
            }
            if self.orchestrator.is_finished() {
                break;
            }
        }

        debug!(channel_closed = self.orchestrator.channel_closed(), "client loop ended");
        self.orchestrator.shutdown().await;
        info!("client stopped");
    }
}
