use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::SignalingConfig;
use crate::error::SignalingDeliveryError;
use crate::orchestrator::Input;
use crate::peer::SignalPayload;
use crate::room::Participant;

/// Client to relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    RegisterUsername(String),
    CreateRoom,
    JoinRoom(String),
    LeaveRoom(String),
    Signal {
        to: String,
        signal: SignalPayload,
    },
    #[serde(rename_all = "camelCase")]
    CameraMicStatus {
        room_id: String,
        id: String,
        camera: bool,
        mic: bool,
    },
}

/// Relay to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayEvent {
    /// Session id assigned by the relay on (re)connect.
    Connect(String),
    RoomId(String),
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        users: Vec<Participant>,
    },
    UserJoined(Participant),
    UserLeft(String),
    UserList(Vec<Participant>),
    Signal {
        from: String,
        signal: SignalPayload,
    },
    CameraMicStatus {
        id: String,
        camera: bool,
        mic: bool,
    },
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Relay(RelayEvent),
    /// The transport dropped and came back; relay-side session state is gone.
    Reconnected,
    /// Reconnection gave up.
    Closed,
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn emit(&self, event: ClientEvent) -> Result<(), SignalingDeliveryError>;
}

pub fn encode(event: &ClientEvent) -> Result<String, SignalingDeliveryError> {
    serde_json::to_string(event).map_err(|e| SignalingDeliveryError::Encode(e.to_string()))
}

pub fn decode(text: &str) -> Result<RelayEvent, serde_json::Error> {
    serde_json::from_str(text)
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket signaling channel. Outgoing events are queued while the socket
/// reconnects.
pub struct SignalingClient {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl SignalingClient {
    pub async fn connect(
        config: SignalingConfig,
        inbound: mpsc::UnboundedSender<Input>,
    ) -> Result<Self, SignalingDeliveryError> {
        let (ws_stream, _) = connect_async(config.url.as_str())
            .await
            .map_err(|e| SignalingDeliveryError::Connect(e.to_string()))?;
        info!(url = %config.url, "signaling connected");

        let (tx, outgoing_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(ws_stream, outgoing_rx, inbound, config));
        Ok(Self { tx })
    }
}

#[async_trait]
impl SignalingChannel for SignalingClient {
    async fn emit(&self, event: ClientEvent) -> Result<(), SignalingDeliveryError> {
        self.tx
            .send(event)
            .map_err(|_| SignalingDeliveryError::ChannelClosed)
    }
}

async fn drive(
    mut ws: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<ClientEvent>,
    inbound: mpsc::UnboundedSender<Input>,
    config: SignalingConfig,
) {
    loop {
        let (mut write, mut read) = ws.split();

        let lost = loop {
            tokio::select! {
                event = outgoing.recv() => match event {
                    Some(event) => {
                        let text = match encode(&event) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "dropping unencodable event");
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!(error = %e, "signaling write failed");
                            break true;
                        }
                    }
                    None => {
                        let _ = write.close().await;
                        break false;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match decode(&text) {
                        Ok(event) => {
                            debug!(?event, "relay event");
                            if inbound.send(Input::Channel(ChannelEvent::Relay(event))).is_err() {
                                break false;
                            }
                        }
                        Err(e) => warn!(error = %e, "ignoring malformed relay message"),
                    },
                    Some(Ok(Message::Close(_))) | None => break true,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "signaling read failed");
                        break true;
                    }
                },
            }
        };

        if !lost {
            debug!("signaling driver stopped");
            return;
        }

        match reconnect(&config).await {
            Some(stream) => {
                ws = stream;
                let dropped = discard_queued(&mut outgoing);
                if dropped > 0 {
                    debug!(dropped, "discarded events queued for the lost session");
                }
                if inbound.send(Input::Channel(ChannelEvent::Reconnected)).is_err() {
                    return;
                }
            }
            None => {
                let _ = inbound.send(Input::Channel(ChannelEvent::Closed));
                return;
            }
        }
    }
}

/// Empties events addressed to a relay session that no longer exists.
fn discard_queued(outgoing: &mut mpsc::UnboundedReceiver<ClientEvent>) -> usize {
    let mut dropped = 0;
    while outgoing.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

async fn reconnect(config: &SignalingConfig) -> Option<WsStream> {
    for attempt in 1..=config.reconnect_attempts {
        sleep(config.reconnect_delay()).await;
        match connect_async(config.url.as_str()).await {
            Ok((stream, _)) => {
                info!(attempt, "signaling reconnected");
                return Some(stream);
            }
            Err(e) => warn!(attempt, error = %e, "signaling reconnect failed"),
        }
    }
    error!(attempts = config.reconnect_attempts, "max reconnection attempts reached");
    None
}
