use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use roomcall::client::{Client, ClientHandle};
use roomcall::config::ClientConfig;
use roomcall::devices::SampleTrackDevices;
use roomcall::logging;
use roomcall::media::TrackKind;
use roomcall::orchestrator::ClientNotice;
use roomcall::rtc::RtcConnector;
use roomcall::signaling::SignalingClient;

const DEFAULT_CONFIG: &str = "roomcall.toml";

const HELP: &str = "commands: create | join <room> | leave | camera | mic | status | quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ROOMCALL_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = ClientConfig::load(&path).with_context(|| format!("loading {}", path))?;
    if !logging::level_is_valid(&config.logging.level) {
        bail!("unknown log level {:?}", config.logging.level);
    }
    logging::init(&config.logging);

    let (tx, rx) = mpsc::unbounded_channel();
    let channel = SignalingClient::connect(config.signaling.clone(), tx.clone())
        .await
        .context("connecting to signaling relay")?;
    let connector = RtcConnector::new(&config.ice).context("building peer connection factory")?;
    let devices = SampleTrackDevices::new(format!("{}-stream", config.username));

    let mut client = Client::new(
        &config,
        Arc::new(channel),
        Arc::new(connector),
        Arc::new(devices),
        (tx, rx),
    );
    let handle = client.handle();
    let notices = client.take_notices();
    let task = client.spawn();

    if let Some(notices) = notices {
        tokio::spawn(print_notices(notices));
    }

    handle.register(config.username.clone()).await?;
    info!(username = %config.username, "registered");
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let result = match (words.next(), words.next()) {
            (Some("create"), _) => handle.join_room(None).await,
            (Some("join"), Some(room)) => handle.join_room(Some(room.to_string())).await,
            (Some("leave"), _) => handle.leave_room().await,
            (Some("camera"), _) => handle.toggle(TrackKind::Video).await,
            (Some("mic"), _) => handle.toggle(TrackKind::Audio).await,
            (Some("status"), _) => print_status(&handle).await,
            (Some("quit"), _) => break,
            (None, _) => continue,
            _ => {
                println!("{}", HELP);
                continue;
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "command failed");
            println!("error: {}", e);
        }
    }

    // The client may already be gone after losing the relay for good.
    let _ = handle.shutdown().await;
    task.await?;
    Ok(())
}

async fn print_status(handle: &ClientHandle) -> roomcall::Result<()> {
    let status = handle.status().await?;
    println!(
        "room: {} | camera: {} | mic: {}",
        status.room_id.as_deref().unwrap_or("-"),
        status.media.camera,
        status.media.mic
    );
    for (peer, state) in &status.peers {
        println!("  {} {}", peer, state);
    }
    Ok(())
}

async fn print_notices(mut notices: mpsc::UnboundedReceiver<ClientNotice>) {
    while let Some(notice) = notices.recv().await {
        match notice {
            ClientNotice::RoomCreated(id) => println!("room created: {}", id),
            ClientNotice::RoomJoined { room_id, members } => {
                println!("joined {} with {} other member(s)", room_id, members.len())
            }
            ClientNotice::RoomLeft => println!("left room"),
            ClientNotice::PeerJoined(p) => println!("{} ({}) joined", p.display_name, p.id),
            ClientNotice::PeerConnected(id) => println!("connected to {}", id),
            ClientNotice::PeerClosed { peer_id, reason } => println!("{} closed: {}", peer_id, reason),
            ClientNotice::RemoteStatus { peer_id, status } => {
                println!("{} camera: {} mic: {}", peer_id, status.camera, status.mic)
            }
            ClientNotice::Quality { peer_id, tier, .. } => println!("{} quality: {}", peer_id, tier),
            ClientNotice::MediaChanged(status) => {
                println!("camera: {} mic: {}", status.camera, status.mic)
            }
            ClientNotice::Error(message) => println!("error: {}", message),
            ClientNotice::ChannelLost => {
                println!("signaling relay lost");
                break;
            }
        }
    }
}
