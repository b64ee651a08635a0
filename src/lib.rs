//! Room-based WebRTC calling client: joins a room through a websocket relay,
//! keeps one peer connection per remote member and shares local camera and
//! microphone tracks with all of them.

pub mod client;
pub mod config;
pub mod connection;
pub mod devices;
pub mod error;
pub mod logging;
pub mod media;
pub mod metrics;
pub mod orchestrator;
pub mod peer;
pub mod room;
pub mod rtc;
pub mod signaling;

pub use client::{Client, ClientHandle};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use orchestrator::{ClientNotice, PeerOrchestrator};
