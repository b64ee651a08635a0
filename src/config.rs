//! Client configuration.
//!
//! Loaded from a TOML file. Every field has a default so the client runs
//! without a configuration file; `ROOMCALL_SIGNALING_URL` and
//! `ROOMCALL_USERNAME` override the file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metrics::QualityTier;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Display name registered with the relay.
    pub username: String,
    pub signaling: SignalingConfig,
    pub ice: IceConfig,
    pub media: MediaConfig,
    pub quality: QualityConfig,
    pub negotiation: NegotiationConfig,
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: format!("user-{}", rand::random::<u32>()),
            signaling: SignalingConfig::default(),
            ice: IceConfig::default(),
            media: MediaConfig::default(),
            quality: QualityConfig::default(),
            negotiation: NegotiationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Reads the TOML file at `path` (if it exists) and applies env overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
            Self::from_toml(&raw)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("ROOMCALL_SIGNALING_URL") {
            self.signaling.url = url;
        }
        if let Ok(name) = std::env::var("ROOMCALL_USERNAME") {
            self.username = name;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".into(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
        }
    }
}

impl SignalingConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn: Vec<TurnServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec!["stun:stun.l.google.com:19302".into()],
            turn: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Acquire the camera at startup.
    pub start_camera: bool,
    /// Acquire the microphone at startup.
    pub start_mic: bool,
    /// Capture profile used until adaptation picks another.
    pub profile: QualityTier,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            start_camera: true,
            start_mic: true,
            profile: QualityTier::High,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub sample_interval_secs: u64,
    /// Links above this bitrate (kbps, exclusive) are `high`.
    pub high_kbps: f64,
    /// Links above this bitrate (kbps, exclusive) are `medium`.
    pub medium_kbps: f64,
    /// Swap the outgoing video profile to follow the worst link.
    pub adaptive_video: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 5,
            high_kbps: 1500.0,
            medium_kbps: 700.0,
            adaptive_video: false,
        }
    }
}

impl QualityConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Links whose offer/answer exchange is still open after this long are closed.
    pub handshake_timeout_secs: u64,
    pub sweep_interval_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 30,
            sweep_interval_ms: 1000,
        }
    }
}

impl NegotiationConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// "trace", "debug", "info", "warn" or "error"
    pub level: String,
    /// "text" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
