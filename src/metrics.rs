use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::time::Instant;

use crate::config::QualityConfig;
use crate::peer::TransportCounters;

/// Coarse link quality, ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    High,
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityTier::Low => write!(f, "low"),
            QualityTier::Medium => write!(f, "medium"),
            QualityTier::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualitySample {
    pub peer_id: String,
    pub send_bitrate_kbps: f64,
    pub recv_bitrate_kbps: f64,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub high_kbps: f64,
    pub medium_kbps: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            high_kbps: 1500.0,
            medium_kbps: 700.0,
        }
    }
}

impl Thresholds {
    /// The slower direction governs; both bounds are exclusive.
    pub fn classify(&self, send_kbps: f64, recv_kbps: f64) -> QualityTier {
        let floor = send_kbps.min(recv_kbps);
        if floor > self.high_kbps {
            QualityTier::High
        } else if floor > self.medium_kbps {
            QualityTier::Medium
        } else {
            QualityTier::Low
        }
    }
}

/// Classification with the default 1500/700 kbps thresholds.
pub fn classify(send_kbps: f64, recv_kbps: f64) -> QualityTier {
    Thresholds::default().classify(send_kbps, recv_kbps)
}

/// Turns cumulative per-peer byte counters into bitrate samples and keeps
/// the last tier seen for every peer.
pub struct QualityMonitor {
    thresholds: Thresholds,
    previous: HashMap<String, TransportCounters>,
    tiers: HashMap<String, QualityTier>,
}

impl QualityMonitor {
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            thresholds: Thresholds {
                high_kbps: config.high_kbps,
                medium_kbps: config.medium_kbps,
            },
            previous: HashMap::new(),
            tiers: HashMap::new(),
        }
    }

    /// Returns `None` for the first reading of a peer, which only primes the
    /// baseline, and for readings that do not advance in time.
    pub fn observe(&mut self, peer_id: &str, counters: TransportCounters) -> Option<QualitySample> {
        let previous = self.previous.insert(peer_id.to_string(), counters)?;
        let elapsed = counters.at.checked_duration_since(previous.at)?.as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        let kbps = |now: u64, before: u64| now.saturating_sub(before) as f64 * 8.0 / 1000.0 / elapsed;
        Some(QualitySample {
            peer_id: peer_id.to_string(),
            send_bitrate_kbps: kbps(counters.video_bytes_sent, previous.video_bytes_sent),
            recv_bitrate_kbps: kbps(counters.video_bytes_received, previous.video_bytes_received),
            timestamp: counters.at,
        })
    }

    pub fn record(&mut self, sample: &QualitySample) -> QualityTier {
        let tier = self
            .thresholds
            .classify(sample.send_bitrate_kbps, sample.recv_bitrate_kbps);
        self.tiers.insert(sample.peer_id.clone(), tier);
        tier
    }

    pub fn tier(&self, peer_id: &str) -> Option<QualityTier> {
        self.tiers.get(peer_id).copied()
    }

    /// Worst tier across every peer with at least one sample.
    pub fn worst_tier(&self) -> Option<QualityTier> {
        self.tiers.values().min().copied()
    }

    pub fn forget(&mut self, peer_id: &str) {
        self.previous.remove(peer_id);
        self.tiers.remove(peer_id);
    }

    pub fn clear(&mut self) {
        self.previous.clear();
        self.tiers.clear();
    }
}
