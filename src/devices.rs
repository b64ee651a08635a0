//! `MediaDevices` backed by `TrackLocalStaticSample`.
//!
//! Encoded frames come from an external capture pipeline: every acquired
//! track is announced on a broadcast channel, and the producer writes samples
//! into `LocalTrack::sample_track()` until the track stops being live.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::MediaAccessError;
use crate::media::{LocalTrack, MediaDevices, QualityProfile, TrackKind};

pub struct SampleTrackDevices {
    stream_id: String,
    available: Mutex<HashSet<TrackKind>>,
    announce: broadcast::Sender<LocalTrack>,
}

impl SampleTrackDevices {
    pub fn new(stream_id: impl Into<String>) -> Self {
        let (announce, _) = broadcast::channel(16);
        Self {
            stream_id: stream_id.into(),
            available: Mutex::new([TrackKind::Audio, TrackKind::Video].into_iter().collect()),
            announce,
        }
    }

    /// Marks a device kind as present or absent, e.g. on hot-unplug.
    pub fn set_available(&self, kind: TrackKind, available: bool) {
        if let Ok(mut set) = self.available.lock() {
            if available {
                set.insert(kind);
            } else {
                set.remove(&kind);
            }
        }
    }

    /// Receives every track handed out from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LocalTrack> {
        self.announce.subscribe()
    }

    fn codec(kind: TrackKind) -> RTCRtpCodecCapability {
        match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl MediaDevices for SampleTrackDevices {
    async fn acquire(&self, kind: TrackKind, profile: QualityProfile) -> Result<LocalTrack, MediaAccessError> {
        let present = self
            .available
            .lock()
            .map_err(|_| MediaAccessError::Device("device registry poisoned".into()))?
            .contains(&kind);
        if !present {
            return Err(MediaAccessError::NoDevice(kind));
        }

        let id = format!("{}-{:08x}", kind, rand::random::<u32>());
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            Self::codec(kind),
            id.clone(),
            self.stream_id.clone(),
        ));
        let track = LocalTrack::new(id, kind, profile, sample_track);
        debug!(
            track_id = %track.id(),
            %kind,
            width = profile.width,
            height = profile.height,
            fps = profile.frame_rate,
            "capture track acquired"
        );
        // No subscriber is fine: the track simply carries no samples yet.
        let _ = self.announce.send(track.clone());
        Ok(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::QualityTier;
    use webrtc::track::track_local::TrackLocal;

    #[tokio::test]
    async fn acquired_tracks_are_announced() {
        let devices = SampleTrackDevices::new("local");
        let mut announced = devices.subscribe();

        let track = devices
            .acquire(TrackKind::Video, QualityProfile::for_tier(QualityTier::Low))
            .await
            .unwrap();
        assert_eq!(track.kind(), TrackKind::Video);
        assert_eq!(track.sample_track().stream_id(), "local");
        assert_eq!(announced.recv().await.unwrap().id(), track.id());
    }

    #[tokio::test]
    async fn missing_device_is_reported() {
        let devices = SampleTrackDevices::new("local");
        devices.set_available(TrackKind::Audio, false);
        let err = devices
            .acquire(TrackKind::Audio, QualityProfile::for_tier(QualityTier::High))
            .await
            .unwrap_err();
        assert_eq!(err, MediaAccessError::NoDevice(TrackKind::Audio));
    }
}
