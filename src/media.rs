//! Local capture stream and camera/microphone toggles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{Error, MediaAccessError, Result};
use crate::metrics::QualityTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Capture resolution and frame rate for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityProfile {
    pub tier: QualityTier,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl QualityProfile {
    pub fn for_tier(tier: QualityTier) -> Self {
        let (width, height, frame_rate) = match tier {
            QualityTier::Low => (320, 240, 15),
            QualityTier::Medium => (640, 480, 24),
            QualityTier::High => (1280, 720, 30),
        };
        Self {
            tier,
            width,
            height,
            frame_rate,
        }
    }
}

/// A captured track. Clones share the same underlying capture; `stop`
/// releases it for every holder.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    profile: QualityProfile,
    sample_track: Arc<TrackLocalStaticSample>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(
        id: impl Into<String>,
        kind: TrackKind,
        profile: QualityProfile,
        sample_track: Arc<TrackLocalStaticSample>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            profile,
            sample_track,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn profile(&self) -> QualityProfile {
        self.profile
    }

    /// The media-transport track samples are written into.
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.sample_track)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            debug!(track_id = %self.id, kind = %self.kind, "local track stopped");
        }
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("tier", &self.profile.tier)
            .field("live", &self.is_live())
            .finish()
    }
}

/// The owned local stream: at most one track per kind.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
}

impl LocalStream {
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    fn slot(&mut self, kind: TrackKind) -> &mut Option<LocalTrack> {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaState {
    pub camera_enabled: bool,
    pub mic_enabled: bool,
    pub local_stream: LocalStream,
}

impl MediaState {
    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.mic_enabled,
            TrackKind::Video => self.camera_enabled,
        }
    }

    fn set_enabled(&mut self, kind: TrackKind, enabled: bool) {
        match kind {
            TrackKind::Audio => self.mic_enabled = enabled,
            TrackKind::Video => self.camera_enabled = enabled,
        }
    }

    pub fn status(&self) -> MediaStatus {
        MediaStatus {
            camera: self.camera_enabled,
            mic: self.mic_enabled,
        }
    }
}

/// Camera/microphone flags as broadcast to the room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStatus {
    pub camera: bool,
    pub mic: bool,
}

/// What a toggle request asks of the caller.
#[derive(Debug, Clone)]
pub enum TrackChange {
    /// Capture must run at this profile; the guard stays held until
    /// `complete_acquire`.
    Acquire(QualityProfile),
    Detached(LocalTrack),
    Unchanged,
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, kind: TrackKind, profile: QualityProfile) -> std::result::Result<LocalTrack, MediaAccessError>;
}

/// Owns the local stream. Capture itself runs outside: every acquisition
/// is claimed here, performed by the caller through `devices()`, and
/// reported back with `complete_acquire`.
pub struct LocalMediaManager {
    devices: Arc<dyn MediaDevices>,
    state: MediaState,
    tier: QualityTier,
    in_flight: HashSet<TrackKind>,
}

impl LocalMediaManager {
    pub fn new(devices: Arc<dyn MediaDevices>, tier: QualityTier) -> Self {
        Self {
            devices,
            state: MediaState::default(),
            tier,
            in_flight: HashSet::new(),
        }
    }

    pub fn state(&self) -> &MediaState {
        &self.state
    }

    pub fn status(&self) -> MediaStatus {
        self.state.status()
    }

    pub fn devices(&self) -> Arc<dyn MediaDevices> {
        Arc::clone(&self.devices)
    }

    pub fn tier(&self) -> QualityTier {
        self.tier
    }

    pub fn profile(&self) -> QualityProfile {
        QualityProfile::for_tier(self.tier)
    }

    /// Profile for a kind: audio ignores adaptation.
    pub fn profile_for(&self, kind: TrackKind) -> QualityProfile {
        match kind {
            TrackKind::Audio => QualityProfile::for_tier(QualityTier::High),
            TrackKind::Video => self.profile(),
        }
    }

    /// Claims the toggle guard for `kind`. Fails while another toggle or
    /// adaptation of the same kind is in flight.
    fn try_begin(&mut self, kind: TrackKind) -> Result<()> {
        if !self.in_flight.insert(kind) {
            return Err(Error::ToggleInProgress(kind));
        }
        Ok(())
    }

    /// Starts capture for each requested kind that is neither live nor
    /// already being acquired. Returns the captures to run.
    pub fn acquire(&mut self, kinds: impl IntoIterator<Item = TrackKind>) -> Vec<(TrackKind, QualityProfile)> {
        let mut started = Vec::new();
        for kind in kinds {
            if self.state.is_enabled(kind) || self.try_begin(kind).is_err() {
                continue;
            }
            started.push((kind, self.profile_for(kind)));
        }
        started
    }

    pub fn set_camera_enabled(&mut self, enabled: bool) -> Result<TrackChange> {
        self.set_enabled(TrackKind::Video, enabled)
    }

    pub fn set_mic_enabled(&mut self, enabled: bool) -> Result<TrackChange> {
        self.set_enabled(TrackKind::Audio, enabled)
    }

    /// Disabling stops and detaches the track at once. Enabling claims the
    /// guard and leaves the capture to the caller.
    pub fn set_enabled(&mut self, kind: TrackKind, enabled: bool) -> Result<TrackChange> {
        if self.state.is_enabled(kind) == enabled {
            return Ok(TrackChange::Unchanged);
        }
        self.try_begin(kind)?;
        if enabled {
            return Ok(TrackChange::Acquire(self.profile_for(kind)));
        }
        let change = self
            .detach(kind)
            .map(TrackChange::Detached)
            .unwrap_or(TrackChange::Unchanged);
        self.in_flight.remove(&kind);
        Ok(change)
    }

    /// Starts re-acquiring video at `tier` under the camera guard. A busy
    /// guard defers the switch; with the camera off only the tier is recorded.
    pub fn begin_adapt(&mut self, tier: QualityTier) -> Option<QualityProfile> {
        if tier == self.tier {
            return None;
        }
        if self.in_flight.contains(&TrackKind::Video) {
            debug!(%tier, "video toggle in flight, adaptation deferred");
            return None;
        }
        if !self.state.camera_enabled {
            self.tier = tier;
            return None;
        }
        self.in_flight.insert(TrackKind::Video);
        Some(QualityProfile::for_tier(tier))
    }

    /// Releases the guard for `kind` and attaches a successful capture.
    /// `adapted` marks a profile switch, which is discarded when the camera
    /// went off meanwhile. Returns the attached track.
    pub fn complete_acquire(
        &mut self,
        kind: TrackKind,
        adapted: Option<QualityTier>,
        result: std::result::Result<LocalTrack, MediaAccessError>,
    ) -> std::result::Result<Option<LocalTrack>, MediaAccessError> {
        self.in_flight.remove(&kind);
        let track = result.map_err(|err| {
            warn!(%kind, error = %err, "capture unavailable");
            err
        })?;
        if let Some(tier) = adapted {
            if !self.state.is_enabled(kind) {
                track.stop();
                return Ok(None);
            }
            info!(%tier, "switching outgoing video profile");
            self.tier = tier;
        }
        self.attach(track.clone());
        Ok(Some(track))
    }

    /// Puts `track` on the stream and marks its kind enabled. A replaced
    /// track is stopped.
    fn attach(&mut self, track: LocalTrack) {
        let kind = track.kind();
        info!(%kind, track_id = %track.id(), tier = %track.profile().tier, "local track attached");
        if let Some(previous) = self.state.local_stream.slot(kind).replace(track) {
            previous.stop();
        }
        self.state.set_enabled(kind, true);
    }

    /// Stops the track of `kind`, removes it from the stream and marks the
    /// kind disabled.
    fn detach(&mut self, kind: TrackKind) -> Option<LocalTrack> {
        self.state.set_enabled(kind, false);
        let track = self.state.local_stream.slot(kind).take()?;
        track.stop();
        info!(%kind, track_id = %track.id(), "local track detached");
        Some(track)
    }

    pub fn stop_all(&mut self) {
        self.detach(TrackKind::Audio);
        self.detach(TrackKind::Video);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use webrtc::api::media_engine::MIME_TYPE_OPUS;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    struct FakeDevices {
        denied: Mutex<HashSet<TrackKind>>,
        acquired: Mutex<Vec<(TrackKind, QualityTier)>>,
    }

    impl FakeDevices {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                denied: Mutex::new(HashSet::new()),
                acquired: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MediaDevices for FakeDevices {
        async fn acquire(&self, kind: TrackKind, profile: QualityProfile) -> std::result::Result<LocalTrack, MediaAccessError> {
            if self.denied.lock().unwrap().contains(&kind) {
                return Err(MediaAccessError::PermissionDenied(kind));
            }
            let mut acquired = self.acquired.lock().unwrap();
            acquired.push((kind, profile.tier));
            let id = format!("{}-{}", kind, acquired.len());
            let sample = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    ..Default::default()
                },
                id.clone(),
                "test".to_owned(),
            ));
            Ok(LocalTrack::new(id, kind, profile, sample))
        }
    }

    /// Runs the captures a manager asked for and reports them back.
    async fn run(manager: &mut LocalMediaManager, started: Vec<(TrackKind, QualityProfile)>) -> Vec<MediaAccessError> {
        let mut failures = Vec::new();
        for (kind, profile) in started {
            let result = manager.devices().acquire(kind, profile).await;
            if let Err(err) = manager.complete_acquire(kind, None, result) {
                failures.push(err);
            }
        }
        failures
    }

    #[tokio::test]
    async fn acquire_fills_stream() {
        let devices = FakeDevices::new();
        let mut manager = LocalMediaManager::new(devices.clone(), QualityTier::Medium);
        let started = manager.acquire([TrackKind::Audio, TrackKind::Video]);
        assert_eq!(started.len(), 2);
        // already claimed
        assert!(manager.acquire([TrackKind::Video]).is_empty());

        assert!(run(&mut manager, started).await.is_empty());
        assert_eq!(manager.state().local_stream.tracks().count(), 2);
        assert!(manager.state().camera_enabled);
        assert!(manager.state().mic_enabled);
        assert!(devices
            .acquired
            .lock()
            .unwrap()
            .contains(&(TrackKind::Video, QualityTier::Medium)));
        // live kinds are not captured twice
        assert!(manager.acquire([TrackKind::Audio, TrackKind::Video]).is_empty());
    }

    #[tokio::test]
    async fn denied_camera_keeps_microphone() {
        let devices = FakeDevices::new();
        devices.denied.lock().unwrap().insert(TrackKind::Video);
        let mut manager = LocalMediaManager::new(devices, QualityTier::High);

        let started = manager.acquire([TrackKind::Audio, TrackKind::Video]);
        let failures = run(&mut manager, started).await;
        assert_eq!(failures, vec![MediaAccessError::PermissionDenied(TrackKind::Video)]);
        assert!(manager.state().mic_enabled);
        assert!(!manager.state().camera_enabled);
        assert!(manager.state().local_stream.track(TrackKind::Video).is_none());
        // the guard was released, so a retry is possible
        assert_eq!(manager.acquire([TrackKind::Video]).len(), 1);
    }

    #[tokio::test]
    async fn disabling_releases_the_track() {
        let mut manager = LocalMediaManager::new(FakeDevices::new(), QualityTier::High);
        let started = manager.acquire([TrackKind::Audio, TrackKind::Video]);
        run(&mut manager, started).await;
        let video = manager.state().local_stream.track(TrackKind::Video).cloned().unwrap();

        match manager.set_camera_enabled(false).unwrap() {
            TrackChange::Detached(track) => assert_eq!(track.id(), video.id()),
            other => panic!("unexpected change {:?}", other),
        }
        assert!(!video.is_live());
        assert!(!manager.state().camera_enabled);
        assert!(manager.state().local_stream.track(TrackKind::Video).is_none());

        let profile = match manager.set_camera_enabled(true).unwrap() {
            TrackChange::Acquire(profile) => profile,
            other => panic!("unexpected change {:?}", other),
        };
        assert!(!manager.state().camera_enabled);
        run(&mut manager, vec![(TrackKind::Video, profile)]).await;
        let fresh = manager.state().local_stream.track(TrackKind::Video).unwrap();
        assert_ne!(fresh.id(), video.id());
        assert!(fresh.is_live());
        assert!(manager.state().camera_enabled);
    }

    #[tokio::test]
    async fn toggle_guard_rejects_overlap() {
        let mut manager = LocalMediaManager::new(FakeDevices::new(), QualityTier::High);
        assert!(matches!(manager.set_mic_enabled(true).unwrap(), TrackChange::Acquire(_)));
        let err = manager.set_mic_enabled(true).unwrap_err();
        assert!(matches!(err, Error::ToggleInProgress(TrackKind::Audio)));

        // other kind is independent
        assert!(matches!(manager.set_camera_enabled(true).unwrap(), TrackChange::Acquire(_)));

        let result = manager.devices().acquire(TrackKind::Audio, manager.profile_for(TrackKind::Audio)).await;
        manager.complete_acquire(TrackKind::Audio, None, result).unwrap();
        assert!(manager.state().mic_enabled);
        assert!(matches!(manager.set_mic_enabled(false).unwrap(), TrackChange::Detached(_)));
    }

    #[tokio::test]
    async fn same_state_is_unchanged() {
        let mut manager = LocalMediaManager::new(FakeDevices::new(), QualityTier::High);
        assert!(matches!(
            manager.set_mic_enabled(false).unwrap(),
            TrackChange::Unchanged
        ));
    }

    #[tokio::test]
    async fn adaptation_waits_for_the_camera_guard() {
        let mut manager = LocalMediaManager::new(FakeDevices::new(), QualityTier::High);
        // camera off: only the tier moves
        assert!(manager.begin_adapt(QualityTier::Medium).is_none());
        assert_eq!(manager.tier(), QualityTier::Medium);

        let started = manager.acquire([TrackKind::Video]);
        assert!(manager.begin_adapt(QualityTier::Low).is_none());
        run(&mut manager, started).await;

        let profile = manager.begin_adapt(QualityTier::Low).unwrap();
        assert!(matches!(
            manager.set_camera_enabled(false),
            Err(Error::ToggleInProgress(TrackKind::Video))
        ));
        let result = manager.devices().acquire(TrackKind::Video, profile).await;
        let track = manager
            .complete_acquire(TrackKind::Video, Some(QualityTier::Low), result)
            .unwrap()
            .unwrap();
        assert_eq!(track.profile().tier, QualityTier::Low);
        assert_eq!(manager.tier(), QualityTier::Low);
        assert_eq!(manager.state().local_stream.track(TrackKind::Video).unwrap().id(), track.id());
    }

    #[tokio::test]
    async fn adapted_capture_is_dropped_once_the_camera_is_off() {
        let mut manager = LocalMediaManager::new(FakeDevices::new(), QualityTier::High);
        let started = manager.acquire([TrackKind::Video]);
        run(&mut manager, started).await;
        let profile = manager.begin_adapt(QualityTier::Low).unwrap();
        let result = manager.devices().acquire(TrackKind::Video, profile).await;
        manager.stop_all();

        let late = result.unwrap();
        let outcome = manager
            .complete_acquire(TrackKind::Video, Some(QualityTier::Low), Ok(late.clone()))
            .unwrap();
        assert!(outcome.is_none());
        assert!(!late.is_live());
        assert_eq!(manager.tier(), QualityTier::High);
    }

    #[test]
    fn profiles_grow_with_tier() {
        let low = QualityProfile::for_tier(QualityTier::Low);
        let high = QualityProfile::for_tier(QualityTier::High);
        assert!(low.width < high.width);
        assert!(low.frame_rate < high.frame_rate);
    }
}
