//! Local capture devices and the tracks fed into every peer session.
//!
//! [`LocalMediaManager`] is the only owner allowed to stop or swap tracks.
//! Peer sessions receive `Arc<MediaTrack>` handles and may read or attach
//! them, but [`MediaTrack::stop`] is crate-private and only called from here.

pub mod synthetic;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DeviceKind, MediaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    ScreenVideo,
    ScreenAudio,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone | TrackSource::ScreenAudio => TrackKind::Audio,
            TrackSource::Camera | TrackSource::ScreenVideo => TrackKind::Video,
        }
    }
}

#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    source: TrackSource,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack {
    pub fn new(source: TrackSource) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            source,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    /// Muted tracks stay attached and keep their sender; they just carry
    /// silence or black frames.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn first_live(&self, kind: TrackKind) -> Option<&Arc<MediaTrack>> {
        self.tracks
            .iter()
            .find(|track| track.kind() == kind && track.is_live())
    }

    /// Lookup by origin, live or not.
    pub fn by_source(&self, source: TrackSource) -> Option<&Arc<MediaTrack>> {
        self.tracks.iter().find(|track| track.source() == source)
    }

    fn push(&mut self, track: Arc<MediaTrack>) {
        self.tracks.push(track);
    }

    fn remove(&mut self, id: &str) {
        self.tracks.retain(|track| track.id() != id);
    }

    fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

/// Platform capture API (getUserMedia / getDisplayMedia equivalents).
/// Either call may stay pending while the user answers a permission prompt.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError>;
    async fn display_media(&self) -> Result<MediaStream, MediaError>;
}

/// What changed locally, for the peer sessions to mirror.
#[derive(Debug, Clone)]
pub enum MediaChange {
    TrackEnabled {
        track: Arc<MediaTrack>,
        enabled: bool,
    },
    TrackAdded(Arc<MediaTrack>),
    TrackReplaced {
        old: Arc<MediaTrack>,
        new: Arc<MediaTrack>,
    },
    TrackRemoved(Arc<MediaTrack>),
}

impl MediaChange {
    pub fn requires_renegotiation(&self) -> bool {
        !matches!(self, MediaChange::TrackEnabled { .. })
    }
}

#[derive(Debug, Default)]
pub struct AcquireOutcome {
    pub changes: Vec<MediaChange>,
    pub errors: Vec<MediaError>,
}

#[derive(Debug, Default)]
struct LocalMediaState {
    camera: Option<MediaStream>,
    screen: Option<MediaStream>,
    audio_enabled: bool,
    video_enabled: bool,
    /// Microphone intent captured when sharing began.
    pre_share_audio: Option<bool>,
}

pub struct LocalMediaManager {
    devices: Arc<dyn MediaDevices>,
    state: LocalMediaState,
}

impl LocalMediaManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            state: LocalMediaState::default(),
        }
    }

    pub fn audio_enabled(&self) -> bool {
        self.state.audio_enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.state.video_enabled
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.state.screen.is_some()
    }

    pub fn camera_stream(&self) -> Option<&MediaStream> {
        self.state.camera.as_ref()
    }

    pub fn screen_stream(&self) -> Option<&MediaStream> {
        self.state.screen.as_ref()
    }

    fn camera_track(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        self.state
            .camera
            .as_ref()
            .and_then(|stream| stream.first_live(kind))
            .cloned()
    }

    fn screen_track(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        self.state
            .screen
            .as_ref()
            .and_then(|stream| stream.first_live(kind))
            .cloned()
    }

    /// Tracks a new peer session should carry right now.
    pub fn outgoing_tracks(&self) -> Vec<Arc<MediaTrack>> {
        let mut tracks = Vec::new();
        tracks.extend(self.camera_track(TrackKind::Audio));
        match self.screen_track(TrackKind::Video) {
            Some(screen) => tracks.push(screen),
            None => tracks.extend(self.camera_track(TrackKind::Video)),
        }
        tracks.extend(self.screen_track(TrackKind::Audio));
        tracks
    }

    /// Request camera and microphone, degrading per device instead of failing
    /// the whole request. A failed device leaves its capability disabled.
    pub async fn acquire(&mut self, audio_wanted: bool, video_wanted: bool) -> AcquireOutcome {
        let mut outcome = AcquireOutcome::default();
        if !audio_wanted && !video_wanted {
            return outcome;
        }
        if audio_wanted {
            self.state.audio_enabled = true;
        }
        if video_wanted {
            self.state.video_enabled = true;
        }

        let combined = self
            .devices
            .user_media(MediaConstraints {
                audio: audio_wanted,
                video: video_wanted,
            })
            .await;

        let stream = match combined {
            Ok(stream) => Some(stream),
            Err(err) if audio_wanted && video_wanted => {
                debug!(error = %err, "combined capture failed; retrying per device");
                let mut merged = Vec::new();
                for (constraints, device) in [
                    (MediaConstraints { audio: true, video: false }, DeviceKind::Microphone),
                    (MediaConstraints { audio: false, video: true }, DeviceKind::Camera),
                ] {
                    match self.devices.user_media(constraints).await {
                        Ok(stream) => merged.extend(stream.tracks().iter().cloned()),
                        Err(err) => {
                            self.disable(device);
                            outcome.errors.push(err);
                        }
                    }
                }
                (!merged.is_empty()).then(|| MediaStream::new(merged))
            }
            Err(err) => {
                self.disable(if audio_wanted {
                    DeviceKind::Microphone
                } else {
                    DeviceKind::Camera
                });
                outcome.errors.push(err);
                None
            }
        };

        if let Some(stream) = stream {
            for track in stream.tracks() {
                self.adopt_camera_track(track.clone(), &mut outcome.changes);
            }
        }
        for err in &outcome.errors {
            warn!(error = %err, "media capability disabled");
        }
        outcome
    }

    fn disable(&mut self, device: DeviceKind) {
        match device {
            DeviceKind::Microphone => self.state.audio_enabled = false,
            DeviceKind::Camera => self.state.video_enabled = false,
            DeviceKind::Display => {}
        }
    }

    /// Insert a freshly captured camera/microphone track, replacing any
    /// previous track of the same kind.
    fn adopt_camera_track(&mut self, track: Arc<MediaTrack>, changes: &mut Vec<MediaChange>) {
        let kind = track.kind();
        let intent = match kind {
            TrackKind::Audio => self.state.audio_enabled,
            TrackKind::Video => self.state.video_enabled,
        };
        track.set_enabled(intent);

        let previous = self.camera_track(kind);
        let camera = self.state.camera.get_or_insert_with(MediaStream::default);
        if let Some(previous) = previous.as_ref() {
            previous.stop();
            camera.remove(previous.id());
        }
        camera.push(track.clone());

        // While sharing, the screen owns the outgoing video slot.
        let screen_holds_slot =
            kind == TrackKind::Video && self.screen_track(TrackKind::Video).is_some();
        if screen_holds_slot {
            return;
        }
        changes.push(match previous {
            Some(old) => MediaChange::TrackReplaced { old, new: track },
            None => MediaChange::TrackAdded(track),
        });
    }

    /// Flip the first live track of `kind`, or acquire one if there is none.
    pub async fn toggle(&mut self, kind: TrackKind) -> Result<Vec<MediaChange>, MediaError> {
        if let Some(track) = self.camera_track(kind) {
            let enabled = !track.is_enabled();
            track.set_enabled(enabled);
            match kind {
                TrackKind::Audio => self.state.audio_enabled = enabled,
                TrackKind::Video => self.state.video_enabled = enabled,
            }
            info!(?kind, enabled, "toggled local track");
            return Ok(vec![MediaChange::TrackEnabled { track, enabled }]);
        }

        let outcome = match kind {
            TrackKind::Audio => self.acquire(true, false).await,
            TrackKind::Video => self.acquire(false, true).await,
        };
        match outcome.errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(outcome.changes),
        }
    }

    pub async fn start_screen_share(&mut self) -> Result<Vec<MediaChange>, MediaError> {
        if self.state.screen.is_some() {
            return Ok(Vec::new());
        }
        let stream = self.devices.display_media().await?;
        let Some(display_video) = stream.first_live(TrackKind::Video).cloned() else {
            stream.stop_all();
            return Err(MediaError::NotFound(DeviceKind::Display));
        };
        let display_audio = stream.first_live(TrackKind::Audio).cloned();

        let mut changes = Vec::new();
        match self.camera_track(TrackKind::Video) {
            Some(camera) => changes.push(MediaChange::TrackReplaced {
                old: camera,
                new: display_video,
            }),
            None => changes.push(MediaChange::TrackAdded(display_video)),
        }

        self.state.pre_share_audio = Some(self.state.audio_enabled);
        if let Some(display_audio) = display_audio {
            // Shared system audio would echo through an open microphone.
            if let Some(mic) = self.camera_track(TrackKind::Audio) {
                if mic.is_enabled() {
                    mic.set_enabled(false);
                    changes.push(MediaChange::TrackEnabled {
                        track: mic,
                        enabled: false,
                    });
                }
            }
            self.state.audio_enabled = false;
            changes.push(MediaChange::TrackAdded(display_audio));
        }

        self.state.screen = Some(stream);
        info!("screen share started");
        Ok(changes)
    }

    pub fn stop_screen_share(&mut self) -> Vec<MediaChange> {
        let Some(stream) = self.state.screen.take() else {
            return Vec::new();
        };
        // The capture side may have ended these already; peers still carry them.
        let display_video = stream.by_source(TrackSource::ScreenVideo).cloned();
        let display_audio = stream.by_source(TrackSource::ScreenAudio).cloned();
        stream.stop_all();

        let mut changes = Vec::new();
        if let Some(display_video) = display_video {
            match self.camera_track(TrackKind::Video) {
                Some(camera) => changes.push(MediaChange::TrackReplaced {
                    old: display_video,
                    new: camera,
                }),
                None => changes.push(MediaChange::TrackRemoved(display_video)),
            }
        }
        if let Some(display_audio) = display_audio {
            changes.push(MediaChange::TrackRemoved(display_audio));
        }

        if let Some(previous) = self.state.pre_share_audio.take() {
            self.state.audio_enabled = previous;
            if let Some(mic) = self.camera_track(TrackKind::Audio) {
                if mic.is_enabled() != previous {
                    mic.set_enabled(previous);
                    changes.push(MediaChange::TrackEnabled {
                        track: mic,
                        enabled: previous,
                    });
                }
            }
        }
        info!("screen share stopped");
        changes
    }

    /// Stop every local track. Synchronous so it can run from `Drop`.
    pub fn stop_all(&mut self) {
        if let Some(camera) = self.state.camera.take() {
            camera.stop_all();
        }
        if let Some(screen) = self.state.screen.take() {
            screen.stop_all();
        }
        self.state.pre_share_audio = None;
    }
}

#[cfg(test)]
mod tests {
    use super::synthetic::{DeviceBehavior, SyntheticDevices};
    use super::*;

    fn manager(devices: SyntheticDevices) -> (LocalMediaManager, Arc<SyntheticDevices>) {
        let devices = Arc::new(devices);
        (LocalMediaManager::new(devices.clone()), devices)
    }

    #[test_timeout::tokio_timeout_test]
    async fn acquire_grants_both_tracks() {
        let (mut media, _) = manager(SyntheticDevices::new());
        let outcome = media.acquire(true, true).await;
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.changes.len(), 2);
        assert!(media.audio_enabled());
        assert!(media.video_enabled());
        assert_eq!(media.outgoing_tracks().len(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn denied_camera_falls_back_to_audio() {
        let (mut media, _) =
            manager(SyntheticDevices::new().with_camera(DeviceBehavior::Deny));
        let outcome = media.acquire(true, true).await;
        assert_eq!(
            outcome.errors,
            vec![MediaError::PermissionDenied(DeviceKind::Camera)]
        );
        assert!(media.audio_enabled());
        assert!(!media.video_enabled());
        let tracks = media.outgoing_tracks();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].kind(), TrackKind::Audio);
    }

    #[test_timeout::tokio_timeout_test]
    async fn denied_microphone_keeps_camera() {
        let (mut media, _) =
            manager(SyntheticDevices::new().with_microphone(DeviceBehavior::Deny));
        let outcome = media.acquire(true, true).await;
        assert_eq!(
            outcome.errors,
            vec![MediaError::PermissionDenied(DeviceKind::Microphone)]
        );
        assert!(!media.audio_enabled());
        assert!(media.video_enabled());
    }

    #[test_timeout::tokio_timeout_test]
    async fn toggle_flips_enabled_without_new_tracks() {
        let (mut media, _) = manager(SyntheticDevices::new());
        media.acquire(true, true).await;
        let changes = media.toggle(TrackKind::Audio).await.unwrap();
        assert!(matches!(
            &changes[..],
            [MediaChange::TrackEnabled { enabled: false, .. }]
        ));
        assert!(!changes[0].requires_renegotiation());
        assert!(!media.audio_enabled());
        media.toggle(TrackKind::Audio).await.unwrap();
        assert!(media.audio_enabled());
    }

    #[test_timeout::tokio_timeout_test]
    async fn toggle_without_track_acquires_one() {
        let (mut media, devices) =
            manager(SyntheticDevices::new().with_camera(DeviceBehavior::Deny));
        media.acquire(true, true).await;
        assert!(!media.video_enabled());

        devices.set_camera(DeviceBehavior::Grant);
        let changes = media.toggle(TrackKind::Video).await.unwrap();
        assert!(matches!(&changes[..], [MediaChange::TrackAdded(t)] if t.kind() == TrackKind::Video));
        assert!(media.video_enabled());
    }

    #[test_timeout::tokio_timeout_test]
    async fn screen_share_replaces_camera_video() {
        let (mut media, _) = manager(SyntheticDevices::new());
        media.acquire(true, true).await;
        let camera = media.camera_track(TrackKind::Video).unwrap();

        let changes = media.start_screen_share().await.unwrap();
        assert!(matches!(
            &changes[0],
            MediaChange::TrackReplaced { old, new }
                if old.id() == camera.id() && new.source() == TrackSource::ScreenVideo
        ));
        assert!(media
            .outgoing_tracks()
            .iter()
            .any(|t| t.source() == TrackSource::ScreenVideo));

        let changes = media.stop_screen_share();
        assert!(matches!(
            &changes[0],
            MediaChange::TrackReplaced { new, .. } if new.id() == camera.id()
        ));
        assert!(camera.is_live());
        assert!(media.screen_stream().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn screen_share_restores_pre_share_microphone_state() {
        for initially_muted in [false, true] {
            let (mut media, _) =
                manager(SyntheticDevices::new().with_display_audio(true));
            media.acquire(true, true).await;
            if initially_muted {
                media.toggle(TrackKind::Audio).await.unwrap();
            }
            let before = media.audio_enabled();

            media.start_screen_share().await.unwrap();
            assert!(!media.audio_enabled());
            media.stop_screen_share();

            assert_eq!(media.audio_enabled(), before);
            let mic = media.camera_track(TrackKind::Audio).unwrap();
            assert_eq!(mic.is_enabled(), before);
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn unmuting_during_share_is_undone_on_stop() {
        let (mut media, _) = manager(SyntheticDevices::new().with_display_audio(true));
        media.acquire(true, true).await;
        media.toggle(TrackKind::Audio).await.unwrap();
        media.start_screen_share().await.unwrap();
        media.toggle(TrackKind::Audio).await.unwrap();
        assert!(media.audio_enabled());
        media.stop_screen_share();
        assert!(!media.audio_enabled());
    }

    #[test_timeout::tokio_timeout_test]
    async fn reacquiring_camera_drops_the_stopped_track() {
        let (mut media, _) = manager(SyntheticDevices::new());
        media.acquire(true, true).await;
        let first = media.camera_track(TrackKind::Video).unwrap();
        for _ in 0..3 {
            let outcome = media.acquire(false, true).await;
            assert!(matches!(&outcome.changes[..], [MediaChange::TrackReplaced { .. }]));
        }
        let camera = media.camera_stream().unwrap();
        assert_eq!(camera.tracks().len(), 2);
        assert!(camera.tracks().iter().all(|t| t.is_live()));
        assert!(!first.is_live());
    }

    #[test_timeout::tokio_timeout_test]
    async fn ended_display_track_is_still_withdrawn_on_stop() {
        let (mut media, _) = manager(SyntheticDevices::new().with_display_audio(true));
        media.acquire(true, true).await;
        let camera = media.camera_track(TrackKind::Video).unwrap();
        media.start_screen_share().await.unwrap();
        let screen = media.screen_stream().unwrap();
        let display_video = screen.by_source(TrackSource::ScreenVideo).cloned().unwrap();
        let display_audio = screen.by_source(TrackSource::ScreenAudio).cloned().unwrap();
        display_video.stop();
        display_audio.stop();

        let changes = media.stop_screen_share();
        assert!(changes.iter().any(|c| matches!(
            c,
            MediaChange::TrackReplaced { old, new }
                if old.id() == display_video.id() && new.id() == camera.id()
        )));
        assert!(changes.iter().any(
            |c| matches!(c, MediaChange::TrackRemoved(t) if t.id() == display_audio.id())
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn denied_screen_share_changes_nothing() {
        let (mut media, _) =
            manager(SyntheticDevices::new().with_display(DeviceBehavior::Deny));
        media.acquire(true, true).await;
        let err = media.start_screen_share().await.unwrap_err();
        assert_eq!(err, MediaError::PermissionDenied(DeviceKind::Display));
        assert!(!media.is_sharing_screen());
        assert!(media.audio_enabled());
    }

    #[test_timeout::tokio_timeout_test]
    async fn stop_all_ends_every_track() {
        let (mut media, _) = manager(SyntheticDevices::new());
        media.acquire(true, true).await;
        media.start_screen_share().await.unwrap();
        let mut tracks = media.outgoing_tracks();
        tracks.extend(media.camera_stream().unwrap().tracks().iter().cloned());
        media.stop_all();
        assert!(tracks.iter().all(|t| !t.is_live()));
        assert!(media.outgoing_tracks().is_empty());
    }
}
