//! Capture devices that produce placeholder tracks.
//!
//! Used by headless clients and tests; each device's response to a
//! permission request is scripted through [`DeviceBehavior`].

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackSource};
use crate::error::{DeviceKind, MediaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceBehavior {
    #[default]
    Grant,
    Deny,
    Missing,
    /// Never answers, like an unanswered permission prompt.
    Hang,
}

#[derive(Debug, Clone, Copy, Default)]
struct Settings {
    camera: DeviceBehavior,
    microphone: DeviceBehavior,
    display: DeviceBehavior,
    display_audio: bool,
}

#[derive(Debug, Default)]
pub struct SyntheticDevices {
    settings: Mutex<Settings>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(self, behavior: DeviceBehavior) -> Self {
        self.settings.lock().camera = behavior;
        self
    }

    pub fn with_microphone(self, behavior: DeviceBehavior) -> Self {
        self.settings.lock().microphone = behavior;
        self
    }

    pub fn with_display(self, behavior: DeviceBehavior) -> Self {
        self.settings.lock().display = behavior;
        self
    }

    /// Whether screen captures include a system audio track.
    pub fn with_display_audio(self, enabled: bool) -> Self {
        self.settings.lock().display_audio = enabled;
        self
    }

    pub fn set_camera(&self, behavior: DeviceBehavior) {
        self.settings.lock().camera = behavior;
    }

    pub fn set_microphone(&self, behavior: DeviceBehavior) {
        self.settings.lock().microphone = behavior;
    }

    pub fn set_display(&self, behavior: DeviceBehavior) {
        self.settings.lock().display = behavior;
    }
}

async fn answer(device: DeviceKind, behavior: DeviceBehavior) -> Result<(), MediaError> {
    match behavior {
        DeviceBehavior::Grant => Ok(()),
        DeviceBehavior::Deny => Err(MediaError::PermissionDenied(device)),
        DeviceBehavior::Missing => Err(MediaError::NotFound(device)),
        DeviceBehavior::Hang => std::future::pending().await,
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaError::Unavailable("no media requested".into()));
        }
        let settings = *self.settings.lock();
        let mut tracks = Vec::new();
        if constraints.audio {
            answer(DeviceKind::Microphone, settings.microphone).await?;
            tracks.push(MediaTrack::new(TrackSource::Microphone));
        }
        if constraints.video {
            answer(DeviceKind::Camera, settings.camera).await?;
            tracks.push(MediaTrack::new(TrackSource::Camera));
        }
        debug!(count = tracks.len(), "synthetic capture granted");
        Ok(MediaStream::new(tracks))
    }

    async fn display_media(&self) -> Result<MediaStream, MediaError> {
        let settings = *self.settings.lock();
        answer(DeviceKind::Display, settings.display).await?;
        let mut tracks = vec![MediaTrack::new(TrackSource::ScreenVideo)];
        if settings.display_audio {
            tracks.push(MediaTrack::new(TrackSource::ScreenAudio));
        }
        Ok(MediaStream::new(tracks))
    }
}
