use meet_proto::ProtoError;
use std::fmt;
use thiserror::Error;

/// Capture device a permission or lookup failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Camera,
    Microphone,
    Display,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Camera => "camera",
            DeviceKind::Microphone => "microphone",
            DeviceKind::Display => "screen capture",
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("{0} permission denied")]
    PermissionDenied(DeviceKind),
    #[error("no {0} available")]
    NotFound(DeviceKind),
    #[error("media unavailable: {0}")]
    Unavailable(String),
}

impl MediaError {
    pub fn device(&self) -> Option<DeviceKind> {
        match self {
            MediaError::PermissionDenied(device) | MediaError::NotFound(device) => Some(*device),
            MediaError::Unavailable(_) => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("rejected by media stack: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum MeetError {
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtoError),
}
