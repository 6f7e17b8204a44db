//! Media capability boundary.
//!
//! Capture devices and their platform quirks live outside this crate.
//! The core asks a [`MediaProvider`] for a stream in a given mode and gets
//! back an opaque [`LocalMedia`] handle it can attach, toggle, and stop.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::state::CallMode;

/// Kind of a media track within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed media acquisition failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("camera/microphone permission denied")]
    PermissionDenied,

    #[error("capture device not found")]
    DeviceNotFound,

    #[error("media capture failed: {0}")]
    Capture(String),
}

/// A local capture stream owned by the session.
///
/// Implementations wrap whatever the platform hands out. `stop` releases
/// the underlying devices and must be idempotent; the core may call it from
/// a detached task when an acquisition resolves after its session died.
pub trait LocalMedia: Send + Sync {
    /// Flip a track's enabled flag. Returns false when the stream has no
    /// track of that kind (the toggle is then a no-op).
    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> bool;

    fn has_track(&self, kind: TrackKind) -> bool;

    /// Stop capture and release devices.
    fn stop(&self);
}

/// Yields local media streams for a requested call mode.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Acquire local media. May prompt the user for permission and take
    /// arbitrarily long; the core treats this as a cancellation-aware
    /// suspension point.
    async fn acquire(&self, mode: CallMode) -> Result<Arc<dyn LocalMedia>, MediaError>;
}

/// Opaque handle to a track delivered by the remote peer, passed through to
/// the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackHandle {
    pub kind: TrackKind,
    pub id: String,
}

impl RemoteTrackHandle {
    pub fn new(kind: TrackKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}
