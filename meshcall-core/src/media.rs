//! Local and remote media
//!
//! The local capture stream is owned by the call session. Peer links only
//! ever see [`TrackRef`]s, which are weak handles: dropping or stopping the
//! session's stream releases the hardware no matter how many links still
//! reference its tracks.
//!
//! Device access itself is an external collaborator behind [`MediaSource`].

use crate::types::MediaConstraints;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused capture
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No usable device
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A track was used after it had been stopped
    #[error("Track ended: {0}")]
    TrackEnded(String),
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    /// Audio
    Audio,
    /// Video (camera or screen)
    Video,
}

/// Where a local track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackSource {
    /// Microphone
    Microphone,
    /// Camera
    Camera,
    /// Screen capture
    Screen,
}

impl TrackSource {
    /// Kind of track this source produces
    pub fn kind(&self) -> TrackKind {
        match self {
            Self::Microphone => TrackKind::Audio,
            Self::Camera | Self::Screen => TrackKind::Video,
        }
    }
}

/// A captured local track
///
/// `enabled` is the mute switch (track keeps running, sends silence/black);
/// `live` goes false once the track is stopped and the device released.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    stream_id: String,
    source: TrackSource,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack {
    /// Create a live, enabled track
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, source: TrackSource) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            source,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    /// Track id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the stream the track belongs to
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Capture source
    pub fn source(&self) -> TrackSource {
        self.source
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    /// Whether the track is sending real media
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable or mute the track
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether the device is still captured
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Stop capture; idempotent
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            tracing::debug!(track_id = %self.id, source = ?self.source, "Stopped local track");
        }
    }
}

/// Non-owning handle on a local track, held by peer links
#[derive(Debug, Clone)]
pub struct TrackRef {
    id: String,
    kind: TrackKind,
    track: Weak<MediaTrack>,
}

impl TrackRef {
    /// Borrow a handle from an owned track
    pub fn from_track(track: &Arc<MediaTrack>) -> Self {
        Self {
            id: track.id().to_string(),
            kind: track.kind(),
            track: Arc::downgrade(track),
        }
    }

    /// Id of the referenced track
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Kind of the referenced track
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Resolve to the track while its owner keeps it alive and running
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::TrackEnded`] once the owner dropped or stopped it
    pub fn upgrade(&self) -> Result<Arc<MediaTrack>, MediaError> {
        self.track
            .upgrade()
            .filter(|track| track.is_live())
            .ok_or_else(|| MediaError::TrackEnded(self.id.clone()))
    }
}

/// The session-owned local capture stream
#[derive(Debug)]
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl LocalMediaStream {
    /// Wrap captured tracks
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Stream id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Owned tracks
    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    /// Non-owning handles on every track, for attaching to a link
    pub fn track_refs(&self) -> Vec<TrackRef> {
        self.tracks.iter().map(TrackRef::from_track).collect()
    }

    /// First audio track
    pub fn audio_track(&self) -> Option<&Arc<MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    /// First camera track
    pub fn video_track(&self) -> Option<&Arc<MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
        tracing::debug!(stream_id = %self.id, tracks = self.tracks.len(), "Local stream stopped");
    }
}

impl Drop for LocalMediaStream {
    fn drop(&mut self) {
        // Capture must never outlive the owning session.
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// A remote participant's media as delivered by their link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    /// Stream id announced by the remote side
    pub id: String,
    /// Ids of the tracks received so far
    pub track_ids: Vec<String>,
}

impl RemoteStream {
    /// Build a remote stream record
    pub fn new(id: impl Into<String>, track_ids: Vec<String>) -> Self {
        Self {
            id: id.into(),
            track_ids,
        }
    }
}

/// Local capture devices
///
/// Acquisition is the only user-mediated suspension point of the call flow
/// (permission prompts), so implementations may take arbitrarily long.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Capture camera and/or microphone
    async fn acquire_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaStream, MediaError>;

    /// Capture the screen for sharing; returns the video track
    async fn acquire_display_media(&self) -> Result<Arc<MediaTrack>, MediaError>;
}
