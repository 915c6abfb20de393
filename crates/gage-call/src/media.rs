//! Local media acquisition and the media bundle types shared with the UI.
//!
//! Capture itself sits behind [`MediaDevices`]; a desktop shell plugs in the
//! platform camera/microphone, the CLI and tests use
//! [`SyntheticDevices`](crate::synthetic::SyntheticDevices).

use async_trait::async_trait;
use gage_common::{CallError, CallResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// What kind of call is being placed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    #[default]
    #[serde(alias = "AUDIO")]
    Audio,
    #[serde(alias = "VIDEO")]
    Video,
}

impl CallKind {
    pub fn wants_video(self) -> bool {
        self == CallKind::Video
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallKind::Audio => write!(f, "audio"),
            CallKind::Video => write!(f, "video"),
        }
    }
}

/// Kind of a single media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    #[serde(alias = "AUDIO")]
    Audio,
    #[serde(alias = "VIDEO")]
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Handle to one captured or received track. Clones share the live flag.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    live: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Stop the track. Idempotent.
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            tracing::trace!(track = %self.id, kind = %self.kind, "Track stopped");
        }
    }
}

/// A set of tracks that belong together (one local capture, or everything
/// received from one remote participant).
#[derive(Debug, Clone)]
pub struct MediaBundle {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaBundle {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Add a track, replacing any existing track of the same kind.
    pub fn upsert_track(&mut self, track: MediaTrack) {
        if let Some(old) = self.tracks.iter_mut().find(|t| t.kind() == track.kind()) {
            old.stop();
            *old = track;
        } else {
            self.tracks.push(track);
        }
    }

    pub fn live_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.is_live())
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

// ----------------------------------------------------------------------------
// Constraints
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub channel_count: u8,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            channel_count: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub ideal_frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            ideal_frame_rate: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    /// `None` requests microphone only.
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn for_call(kind: CallKind) -> Self {
        Self {
            audio: AudioConstraints::default(),
            video: kind.wants_video().then(VideoConstraints::default),
        }
    }
}

/// Platform capture backend.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture according to `constraints`. Failures must be
    /// [`CallError::PermissionDenied`] or [`CallError::DeviceUnavailable`].
    async fn get_user_media(&self, constraints: &MediaConstraints) -> CallResult<MediaBundle>;
}

/// Requests local capture for a call.
#[derive(Clone)]
pub struct MediaAcquisition {
    devices: Arc<dyn MediaDevices>,
}

impl MediaAcquisition {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    /// Release `previous` (if any), then capture fresh media for `kind`.
    ///
    /// Errors are never retried here; the caller reports them to the user.
    pub async fn acquire(
        &self,
        kind: CallKind,
        previous: Option<MediaBundle>,
    ) -> CallResult<MediaBundle> {
        if let Some(previous) = previous {
            previous.stop();
            tracing::debug!(bundle = %previous.id(), "Released previous local media");
        }

        let constraints = MediaConstraints::for_call(kind);
        match self.devices.get_user_media(&constraints).await {
            Ok(bundle) => {
                tracing::info!(
                    bundle = %bundle.id(),
                    kind = %kind,
                    tracks = bundle.tracks().len(),
                    "Local media acquired"
                );
                Ok(bundle)
            }
            Err(e) if e.is_media_failure() => {
                tracing::warn!(kind = %kind, code = e.error_code(), "Media acquisition failed: {e}");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(kind = %kind, "Media backend error: {e}");
                Err(CallError::DeviceUnavailable(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_call_requests_microphone_only() {
        let constraints = MediaConstraints::for_call(CallKind::Audio);
        assert!(constraints.video.is_none());
        assert_eq!(constraints.audio.channel_count, 2);
        assert!(constraints.audio.echo_cancellation);
    }

    #[test]
    fn test_video_call_requests_720p30() {
        let constraints = MediaConstraints::for_call(CallKind::Video);
        let video = constraints.video.expect("video requested");
        assert_eq!((video.ideal_width, video.ideal_height, video.ideal_frame_rate), (1280, 720, 30));
    }

    #[test]
    fn test_stopping_a_clone_stops_the_track() {
        let track = MediaTrack::new(TrackKind::Audio, "mic");
        let clone = track.clone();
        clone.stop();
        assert!(!track.is_live());
    }

    #[test]
    fn test_upsert_replaces_same_kind() {
        let mut bundle = MediaBundle::new(vec![]);
        let first = MediaTrack::new(TrackKind::Video, "cam-1");
        bundle.upsert_track(first.clone());
        bundle.upsert_track(MediaTrack::new(TrackKind::Video, "cam-2"));
        assert_eq!(bundle.tracks().len(), 1);
        assert!(!first.is_live());
        assert_eq!(bundle.track(TrackKind::Video).unwrap().label(), "cam-2");
    }
}
