//! Local and remote media streams
//!
//! Streams are cheap-clone handles: the UI and the peer session hold the same
//! underlying tracks, so muting through one handle is visible through all.

pub mod devices;

pub use devices::{CaptureDevice, MediaAcquisition, MediaDevices, SyntheticDevices};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use devices::DeviceLease;

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// SDP media type (`m=` line) for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured audio or video track
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub(crate) fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: format!("{}-{}", kind, uuid::Uuid::new_v4()),
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Label of the capture device backing this track
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the track currently produces media (false = muted)
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Whether capture has been stopped for good
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
        self.stopped.store(true, Ordering::Release);
    }
}

struct LocalStreamInner {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
    released: AtomicBool,
    lease: Mutex<Option<DeviceLease>>,
}

impl LocalStreamInner {
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        for track in &self.tracks {
            track.stop();
        }
        // Dropping the lease frees the capture devices for the next call
        self.lease.lock().take();
        debug!("Released local stream {}", self.id);
        true
    }
}

impl Drop for LocalStreamInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Locally captured media, shared between the UI and the peer session
///
/// The capture devices stay locked until the stream is released, either
/// explicitly or when the last handle is dropped.
#[derive(Clone)]
pub struct LocalStream {
    inner: Arc<LocalStreamInner>,
}

impl LocalStream {
    pub(crate) fn new(tracks: Vec<LocalTrack>, lease: DeviceLease) -> Self {
        Self {
            inner: Arc::new(LocalStreamInner {
                id: uuid::Uuid::new_v4().to_string(),
                tracks: tracks.into_iter().map(Arc::new).collect(),
                released: AtomicBool::new(false),
                lease: Mutex::new(Some(lease)),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.inner.tracks.clone()
    }

    /// First track of the given kind
    pub fn track(&self, kind: TrackKind) -> Option<Arc<LocalTrack>> {
        self.inner.tracks.iter().find(|t| t.kind() == kind).cloned()
    }

    pub fn track_count(&self) -> usize {
        self.inner.tracks.len()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.inner.tracks.iter().any(|t| t.kind() == kind)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Enable or disable every track of `kind` without stopping capture
    ///
    /// Returns the number of tracks affected.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
        let mut changed = 0;
        for track in self.inner.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            changed += 1;
        }
        changed
    }

    /// Stop all tracks and free the capture devices
    ///
    /// Returns `false` if the stream was already released.
    pub fn release(&self) -> bool {
        self.inner.release()
    }

    /// Whether both handles refer to the same stream
    pub fn same_stream(&self, other: &LocalStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.len())
            .field("released", &self.is_released())
            .finish()
    }
}

/// A track received from the remote participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// Remote tracks merged into the single stream shown by the UI
#[derive(Clone, Default)]
pub struct RemoteStream {
    tracks: Arc<RwLock<Vec<RemoteTrack>>>,
}

impl RemoteStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a track into the stream; returns `false` if a track with the
    /// same id is already present.
    pub fn add_track(&self, track: RemoteTrack) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        tracks.push(track);
        true
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.read().clone()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.read().iter().any(|t| t.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }

    /// Whether both handles refer to the same stream
    pub fn same_stream(&self, other: &RemoteStream) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("tracks", &*self.tracks.read())
            .finish()
    }
}
