//! Capture device access
//!
//! `MediaDevices` is the platform seam; `MediaAcquisition` turns device
//! grants into a `LocalStream` and enforces one live stream per process.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{LocalStream, LocalTrack, TrackKind};
use crate::error::DeviceFailure;
use crate::{Error, Result};

/// A capture device granted by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDevice {
    pub kind: TrackKind,
    pub label: String,
}

/// Platform capture backend
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request access to one device per requested kind
    ///
    /// May wait on a user permission prompt.
    async fn open(&self, kinds: &[TrackKind]) -> std::result::Result<Vec<CaptureDevice>, DeviceFailure>;
}

/// Configurable in-process devices
///
/// Used by the `call-agent` binary and tests in place of real hardware.
#[derive(Debug, Clone)]
pub struct SyntheticDevices {
    camera: bool,
    microphone: bool,
    permission_granted: bool,
    prompt_delay: Duration,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self {
            camera: true,
            microphone: true,
            permission_granted: true,
            prompt_delay: Duration::ZERO,
        }
    }
}

impl SyntheticDevices {
    /// Camera and microphone present, permission granted immediately
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_camera(mut self) -> Self {
        self.camera = false;
        self
    }

    pub fn without_microphone(mut self) -> Self {
        self.microphone = false;
        self
    }

    /// Refuse every permission request
    pub fn deny_permission(mut self) -> Self {
        self.permission_granted = false;
        self
    }

    /// Simulate a user taking `delay` to answer the permission prompt
    pub fn with_prompt_delay(mut self, delay: Duration) -> Self {
        self.prompt_delay = delay;
        self
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open(&self, kinds: &[TrackKind]) -> std::result::Result<Vec<CaptureDevice>, DeviceFailure> {
        if !self.prompt_delay.is_zero() {
            tokio::time::sleep(self.prompt_delay).await;
        }

        if !self.permission_granted {
            return Err(DeviceFailure::PermissionDenied);
        }

        kinds
            .iter()
            .map(|&kind| {
                let present = match kind {
                    TrackKind::Audio => self.microphone,
                    TrackKind::Video => self.camera,
                };
                if !present {
                    return Err(DeviceFailure::NotFound(kind));
                }
                let label = match kind {
                    TrackKind::Audio => "Synthetic Microphone",
                    TrackKind::Video => "Synthetic Camera",
                };
                Ok(CaptureDevice {
                    kind,
                    label: label.to_string(),
                })
            })
            .collect()
    }
}

/// Exclusive hold on the capture devices; dropping it frees them
#[derive(Debug)]
pub(crate) struct DeviceLease {
    in_use: Arc<AtomicBool>,
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::Release);
    }
}

/// Obtains local streams from a `MediaDevices` backend
#[derive(Clone)]
pub struct MediaAcquisition {
    devices: Arc<dyn MediaDevices>,
    in_use: Arc<AtomicBool>,
}

impl MediaAcquisition {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Acquisition backed by `SyntheticDevices::default()`
    pub fn synthetic() -> Self {
        Self::new(Arc::new(SyntheticDevices::default()))
    }

    /// Whether a live stream currently holds the devices
    pub fn is_busy(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Capture a local stream
    ///
    /// Fails fast with `DeviceFailure::Busy` while another stream from this
    /// acquisition is still live.
    pub async fn acquire(&self, video: bool, audio: bool) -> Result<LocalStream> {
        if !video && !audio {
            return Err(Error::InvalidConfig(
                "acquire requires audio or video".to_string(),
            ));
        }

        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Capture devices requested while another stream is live");
            return Err(DeviceFailure::Busy.into());
        }
        let lease = DeviceLease {
            in_use: Arc::clone(&self.in_use),
        };

        let mut kinds = Vec::with_capacity(2);
        if audio {
            kinds.push(TrackKind::Audio);
        }
        if video {
            kinds.push(TrackKind::Video);
        }

        debug!("Requesting capture devices: {:?}", kinds);
        let granted = self.devices.open(&kinds).await?;

        let tracks = granted
            .into_iter()
            .map(|device| LocalTrack::new(device.kind, device.label))
            .collect::<Vec<_>>();
        let stream = LocalStream::new(tracks, lease);

        info!(
            "Acquired local stream {} (audio={}, video={})",
            stream.id(),
            audio,
            video
        );
        Ok(stream)
    }

    /// Mute or unmute tracks of `kind` without releasing capture
    pub fn set_track_enabled(&self, stream: &LocalStream, kind: TrackKind, enabled: bool) -> Result<()> {
        if stream.is_released() {
            return Err(Error::InvalidState(format!(
                "stream {} has been released",
                stream.id()
            )));
        }
        if stream.set_enabled(kind, enabled) == 0 {
            return Err(Error::InvalidState(format!(
                "stream {} has no {} track",
                stream.id(),
                kind
            )));
        }
        debug!("Set {} enabled={} on stream {}", kind, enabled, stream.id());
        Ok(())
    }

    /// Stop all tracks of `stream`; a second call is a no-op
    pub fn release(&self, stream: &LocalStream) -> bool {
        stream.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_audio_and_video() {
        let media = MediaAcquisition::synthetic();
        let stream = media.acquire(true, true).await.unwrap();

        assert_eq!(stream.track_count(), 2);
        assert!(stream.has_kind(TrackKind::Audio));
        assert!(stream.has_kind(TrackKind::Video));
        assert!(stream.tracks().iter().all(|t| t.is_enabled()));
        assert!(media.is_busy());
    }

    #[tokio::test]
    async fn test_acquire_audio_only() {
        let media = MediaAcquisition::synthetic();
        let stream = media.acquire(false, true).await.unwrap();
        assert_eq!(stream.track_count(), 1);
        assert!(!stream.has_kind(TrackKind::Video));
    }

    #[tokio::test]
    async fn test_second_acquire_is_busy() {
        let media = MediaAcquisition::synthetic();
        let stream = media.acquire(true, true).await.unwrap();

        let err = media.acquire(true, true).await.unwrap_err();
        assert!(matches!(err, Error::DeviceError(DeviceFailure::Busy)));

        assert!(media.release(&stream));
        assert!(!media.is_busy());
        assert!(media.acquire(true, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropping_last_handle_frees_devices() {
        let media = MediaAcquisition::synthetic();
        let stream = media.acquire(true, true).await.unwrap();
        let ui_handle = stream.clone();

        drop(stream);
        assert!(media.is_busy());
        drop(ui_handle);
        assert!(!media.is_busy());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let media = MediaAcquisition::synthetic();
        let stream = media.acquire(true, true).await.unwrap();

        assert!(media.release(&stream));
        assert!(!media.release(&stream));
        assert!(stream.is_released());
        assert!(stream.tracks().iter().all(|t| t.is_stopped()));
    }

    #[tokio::test]
    async fn test_permission_denied_frees_lock() {
        let media = MediaAcquisition::new(Arc::new(SyntheticDevices::new().deny_permission()));
        let err = media.acquire(true, true).await.unwrap_err();

        assert!(matches!(
            err,
            Error::DeviceError(DeviceFailure::PermissionDenied)
        ));
        assert!(!media.is_busy());
    }

    #[tokio::test]
    async fn test_missing_camera() {
        let media = MediaAcquisition::new(Arc::new(SyntheticDevices::new().without_camera()));
        let err = media.acquire(true, true).await.unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceError(DeviceFailure::NotFound(TrackKind::Video))
        ));

        assert!(media.acquire(false, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_toggle_keeps_track_count() {
        let media = MediaAcquisition::synthetic();
        let stream = media.acquire(true, true).await.unwrap();

        media
            .set_track_enabled(&stream, TrackKind::Video, false)
            .unwrap();
        assert!(!stream.track(TrackKind::Video).unwrap().is_enabled());
        assert!(!stream.track(TrackKind::Video).unwrap().is_stopped());
        assert_eq!(stream.track_count(), 2);

        media
            .set_track_enabled(&stream, TrackKind::Video, true)
            .unwrap();
        assert!(stream.track(TrackKind::Video).unwrap().is_enabled());
        assert_eq!(stream.track_count(), 2);
    }

    #[tokio::test]
    async fn test_toggle_released_stream_fails() {
        let media = MediaAcquisition::synthetic();
        let stream = media.acquire(false, true).await.unwrap();

        assert!(media
            .set_track_enabled(&stream, TrackKind::Video, false)
            .is_err());

        media.release(&stream);
        assert!(media
            .set_track_enabled(&stream, TrackKind::Audio, false)
            .is_err());
    }
}
