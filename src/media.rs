//! Local Media Devices
//!
//! Models camera/microphone handles for the call state machine: acquire,
//! in-place track enable/disable, and guaranteed release. Actual capture
//! and transport are out of scope - media packets flow peer-to-peer and
//! never through this crate - so the device layer is an explicit stub with
//! the real ownership semantics.

use serde::{Deserialize, Serialize};

/// Media-related errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("device permission denied")]
    PermissionDenied,
    #[error("device busy")]
    DeviceBusy,
    #[error("no such device")]
    NotFound,
    #[error("device backend error: {0}")]
    Backend(String),
}

/// What the caller wants to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// An acquired device handle.
///
/// Exclusively owned by the call machinery that acquired it; every exit
/// path must call `release` or the hardware indicator stays lit. Dropping
/// an unreleased handle logs the leak and releases it.
#[derive(Debug)]
pub struct LocalMedia {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    has_video_track: bool,
    released: bool,
}

impl LocalMedia {
    fn new(constraints: MediaConstraints) -> Self {
        Self {
            audio_enabled: constraints.audio,
            video_enabled: constraints.video,
            has_video_track: constraints.video,
            released: false,
        }
    }

    /// In-place track toggle; no renegotiation involved.
    pub fn set_audio(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
        log::debug!("local audio track {}", if enabled { "enabled" } else { "disabled" });
    }

    /// In-place track toggle. Returns false when there is no video track
    /// to enable - that case needs a track added and a renegotiation,
    /// which is the caller's job.
    pub fn set_video(&mut self, enabled: bool) -> bool {
        if enabled && !self.has_video_track {
            return false;
        }
        self.video_enabled = enabled;
        log::debug!("local video track {}", if enabled { "enabled" } else { "disabled" });
        true
    }

    /// Record that a video track was added mid-call.
    pub fn add_video_track(&mut self) {
        self.has_video_track = true;
        self.video_enabled = true;
        log::debug!("video track added to local media");
    }

    pub fn has_video_track(&self) -> bool {
        self.has_video_track
    }

    /// Hand the devices back.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            log::info!("released local media devices");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("local media dropped without release; releasing now");
            self.release();
        }
    }
}

/// Device access front-end.
///
/// Availability flags stand in for the host's actual devices; in a browser
/// runtime this is `getUserMedia`, here it is the same kind of stub the
/// transport layer gets.
#[derive(Debug, Clone)]
pub struct DeviceManager {
    audio_available: bool,
    video_available: bool,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            audio_available: true,
            video_available: true,
        }
    }

    /// Simulate a host without the given devices.
    pub fn with_availability(audio: bool, video: bool) -> Self {
        Self {
            audio_available: audio,
            video_available: video,
        }
    }

    pub fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        if constraints.audio && !self.audio_available {
            return Err(MediaError::NotFound);
        }
        if constraints.video && !self.video_available {
            return Err(MediaError::NotFound);
        }
        log::info!(
            "acquired local media (audio: {}, video: {})",
            constraints.audio,
            constraints.video
        );
        Ok(LocalMedia::new(constraints))
    }

    /// Acquire with a degraded fallback: if video capture fails for a
    /// recoverable reason, retry audio-only rather than failing the call.
    pub fn acquire_with_fallback(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalMedia, MediaError> {
        match self.acquire(constraints) {
            Ok(media) => Ok(media),
            Err(e @ (MediaError::NotFound | MediaError::DeviceBusy)) if constraints.video => {
                log::warn!("video capture failed ({}), retrying audio-only", e);
                self.acquire(MediaConstraints::audio_only())
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let devices = DeviceManager::new();
        let mut media = devices.acquire(MediaConstraints::audio_video()).unwrap();
        assert!(media.audio_enabled);
        assert!(media.video_enabled);

        media.release();
        assert!(media.is_released());
    }

    #[test]
    fn test_toggle_without_renegotiation() {
        let devices = DeviceManager::new();
        let mut media = devices.acquire(MediaConstraints::audio_video()).unwrap();

        media.set_audio(false);
        assert!(!media.audio_enabled);
        assert!(media.set_video(false));
        assert!(!media.video_enabled);
        assert!(media.set_video(true));

        media.release();
    }

    #[test]
    fn test_video_enable_needs_track() {
        let devices = DeviceManager::new();
        let mut media = devices.acquire(MediaConstraints::audio_only()).unwrap();

        // No video track yet; an in-place enable must be refused.
        assert!(!media.set_video(true));

        media.add_video_track();
        assert!(media.video_enabled);
        media.release();
    }

    #[test]
    fn test_missing_camera_falls_back_to_audio() {
        let devices = DeviceManager::with_availability(true, false);

        assert!(matches!(
            devices.acquire(MediaConstraints::audio_video()),
            Err(MediaError::NotFound)
        ));

        let mut media = devices
            .acquire_with_fallback(MediaConstraints::audio_video())
            .unwrap();
        assert!(media.audio_enabled);
        assert!(!media.video_enabled);
        media.release();
    }

    #[test]
    fn test_no_devices_at_all_fails() {
        let devices = DeviceManager::with_availability(false, false);
        assert!(devices
            .acquire_with_fallback(MediaConstraints::audio_video())
            .is_err());
    }
}
