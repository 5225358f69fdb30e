//! Local audio capture injection.
//!
//! The core never touches a device directly: the embedding host supplies a
//! [`CaptureFactory`] that acquires the microphone (or a test source) and
//! yields encoded samples over a channel. Acquisition failure maps to
//! `LinkError::Device`. The capture handle is owned exclusively by the media
//! session's pump task and released deterministically on stop or teardown.

use std::sync::Arc;

use tokio::sync::mpsc;
use webrtc::media::Sample;

use crate::error::Result;

/// Acquires a capture source on demand. Invoked once per `start_media`.
pub type CaptureFactory = Arc<dyn Fn() -> Result<AudioCapture> + Send + Sync>;

/// A live local capture source: a stream of encoded audio samples plus an
/// optional release hook invoked exactly once when the source is dropped.
pub struct AudioCapture {
    rx: mpsc::Receiver<Sample>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl AudioCapture {
    /// Capture source with no release hook.
    pub fn new(rx: mpsc::Receiver<Sample>) -> Self {
        Self { rx, release: None }
    }

    /// Capture source whose device must be released explicitly (e.g. stop a
    /// capture thread, drop a device handle).
    pub fn with_release(rx: mpsc::Receiver<Sample>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            release: Some(Box::new(release)),
        }
    }

    pub(crate) async fn next_sample(&mut self) -> Option<Sample> {
        self.rx.recv().await
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for AudioCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCapture")
            .field("has_release_hook", &self.release.is_some())
            .finish()
    }
}
