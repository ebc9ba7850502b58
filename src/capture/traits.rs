//! Capture trait definitions
//!
//! Platform-agnostic traits for the collaborators around the pipeline.

use super::surface::CaptureSurface;
use crate::utils::error::RecorderResult;
use std::path::Path;
use std::sync::Arc;

/// Display-mirroring source that renders the screen into a capture surface
///
/// The pipeline only binds and unbinds the surface; it never pulls frames
/// from the source directly.
pub trait MirrorSource: Send {
    /// Start producing frames into `surface`
    fn bind(&mut self, surface: Arc<CaptureSurface>) -> RecorderResult<()>;

    /// Stop producing frames. After this returns the surface is not written to again.
    fn unbind(&mut self);
}

/// Source of interleaved 16-bit stereo PCM at 44.1kHz
pub trait AudioSource: Send {
    /// Fill `buf` with samples, returning how many were written
    fn read(&mut self, buf: &mut [i16]) -> RecorderResult<usize>;
}

/// Host process lifecycle (foreground service / notification equivalent)
pub trait HostLifecycle: Send + Sync {
    fn recording_started(&self, output_path: &Path);

    fn recording_stopped(&self);
}

/// Lifecycle hook that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLifecycle;

impl HostLifecycle for NoopLifecycle {
    fn recording_started(&self, output_path: &Path) {
        tracing::debug!("Recording started: {:?}", output_path);
    }

    fn recording_stopped(&self) {
        tracing::debug!("Recording stopped");
    }
}
