//! Capture surface
//!
//! The drawable target the mirroring source renders into and the video
//! encoder reads from. Owned by the recorder; lent to both sides.

use crate::utils::error::{RecorderError, RecorderResult};
use bytes::Bytes;
use parking_lot::Mutex;

/// Latest frame plus a generation counter so readers can skip stale frames
#[derive(Debug, Default)]
struct SurfaceFrame {
    generation: u64,
    data: Option<Bytes>,
    released: bool,
}

/// Shared RGBA frame target
#[derive(Debug)]
pub struct CaptureSurface {
    width: u32,
    height: u32,
    density: u32,
    frame: Mutex<SurfaceFrame>,
}

impl CaptureSurface {
    pub fn new(width: u32, height: u32, density: u32) -> Self {
        Self {
            width,
            height,
            density,
            frame: Mutex::new(SurfaceFrame::default()),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Screen density in dpi, passed along to the mirroring source
    pub fn density(&self) -> u32 {
        self.density
    }

    /// Size in bytes of one RGBA frame
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Publish a new frame (mirroring source side)
    pub fn write_frame(&self, data: &[u8]) -> RecorderResult<()> {
        if data.len() != self.frame_len() {
            return Err(RecorderError::UnsupportedFormat(format!(
                "frame is {} bytes, surface expects {}",
                data.len(),
                self.frame_len()
            )));
        }

        let mut frame = self.frame.lock();
        if frame.released {
            return Err(RecorderError::SurfaceReleased);
        }
        frame.generation += 1;
        frame.data = Some(Bytes::copy_from_slice(data));
        Ok(())
    }

    /// The latest frame if it is newer than `generation` (encoder side)
    pub fn frame_since(&self, generation: u64) -> Option<(u64, Bytes)> {
        let frame = self.frame.lock();
        if frame.released || frame.generation <= generation {
            return None;
        }
        frame.data.clone().map(|data| (frame.generation, data))
    }

    /// Number of frames published so far
    pub fn generation(&self) -> u64 {
        self.frame.lock().generation
    }

    /// Release the surface. Returns false if it was already released.
    pub fn release(&self) -> bool {
        let mut frame = self.frame.lock();
        if frame.released {
            return false;
        }
        frame.released = true;
        frame.data = None;
        tracing::debug!("Capture surface {}x{} released", self.width, self.height);
        true
    }

    pub fn is_released(&self) -> bool {
        self.frame.lock().released
    }
}
