//! Synthetic capture sources
//!
//! A test-pattern mirroring source and generated audio, used by the demo
//! binary and the pipeline tests in place of real screen/audio capture.

use super::surface::CaptureSurface;
use super::traits::{AudioSource, MirrorSource};
use crate::encoder::codec::{AUDIO_CHANNELS, AUDIO_SAMPLE_RATE};
use crate::utils::error::{RecorderError, RecorderResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Mirroring source that paints solid colour frames at a fixed rate
pub struct TestPatternSource {
    fps: u32,
    running: Arc<AtomicBool>,
    frames_written: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl TestPatternSource {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            running: Arc::new(AtomicBool::new(false)),
            frames_written: Arc::new(AtomicU64::new(0)),
            handle: None,
        }
    }

    /// Shared counter of frames rendered so far
    pub fn frames_written(&self) -> Arc<AtomicU64> {
        self.frames_written.clone()
    }
}

impl MirrorSource for TestPatternSource {
    fn bind(&mut self, surface: Arc<CaptureSurface>) -> RecorderResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RecorderError::AlreadyRecording);
        }

        let running = self.running.clone();
        let frames_written = self.frames_written.clone();
        let frame_interval = Duration::from_millis(1000 / self.fps as u64);

        tracing::info!(
            "Test pattern bound to {}x{} surface @ {}fps (density {})",
            surface.width(),
            surface.height(),
            self.fps,
            surface.density()
        );

        let handle = std::thread::Builder::new()
            .name("test-pattern".to_string())
            .spawn(move || {
                let mut frame = vec![0u8; surface.frame_len()];
                let mut index: u64 = 0;

                while running.load(Ordering::SeqCst) {
                    let start = Instant::now();

                    let shade = (index % 256) as u8;
                    for pixel in frame.chunks_exact_mut(4) {
                        pixel.copy_from_slice(&[shade, 255 - shade, 128, 255]);
                    }
                    match surface.write_frame(&frame) {
                        Ok(()) => {
                            frames_written.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            tracing::warn!("Test pattern stopped writing: {}", e);
                            break;
                        }
                    }
                    index += 1;

                    let elapsed = start.elapsed();
                    if elapsed < frame_interval {
                        std::thread::sleep(frame_interval - elapsed);
                    }
                }
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    fn unbind(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            tracing::info!(
                "Test pattern unbound after {} frames",
                self.frames_written.load(Ordering::Relaxed)
            );
        }
    }
}

impl Drop for TestPatternSource {
    fn drop(&mut self) {
        self.unbind();
    }
}

/// Stereo sine tone
#[derive(Debug, Clone)]
pub struct ToneSource {
    frequency: f64,
    amplitude: f64,
    phase: f64,
}

impl ToneSource {
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            amplitude: 0.25,
            phase: 0.0,
        }
    }
}

impl AudioSource for ToneSource {
    fn read(&mut self, buf: &mut [i16]) -> RecorderResult<usize> {
        let channels = AUDIO_CHANNELS as usize;
        let step = std::f64::consts::TAU * self.frequency / AUDIO_SAMPLE_RATE as f64;
        let frames = buf.len() / channels;

        for frame in buf.chunks_exact_mut(channels) {
            let value = (self.phase.sin() * self.amplitude * i16::MAX as f64) as i16;
            frame.fill(value);
            self.phase = (self.phase + step) % std::f64::consts::TAU;
        }
        Ok(frames * channels)
    }
}

/// Digital silence
#[derive(Debug, Default, Clone, Copy)]
pub struct SilenceSource;

impl AudioSource for SilenceSource {
    fn read(&mut self, buf: &mut [i16]) -> RecorderResult<usize> {
        buf.fill(0);
        Ok(buf.len())
    }
}
