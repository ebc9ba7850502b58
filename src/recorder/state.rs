//! Recorder state and configuration
//!
//! Defines the recorder state machine, pipeline configuration and tunables,
//! and the summary returned when a recording completes.

use crate::encoder::TrackKind;
use crate::muxer::TrackSummary;
use crate::utils::error::{RecorderError, RecorderResult};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Current state of the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    /// Nothing allocated
    Idle,
    /// Surface and muxer allocated, encoders not yet built
    Configured,
    /// Encoders running
    Recording,
    /// Waiting for encoders to drain and the container to finalize
    Stopping,
}

impl Default for RecorderState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Which tracks a recording carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamSet {
    VideoOnly,
    AudioOnly,
    VideoAndAudio,
}

impl StreamSet {
    pub fn tracks(&self) -> &'static [TrackKind] {
        match self {
            Self::VideoOnly => &[TrackKind::Video],
            Self::AudioOnly => &[TrackKind::Audio],
            Self::VideoAndAudio => &[TrackKind::Video, TrackKind::Audio],
        }
    }

    pub fn has_video(&self) -> bool {
        self.tracks().contains(&TrackKind::Video)
    }
}

impl Default for StreamSet {
    fn default() -> Self {
        Self::VideoAndAudio
    }
}

fn default_density() -> u32 {
    320
}

/// Configuration for one recording pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,

    /// Surface density in dpi, passed to the mirroring source
    #[serde(default = "default_density")]
    pub density: u32,

    /// Explicit output path; derived from the settings when absent
    #[serde(default)]
    pub output_path: Option<PathBuf>,

    #[serde(default)]
    pub stream_set: StreamSet,
}

impl PipelineConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            density: default_density(),
            output_path: None,
            stream_set: StreamSet::default(),
        }
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_stream_set(mut self, stream_set: StreamSet) -> Self {
        self.stream_set = stream_set;
        self
    }

    pub fn validate(&self) -> RecorderResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RecorderError::UnsupportedFormat(format!(
                "surface size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(RecorderError::UnsupportedFormat(format!(
                "surface size {}x{} must be even",
                self.width, self.height
            )));
        }
        if self.density == 0 {
            return Err(RecorderError::UnsupportedFormat("density must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Recorder tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderSettings {
    /// Directory for derived output paths
    pub output_dir: PathBuf,

    /// Pacer tick interval
    pub frame_interval_ms: u64,

    /// Upper bound on how long `end_record` waits for finalization
    pub stop_timeout_ms: u64,

    /// Per-track pre-start queue length in the muxer
    pub pending_sample_capacity: usize,

    pub video_frame_rate: u32,
    pub video_bits_per_pixel: f32,
    pub i_frame_interval_secs: u32,
    pub audio_bitrate: u32,

    /// Stereo frames per audio input buffer
    pub audio_chunk_frames: usize,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            frame_interval_ms: 32,
            stop_timeout_ms: 3000,
            pending_sample_capacity: 512,
            video_frame_rate: 30,
            video_bits_per_pixel: 0.25,
            i_frame_interval_secs: 10,
            audio_bitrate: 64_000,
            audio_chunk_frames: 1024,
        }
    }
}

impl RecorderSettings {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> RecorderResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&contents)?;
        tracing::debug!("Loaded recorder settings from {:?}", path);
        Ok(settings)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Result of a completed recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOutput {
    pub recording_id: Uuid,

    /// Finalized container file
    pub path: PathBuf,

    pub started_at: DateTime<Local>,
    pub tracks: Vec<TrackSummary>,

    /// Samples discarded from full pre-start queues
    pub dropped_samples: u64,

    pub failed_tracks: Vec<TrackKind>,
}
