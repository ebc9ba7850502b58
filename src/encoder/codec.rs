//! Codec collaborator interface
//!
//! A `Codec` is the platform (or software) encoder that sits behind a
//! `MediaEncoder`: it accepts raw frames or PCM, and hands back compressed
//! samples followed by an end-of-stream marker once input has ended.

use super::h264::H264VideoCodec;
use super::sample::{Sample, TrackKind};
use crate::recorder::state::{PipelineConfig, RecorderSettings};
use crate::utils::error::{RecorderError, RecorderResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Audio source parameters are fixed: 44.1kHz stereo 16-bit PCM
pub const AUDIO_SAMPLE_RATE: u32 = 44_100;
pub const AUDIO_CHANNELS: u16 = 2;

/// Codec name of the PCM audio track
pub const PCM_CODEC_NAME: &str = "pcm_s16le";

/// Parameters a codec is configured with
#[derive(Debug, Clone, PartialEq)]
pub enum CodecParams {
    Video {
        width: u32,
        height: u32,
        bitrate: u32,
        frame_rate: u32,
        i_frame_interval_secs: u32,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
        bitrate: u32,
    },
}

impl CodecParams {
    /// Derive codec parameters for one track of a pipeline
    pub fn for_track(kind: TrackKind, config: &PipelineConfig, settings: &RecorderSettings) -> Self {
        match kind {
            TrackKind::Video => {
                let bitrate = settings.video_bits_per_pixel
                    * settings.video_frame_rate as f32
                    * config.width as f32
                    * config.height as f32;
                CodecParams::Video {
                    width: config.width,
                    height: config.height,
                    bitrate: bitrate as u32,
                    frame_rate: settings.video_frame_rate,
                    i_frame_interval_secs: settings.i_frame_interval_secs,
                }
            }
            TrackKind::Audio => CodecParams::Audio {
                sample_rate: AUDIO_SAMPLE_RATE,
                channels: AUDIO_CHANNELS,
                bitrate: settings.audio_bitrate,
            },
        }
    }

    pub fn kind(&self) -> TrackKind {
        match self {
            CodecParams::Video { .. } => TrackKind::Video,
            CodecParams::Audio { .. } => TrackKind::Audio,
        }
    }
}

/// Format descriptor of a configured track, recorded in the container header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackFormat {
    pub kind: TrackKind,
    pub codec: String,
    pub bitrate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
}

/// Raw input handed to a codec
#[derive(Debug, Clone, Copy)]
pub enum CodecInput<'a> {
    /// One RGBA frame
    Frame { data: &'a [u8], pts_us: i64 },
    /// Interleaved 16-bit PCM
    Pcm { data: &'a [i16], pts_us: i64 },
}

/// Output dequeued from a codec
#[derive(Debug, Clone, PartialEq)]
pub enum CodecOutput {
    Sample(Sample),
    EndOfStream,
}

/// Platform codec collaborator
pub trait Codec: Send {
    /// Codec name written into the track format
    fn name(&self) -> &str;

    /// Allocate codec resources for the given parameters
    fn configure(&mut self, params: &CodecParams) -> RecorderResult<TrackFormat>;

    /// Submit one unit of raw input
    fn queue_input(&mut self, input: CodecInput<'_>) -> RecorderResult<()>;

    /// Signal that no more input will follow
    fn signal_end_of_stream(&mut self) -> RecorderResult<()>;

    /// Non-blocking: next available output, if any
    fn dequeue_output(&mut self) -> RecorderResult<Option<CodecOutput>>;

    /// Free codec resources. Must be idempotent.
    fn release(&mut self);
}

/// Creates codecs for a track kind
pub trait CodecFactory: Send + Sync {
    fn create(&self, kind: TrackKind) -> RecorderResult<Box<dyn Codec>>;
}

/// Builds the video codec that will own a freshly acquired slot
pub(crate) type VideoCodecBuilder = fn(CodecSlot) -> Box<dyn Codec>;

fn h264_video(slot: CodecSlot) -> Box<dyn Codec> {
    Box::new(H264VideoCodec::new(slot))
}

/// Factory for the built-in software codecs: H.264 video and PCM audio
///
/// `max_instances` emulates a platform with a limited number of codec slots.
#[derive(Debug)]
pub struct SoftwareCodecFactory {
    max_instances: Option<usize>,
    live: Arc<AtomicUsize>,
    video: VideoCodecBuilder,
}

impl Default for SoftwareCodecFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareCodecFactory {
    pub fn new() -> Self {
        Self {
            max_instances: None,
            live: Arc::new(AtomicUsize::new(0)),
            video: h264_video,
        }
    }

    pub fn with_max_instances(max_instances: usize) -> Self {
        Self {
            max_instances: Some(max_instances),
            ..Self::new()
        }
    }

    /// Swap the video codec, keeping slot accounting
    #[cfg(test)]
    pub(crate) fn with_video_codec(mut self, video: VideoCodecBuilder) -> Self {
        self.video = video;
        self
    }

    /// Number of codecs currently holding a slot
    pub fn live_instances(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn acquire_slot(&self, kind: TrackKind) -> RecorderResult<CodecSlot> {
        let acquired = self.live.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
            match self.max_instances {
                Some(max) if live >= max => None,
                _ => Some(live + 1),
            }
        });

        match acquired {
            Ok(_) => Ok(CodecSlot {
                live: Some(self.live.clone()),
            }),
            Err(live) => Err(RecorderError::ResourceExhausted(format!(
                "no codec slot for {} track ({} in use)",
                kind, live
            ))),
        }
    }
}

impl CodecFactory for SoftwareCodecFactory {
    fn create(&self, kind: TrackKind) -> RecorderResult<Box<dyn Codec>> {
        let slot = self.acquire_slot(kind)?;
        Ok(match kind {
            TrackKind::Video => (self.video)(slot),
            TrackKind::Audio => Box::new(PcmAudioCodec::new(slot)),
        })
    }
}

/// Slot held by a live software codec; returned on release or drop
#[derive(Debug)]
pub(crate) struct CodecSlot {
    live: Option<Arc<AtomicUsize>>,
}

impl CodecSlot {
    pub(crate) fn free(&mut self) {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for CodecSlot {
    fn drop(&mut self) {
        self.free();
    }
}

/// Software audio codec: passes 16-bit PCM through as little-endian bytes
#[derive(Debug)]
pub struct PcmAudioCodec {
    slot: CodecSlot,
    outputs: VecDeque<CodecOutput>,
    input_ended: bool,
}

impl PcmAudioCodec {
    fn new(slot: CodecSlot) -> Self {
        Self {
            slot,
            outputs: VecDeque::new(),
            input_ended: false,
        }
    }
}

impl Codec for PcmAudioCodec {
    fn name(&self) -> &str {
        PCM_CODEC_NAME
    }

    fn configure(&mut self, params: &CodecParams) -> RecorderResult<TrackFormat> {
        let CodecParams::Audio {
            sample_rate,
            channels,
            bitrate,
        } = *params
        else {
            return Err(RecorderError::UnsupportedFormat(
                "audio codec configured with video parameters".to_string(),
            ));
        };

        if sample_rate != AUDIO_SAMPLE_RATE || channels != AUDIO_CHANNELS {
            return Err(RecorderError::UnsupportedFormat(format!(
                "expected {}Hz/{}ch PCM, got {}Hz/{}ch",
                AUDIO_SAMPLE_RATE, AUDIO_CHANNELS, sample_rate, channels
            )));
        }

        Ok(TrackFormat {
            kind: TrackKind::Audio,
            codec: self.name().to_string(),
            bitrate,
            width: None,
            height: None,
            frame_rate: None,
            sample_rate: Some(sample_rate),
            channels: Some(channels),
        })
    }

    fn queue_input(&mut self, input: CodecInput<'_>) -> RecorderResult<()> {
        let CodecInput::Pcm { data, pts_us } = input else {
            return Err(RecorderError::EncoderFailure {
                track: TrackKind::Audio,
                reason: "video frame submitted to audio codec".to_string(),
            });
        };
        if self.input_ended {
            return Err(RecorderError::EncoderFailure {
                track: TrackKind::Audio,
                reason: "input after end of stream".to_string(),
            });
        }

        let payload: Vec<u8> = data.iter().flat_map(|s| s.to_le_bytes()).collect();
        self.outputs
            .push_back(CodecOutput::Sample(Sample::new(TrackKind::Audio, payload, pts_us, true)));
        Ok(())
    }

    fn signal_end_of_stream(&mut self) -> RecorderResult<()> {
        if !self.input_ended {
            self.input_ended = true;
            self.outputs.push_back(CodecOutput::EndOfStream);
        }
        Ok(())
    }

    fn dequeue_output(&mut self) -> RecorderResult<Option<CodecOutput>> {
        Ok(self.outputs.pop_front())
    }

    fn release(&mut self) {
        self.outputs.clear();
        self.slot.free();
    }
}
