//! Lightweight video codec for pipeline tests
//!
//! Run-length encodes raw RGBA so tests can check exact frame contents
//! without decoding H.264.

use super::codec::{Codec, CodecInput, CodecOutput, CodecParams, CodecSlot, SoftwareCodecFactory, TrackFormat};
use super::sample::{Sample, TrackKind};
use crate::utils::error::{RecorderError, RecorderResult};
use std::collections::VecDeque;

pub const RLE_CODEC_NAME: &str = "rle";

/// Software factory producing [`RleVideoCodec`] for video and PCM for audio
pub fn rle_codecs() -> SoftwareCodecFactory {
    SoftwareCodecFactory::new().with_video_codec(rle_video)
}

pub fn rle_codecs_with_max_instances(max_instances: usize) -> SoftwareCodecFactory {
    SoftwareCodecFactory::with_max_instances(max_instances).with_video_codec(rle_video)
}

fn rle_video(slot: CodecSlot) -> Box<dyn Codec> {
    Box::new(RleVideoCodec::new(slot))
}

#[derive(Debug)]
pub struct RleVideoCodec {
    slot: CodecSlot,
    frame_len: usize,
    gop_frames: u64,
    frames: u64,
    outputs: VecDeque<CodecOutput>,
    input_ended: bool,
}

impl RleVideoCodec {
    fn new(slot: CodecSlot) -> Self {
        Self {
            slot,
            frame_len: 0,
            gop_frames: 1,
            frames: 0,
            outputs: VecDeque::new(),
            input_ended: false,
        }
    }
}

impl Codec for RleVideoCodec {
    fn name(&self) -> &str {
        RLE_CODEC_NAME
    }

    fn configure(&mut self, params: &CodecParams) -> RecorderResult<TrackFormat> {
        let CodecParams::Video {
            width,
            height,
            bitrate,
            frame_rate,
            i_frame_interval_secs,
        } = *params
        else {
            return Err(RecorderError::UnsupportedFormat(
                "video codec configured with audio parameters".to_string(),
            ));
        };

        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 || frame_rate == 0 {
            return Err(RecorderError::UnsupportedFormat(format!(
                "unsupported video format {}x{} @ {}fps",
                width, height, frame_rate
            )));
        }

        self.frame_len = width as usize * height as usize * 4;
        self.gop_frames = (frame_rate as u64 * i_frame_interval_secs as u64).max(1);

        Ok(TrackFormat {
            kind: TrackKind::Video,
            codec: self.name().to_string(),
            bitrate,
            width: Some(width),
            height: Some(height),
            frame_rate: Some(frame_rate),
            sample_rate: None,
            channels: None,
        })
    }

    fn queue_input(&mut self, input: CodecInput<'_>) -> RecorderResult<()> {
        let failure = |reason: String| RecorderError::EncoderFailure {
            track: TrackKind::Video,
            reason,
        };
        let CodecInput::Frame { data, pts_us } = input else {
            return Err(failure("PCM input submitted to video codec".to_string()));
        };
        if self.input_ended {
            return Err(failure("input after end of stream".to_string()));
        }
        if data.len() != self.frame_len {
            return Err(failure(format!("frame is {} bytes, expected {}", data.len(), self.frame_len)));
        }

        let key_frame = self.frames % self.gop_frames == 0;
        self.frames += 1;
        self.outputs.push_back(CodecOutput::Sample(Sample::new(
            TrackKind::Video,
            run_length_encode(data),
            pts_us,
            key_frame,
        )));
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

/// Run-length encode as (count, value) byte pairs
pub fn run_length_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 64 + 2);
    let mut i = 0;
    while i < data.len() {
        let value = data[i];
        let mut run = 1;
        while i + run < data.len() && run < u8::MAX as usize && data[i + run] == value {
            run += 1;
        }
        out.push(run as u8);
        out.push(value);
        i += run;
    }
    out
}

pub fn run_length_decode(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(2)
        .flat_map(|pair| std::iter::repeat(pair[1]).take(pair[0] as usize))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::CodecFactory;

    #[test]
    fn test_key_frame_interval() {
        let factory = rle_codecs();
        let mut codec = factory.create(TrackKind::Video).unwrap();
        codec
            .configure(&CodecParams::Video {
                width: 2,
                height: 2,
                bitrate: 1_000_000,
                frame_rate: 2,
                i_frame_interval_secs: 1,
            })
            .unwrap();

        let frame = [7u8; 16];
        for i in 0..4 {
            codec
                .queue_input(CodecInput::Frame { data: &frame, pts_us: i * 1000 })
                .unwrap();
        }
        codec.signal_end_of_stream().unwrap();

        let mut keys = Vec::new();
        while let Some(CodecOutput::Sample(sample)) = codec.dequeue_output().unwrap() {
            assert_eq!(run_length_decode(&sample.payload), frame.to_vec());
            keys.push(sample.key_frame);
        }
        // GOP of frame_rate * interval = 2 frames
        assert_eq!(keys, vec![true, false, true, false]);
    }

    #[test]
    fn test_run_length_encoding_compresses_runs() {
        let data: Vec<u8> = std::iter::repeat(3u8).take(600).chain([1, 2, 2]).collect();
        let encoded = run_length_encode(&data);
        assert_eq!(encoded, vec![255, 3, 255, 3, 90, 3, 1, 1, 2, 2]);
        assert_eq!(run_length_decode(&encoded), data);
    }
}
