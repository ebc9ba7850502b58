//! H.264 video codec backed by openh264
//!
//! RGBA frames from the capture surface are converted to I420 and encoded
//! synchronously, so every queued frame is available from `dequeue_output`
//! right away. Samples carry Annex-B NAL units.

use super::codec::{Codec, CodecInput, CodecOutput, CodecParams, CodecSlot, TrackFormat};
use super::sample::{Sample, TrackKind};
use crate::utils::error::{RecorderError, RecorderResult};
use openh264::encoder::Encoder as H264Encoder;
use openh264::formats::YUVBuffer;
use std::collections::VecDeque;

/// Codec name recorded in the track format
pub const H264_CODEC_NAME: &str = "h264";

const NAL_TYPE_IDR: u8 = 5;

/// H.264 encoder for one video track
pub struct H264VideoCodec {
    slot: CodecSlot,
    encoder: Option<H264Encoder>,
    width: usize,
    height: usize,
    outputs: VecDeque<CodecOutput>,
    input_ended: bool,
}

impl H264VideoCodec {
    pub(crate) fn new(slot: CodecSlot) -> Self {
        Self {
            slot,
            encoder: None,
            width: 0,
            height: 0,
            outputs: VecDeque::new(),
            input_ended: false,
        }
    }

    fn failure(reason: String) -> RecorderError {
        RecorderError::EncoderFailure {
            track: TrackKind::Video,
            reason,
        }
    }
}

impl Codec for H264VideoCodec {
    fn name(&self) -> &str {
        H264_CODEC_NAME
    }

    fn configure(&mut self, params: &CodecParams) -> RecorderResult<TrackFormat> {
        let CodecParams::Video {
            width,
            height,
            bitrate,
            frame_rate,
            ..
        } = *params
        else {
            return Err(RecorderError::UnsupportedFormat(
                "video codec configured with audio parameters".to_string(),
            ));
        };

        // I420 subsamples chroma 2x2
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(RecorderError::UnsupportedFormat(format!(
                "video dimensions must be non-zero and even, got {}x{}",
                width, height
            )));
        }
        if frame_rate == 0 {
            return Err(RecorderError::UnsupportedFormat("frame rate must be non-zero".to_string()));
        }

        let encoder = H264Encoder::new()
            .map_err(|e| RecorderError::UnsupportedFormat(format!("Failed to create H.264 encoder: {}", e)))?;

        self.encoder = Some(encoder);
        self.width = width as usize;
        self.height = height as usize;

        tracing::debug!("H.264 encoder configured: {}x{} @ {}fps", width, height, frame_rate);

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
        let CodecInput::Frame { data, pts_us } = input else {
            return Err(Self::failure("PCM input submitted to video codec".to_string()));
        };
        if self.input_ended {
            return Err(Self::failure("input after end of stream".to_string()));
        }
        let expected = self.width * self.height * 4;
        if data.len() != expected {
            return Err(Self::failure(format!(
                "frame is {} bytes, expected {}",
                data.len(),
                expected
            )));
        }

        let (width, height) = (self.width, self.height);
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(Self::failure("codec is not configured".to_string()));
        };

        let yuv = YUVBuffer::from_vec(rgba_to_i420(data, width, height), width, height);
        let bitstream = encoder
            .encode(&yuv)
            .map_err(|e| Self::failure(format!("H.264 encoding failed: {}", e)))?;
        let nal_units = bitstream.to_vec();

        // Rate control may skip a frame entirely
        if nal_units.is_empty() {
            return Ok(());
        }

        let key_frame = contains_idr(&nal_units);
        self.outputs.push_back(CodecOutput::Sample(Sample::new(
            TrackKind::Video,
            nal_units,
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
        self.encoder = None;
        self.outputs.clear();
        self.slot.free();
    }
}

/// Convert packed RGBA to planar I420 (BT.601, limited range)
///
/// `width` and `height` must be even.
pub fn rgba_to_i420(rgba: &[u8], width: usize, height: usize) -> Vec<u8> {
    let y_size = width * height;
    let chroma_width = width / 2;
    let chroma_size = chroma_width * (height / 2);
    let mut out = vec![0u8; y_size + 2 * chroma_size];
    let (y_plane, chroma) = out.split_at_mut(y_size);
    let (u_plane, v_plane) = chroma.split_at_mut(chroma_size);

    let pixel = |x: usize, y: usize| {
        let i = (y * width + x) * 4;
        (rgba[i] as i32, rgba[i + 1] as i32, rgba[i + 2] as i32)
    };

    for y in 0..height {
        for x in 0..width {
            let (r, g, b) = pixel(x, y);
            y_plane[y * width + x] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8;
        }
    }

    for cy in 0..height / 2 {
        for cx in 0..chroma_width {
            let (mut r, mut g, mut b) = (0, 0, 0);
            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let (pr, pg, pb) = pixel(cx * 2 + dx, cy * 2 + dy);
                r += pr;
                g += pg;
                b += pb;
            }
            let (r, g, b) = (r / 4, g / 4, b / 4);
            let i = cy * chroma_width + cx;
            u_plane[i] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8;
            v_plane[i] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8;
        }
    }

    out
}

/// Whether an Annex-B access unit contains an IDR slice
pub fn contains_idr(annex_b: &[u8]) -> bool {
    annex_b
        .windows(4)
        .any(|w| w[0] == 0 && w[1] == 0 && w[2] == 1 && w[3] & 0x1f == NAL_TYPE_IDR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{CodecFactory, SoftwareCodecFactory};

    fn video_params(width: u32, height: u32) -> CodecParams {
        CodecParams::Video {
            width,
            height,
            bitrate: 500_000,
            frame_rate: 30,
            i_frame_interval_secs: 10,
        }
    }

    #[test]
    fn test_rgba_to_i420_primaries() {
        let white = [255u8; 2 * 2 * 4];
        assert_eq!(rgba_to_i420(&white, 2, 2), vec![235, 235, 235, 235, 128, 128]);

        let black: Vec<u8> = [0, 0, 0, 255].repeat(4);
        assert_eq!(rgba_to_i420(&black, 2, 2), vec![16, 16, 16, 16, 128, 128]);

        let red: Vec<u8> = [255, 0, 0, 255].repeat(4);
        let yuv = rgba_to_i420(&red, 2, 2);
        assert_eq!(yuv[0], 82);
        assert_eq!(yuv[4], 90);
        assert_eq!(yuv[5], 240);
    }

    #[test]
    fn test_chroma_averages_each_block() {
        // Left column white, right column black
        let mut frame = Vec::new();
        for _ in 0..2 {
            frame.extend_from_slice(&[255, 255, 255, 255, 0, 0, 0, 255]);
        }
        let yuv = rgba_to_i420(&frame, 2, 2);
        assert_eq!(&yuv[..4], &[235, 16, 235, 16]);
        assert_eq!(&yuv[4..], &[128, 128]);
    }

    #[test]
    fn test_idr_detection() {
        let sps_pps_idr = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce, 0, 0, 1, 0x65, 0x88];
        assert!(contains_idr(&sps_pps_idr));

        let non_idr = [0, 0, 0, 1, 0x41, 0x9a, 0x02];
        assert!(!contains_idr(&non_idr));
        assert!(!contains_idr(&[]));
    }

    #[test]
    fn test_rejects_audio_params_and_odd_sizes() {
        let factory = SoftwareCodecFactory::new();
        let mut codec = factory.create(TrackKind::Video).unwrap();
        assert_eq!(codec.name(), H264_CODEC_NAME);

        let err = codec
            .configure(&CodecParams::Audio {
                sample_rate: 44_100,
                channels: 2,
                bitrate: 64_000,
            })
            .unwrap_err();
        assert!(matches!(err, RecorderError::UnsupportedFormat(_)));
        assert!(matches!(
            codec.configure(&video_params(30, 17)),
            Err(RecorderError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_encodes_key_frame_first() {
        let factory = SoftwareCodecFactory::new();
        let mut codec = factory.create(TrackKind::Video).unwrap();
        let format = codec.configure(&video_params(32, 32)).unwrap();
        assert_eq!(format.codec, "h264");

        let frame: Vec<u8> = (0..32 * 32).flat_map(|i| [(i % 251) as u8, 64, 200, 255]).collect();
        for i in 0..3 {
            codec
                .queue_input(CodecInput::Frame {
                    data: &frame,
                    pts_us: i * 33_333,
                })
                .unwrap();
        }
        codec.signal_end_of_stream().unwrap();

        let mut samples = Vec::new();
        while let Some(output) = codec.dequeue_output().unwrap() {
            match output {
                CodecOutput::Sample(sample) => samples.push(sample),
                CodecOutput::EndOfStream => break,
            }
        }

        assert!(!samples.is_empty());
        assert!(samples[0].key_frame);
        assert_eq!(&samples[0].payload[..3], &[0, 0, 0]);
        assert!(samples.windows(2).all(|w| w[0].pts_us < w[1].pts_us));

        codec.release();
        assert_eq!(factory.live_instances(), 0);
    }

    #[test]
    fn test_wrong_frame_size_fails() {
        let factory = SoftwareCodecFactory::new();
        let mut codec = factory.create(TrackKind::Video).unwrap();
        codec.configure(&video_params(16, 16)).unwrap();
        let err = codec
            .queue_input(CodecInput::Frame {
                data: &[0u8; 10],
                pts_us: 0,
            })
            .unwrap_err();
        assert!(matches!(err, RecorderError::EncoderFailure { track: TrackKind::Video, .. }));
    }
}
