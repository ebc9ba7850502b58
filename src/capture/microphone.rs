//! Microphone capture through cpal
//!
//! cpal streams are not `Send`, so the input stream lives on its own thread
//! for as long as the source is open. Its callback converts whatever the
//! device delivers to 44.1kHz interleaved stereo `i16` and appends it to a
//! bounded buffer that `read` drains without blocking.

use super::traits::AudioSource;
use crate::encoder::codec::{AUDIO_CHANNELS, AUDIO_SAMPLE_RATE};
use crate::utils::error::{RecorderError, RecorderResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Seconds of converted audio kept when the encoder falls behind
const BUFFER_SECONDS: usize = 2;
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(100);
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Converts interleaved PCM of any rate and channel count to 44.1kHz stereo
///
/// Mono is duplicated to both channels, extra channels beyond the first two
/// are dropped, and the rate is changed by linear interpolation. State is
/// carried across calls so chunk boundaries do not click.
#[derive(Debug, Clone)]
pub struct PcmConverter {
    in_channels: usize,
    step: f64,
    position: f64,
    previous: Option<[i16; 2]>,
}

impl PcmConverter {
    pub fn new(in_rate: u32, in_channels: u16) -> Self {
        Self {
            in_channels: in_channels.max(1) as usize,
            step: in_rate.max(1) as f64 / AUDIO_SAMPLE_RATE as f64,
            position: 0.0,
            previous: None,
        }
    }

    fn passthrough(&self) -> bool {
        self.step == 1.0
    }

    /// Convert `input` and append the result to `out`
    pub fn push(&mut self, input: &[i16], out: &mut Vec<i16>) {
        let frames = input.chunks_exact(self.in_channels).map(|frame| match frame {
            [mono] => [*mono, *mono],
            [left, right, ..] => [*left, *right],
            [] => [0, 0],
        });

        if self.passthrough() {
            out.extend(frames.flatten());
            return;
        }

        let mut window: Vec<[i16; 2]> = Vec::with_capacity(input.len() / self.in_channels + 1);
        window.extend(self.previous);
        window.extend(frames);
        if window.len() < 2 {
            self.previous = window.last().copied();
            return;
        }

        let last = (window.len() - 1) as f64;
        while self.position < last {
            let index = self.position as usize;
            let t = self.position - index as f64;
            let (a, b) = (window[index], window[index + 1]);
            for channel in 0..2 {
                let value = a[channel] as f64 + (b[channel] as f64 - a[channel] as f64) * t;
                out.push(value.round() as i16);
            }
            self.position += self.step;
        }

        self.position -= last;
        self.previous = window.last().copied();
    }
}

/// Default input device as an [`AudioSource`]
pub struct MicrophoneSource {
    device_name: String,
    buffer: Arc<Mutex<VecDeque<i16>>>,
    overflowed: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MicrophoneSource {
    /// Open the host's default input device and start capturing
    pub fn open_default() -> RecorderResult<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| RecorderError::ResourceExhausted("no default audio input device".to_string()))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device.default_input_config().map_err(|e| {
            RecorderError::UnsupportedFormat(format!("Failed to get audio input config: {}", e))
        })?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        let capacity = AUDIO_SAMPLE_RATE as usize * AUDIO_CHANNELS as usize * BUFFER_SECONDS;
        let buffer = Arc::new(Mutex::new(VecDeque::with_capacity(capacity)));
        let overflowed = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), String>>(1);

        let handle = {
            let buffer = buffer.clone();
            let overflowed = overflowed.clone();
            let running = running.clone();
            let config = config.clone();
            std::thread::Builder::new()
                .name("microphone".to_string())
                .spawn(move || {
                    let Some(device) = cpal::default_host().default_input_device() else {
                        let _ = ready_tx.send(Err("default input device disappeared".to_string()));
                        return;
                    };
                    let sink = CaptureSink {
                        converter: PcmConverter::new(config.sample_rate.0, config.channels),
                        scratch: Vec::new(),
                        converted: Vec::new(),
                        buffer,
                        capacity,
                        overflowed,
                    };
                    let stream = match sample_format {
                        SampleFormat::F32 => build_stream::<f32>(&device, &config, sink),
                        SampleFormat::I16 => build_stream::<i16>(&device, &config, sink),
                        SampleFormat::U16 => build_stream::<u16>(&device, &config, sink),
                        other => Err(format!("unsupported sample format {:?}", other)),
                    };
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));

                    while running.load(Ordering::SeqCst) {
                        std::thread::sleep(STREAM_POLL_INTERVAL);
                    }
                    drop(stream);
                    tracing::info!("Microphone stream stopped");
                })?
        };

        let mut source = Self {
            device_name,
            buffer,
            overflowed,
            running,
            handle: Some(handle),
        };

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                tracing::info!(
                    "Microphone capture started: {} ({}Hz, {}ch, {:?})",
                    source.device_name,
                    config.sample_rate.0,
                    config.channels,
                    sample_format
                );
                Ok(source)
            }
            Ok(Err(reason)) => {
                source.close();
                Err(RecorderError::UnsupportedFormat(format!(
                    "Failed to start audio input stream: {}",
                    reason
                )))
            }
            Err(_) => {
                source.close();
                Err(RecorderError::ResourceExhausted(
                    "audio input stream did not start".to_string(),
                ))
            }
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Samples discarded because the buffer was full
    pub fn overflowed_samples(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl AudioSource for MicrophoneSource {
    fn read(&mut self, buf: &mut [i16]) -> RecorderResult<usize> {
        let channels = AUDIO_CHANNELS as usize;
        let mut buffer = self.buffer.lock();
        let available = buffer.len().min(buf.len());
        let count = available - available % channels;
        for (slot, sample) in buf.iter_mut().zip(buffer.drain(..count)) {
            *slot = sample;
        }
        Ok(count)
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// State owned by the stream callback
struct CaptureSink {
    converter: PcmConverter,
    scratch: Vec<i16>,
    converted: Vec<i16>,
    buffer: Arc<Mutex<VecDeque<i16>>>,
    capacity: usize,
    overflowed: Arc<AtomicU64>,
}

impl CaptureSink {
    fn push<T>(&mut self, data: &[T])
    where
        T: Sample,
        i16: FromSample<T>,
    {
        self.scratch.clear();
        self.scratch.extend(data.iter().map(|&s| i16::from_sample(s)));
        self.converted.clear();
        self.converter.push(&self.scratch, &mut self.converted);

        let mut buffer = self.buffer.lock();
        buffer.extend(self.converted.iter().copied());
        let excess = buffer.len().saturating_sub(self.capacity);
        if excess > 0 {
            // Keep whole stereo frames
            let excess = excess + excess % AUDIO_CHANNELS as usize;
            let len = buffer.len();
            buffer.drain(..excess.min(len));
            if self.overflowed.fetch_add(excess as u64, Ordering::Relaxed) == 0 {
                tracing::warn!("Microphone buffer full, dropping oldest audio");
            }
        }
    }
}

fn build_stream<T>(device: &cpal::Device, config: &StreamConfig, mut sink: CaptureSink) -> Result<cpal::Stream, String>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| sink.push(data),
            |err| tracing::error!("Microphone stream error: {}", err),
            None,
        )
        .map_err(|e| e.to_string())
}
