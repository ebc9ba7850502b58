//! Per-stream encoders
//!
//! A `MediaEncoder` wraps one codec (video or audio), pulls raw input,
//! and pushes compressed samples into a `SampleSink` (the muxer). Readiness
//! and stop notifications go out through an `EncoderListener`.

pub mod codec;
pub mod h264;
pub mod sample;
pub mod signal;
#[cfg(test)]
pub(crate) mod testing;

pub use codec::{Codec, CodecFactory, CodecInput, CodecOutput, CodecParams, SoftwareCodecFactory, TrackFormat};
pub use h264::H264VideoCodec;
pub use sample::{Sample, TrackKind};
pub use signal::FrameSignal;

use crate::capture::{AudioSource, CaptureSurface};
use crate::utils::error::{RecorderError, RecorderResult};
use codec::AUDIO_CHANNELS;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long the video worker waits for a frame hint before re-checking for stop
const VIDEO_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Drain attempts after end-of-stream before giving up on the codec
const MAX_EOS_DRAIN_ATTEMPTS: usize = 200;
const EOS_DRAIN_BACKOFF: Duration = Duration::from_millis(5);

/// Lifecycle of one encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderState {
    Created,
    Prepared,
    Running,
    Stopping,
    Stopped,
}

/// Identity and status of an active encoder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderHandle {
    pub kind: TrackKind,
    pub state: EncoderState,
    /// Assigned by the muxer once the writer has started
    pub track_index: Option<usize>,
    /// Raw inputs submitted to the codec so far
    pub inputs_queued: u64,
}

/// Notification sent from an encoder to the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    Prepared { kind: TrackKind, format: TrackFormat },
    Stopped { kind: TrackKind },
    Failed { kind: TrackKind, reason: String },
}

/// Receives encoder readiness/stop notifications
pub trait EncoderListener: Send + Sync {
    fn on_event(&self, event: EncoderEvent);
}

/// Destination for compressed samples
pub trait SampleSink: Send + Sync {
    fn write_sample(&self, sample: Sample) -> RecorderResult<()>;
}

/// Where an encoder pulls its raw input from
pub enum EncoderInput {
    /// Video frames from the capture surface
    Surface(Arc<CaptureSurface>),
    /// PCM read in chunks of `chunk_frames` stereo frames
    Audio {
        source: Box<dyn AudioSource>,
        chunk_frames: usize,
    },
}

/// Output of one drain pass
#[derive(Debug, Default)]
pub struct Drained {
    pub samples: Vec<Sample>,
    pub end_of_stream: bool,
}

struct InputState {
    input: EncoderInput,
    last_generation: u64,
    frames_read: u64,
    pcm: Vec<i16>,
}

struct EncoderShared {
    kind: TrackKind,
    params: CodecParams,
    state: Mutex<EncoderState>,
    codec: Mutex<Option<Box<dyn Codec>>>,
    input: Mutex<InputState>,
    signal: Arc<FrameSignal>,
    stop_requested: AtomicBool,
    clock: Mutex<Option<Instant>>,
    last_pts_us: Mutex<i64>,
    inputs_queued: AtomicU64,
    poll_interval: Duration,
    listener: Arc<dyn EncoderListener>,
    sink: Arc<dyn SampleSink>,
}

/// One video or audio encoder
pub struct MediaEncoder {
    shared: Arc<EncoderShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MediaEncoder {
    /// Create an encoder in the `Created` state
    pub fn new(
        params: CodecParams,
        codec: Box<dyn Codec>,
        input: EncoderInput,
        listener: Arc<dyn EncoderListener>,
        sink: Arc<dyn SampleSink>,
    ) -> Self {
        let kind = params.kind();
        let (poll_interval, pcm) = match &input {
            EncoderInput::Surface(_) => (VIDEO_POLL_INTERVAL, Vec::new()),
            EncoderInput::Audio { chunk_frames, .. } => {
                let chunk_frames = (*chunk_frames).max(1);
                let micros = chunk_frames as u64 * 1_000_000 / codec::AUDIO_SAMPLE_RATE as u64;
                (
                    Duration::from_micros(micros.max(1_000)),
                    vec![0i16; chunk_frames * AUDIO_CHANNELS as usize],
                )
            }
        };

        Self {
            shared: Arc::new(EncoderShared {
                kind,
                params,
                state: Mutex::new(EncoderState::Created),
                codec: Mutex::new(Some(codec)),
                input: Mutex::new(InputState {
                    input,
                    last_generation: 0,
                    frames_read: 0,
                    pcm,
                }),
                signal: Arc::new(FrameSignal::new()),
                stop_requested: AtomicBool::new(false),
                clock: Mutex::new(None),
                last_pts_us: Mutex::new(0),
                inputs_queued: AtomicU64::new(0),
                poll_interval,
                listener,
                sink,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.shared.kind
    }

    pub fn state(&self) -> EncoderState {
        *self.shared.state.lock()
    }

    /// Snapshot of this encoder's identity; the track index is filled in by the muxer
    pub fn handle(&self) -> EncoderHandle {
        EncoderHandle {
            kind: self.shared.kind,
            state: self.state(),
            track_index: None,
            inputs_queued: self.inputs_queued(),
        }
    }

    /// The coalescing frame hint consumed by this encoder
    pub fn frame_signal(&self) -> Arc<FrameSignal> {
        self.shared.signal.clone()
    }

    /// Number of raw inputs submitted to the codec so far
    pub fn inputs_queued(&self) -> u64 {
        self.shared.inputs_queued.load(Ordering::Relaxed)
    }

    /// Configure the codec and announce the track format
    pub fn prepare(&self) -> RecorderResult<EncoderHandle> {
        self.shared.prepare()?;
        Ok(self.handle())
    }

    /// Spawn the encoder thread. Prepared -> Running.
    pub fn start(&self) -> RecorderResult<()> {
        {
            let mut state = self.shared.state.lock();
            if *state != EncoderState::Prepared {
                return Err(RecorderError::EncoderFailure {
                    track: self.shared.kind,
                    reason: format!("cannot start from state {:?}", *state),
                });
            }
            *state = EncoderState::Running;
        }
        self.shared.clock.lock().get_or_insert_with(Instant::now);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-encoder", self.shared.kind))
            .spawn(move || run_worker(shared))?;
        *self.worker.lock() = Some(handle);

        tracing::info!("{} encoder running", self.shared.kind);
        Ok(())
    }

    /// Hint that a new frame is ready in the capture surface
    ///
    /// Never blocks; repeated hints before the next drain collapse into one.
    /// Ignored by audio encoders.
    pub fn frame_available_soon(&self) {
        if self.shared.kind == TrackKind::Video {
            self.shared.signal.notify();
        }
    }

    /// Pull pending raw input into the codec, returning whether anything was queued
    pub fn feed_input(&self) -> RecorderResult<bool> {
        self.shared.feed_input()
    }

    /// Non-blocking: collect whatever compressed output the codec has ready
    pub fn drain_output(&self) -> RecorderResult<Drained> {
        self.shared.drain_output()
    }

    /// Signal end-of-stream. The encoder reaches `Stopped` once the codec has drained.
    pub fn request_stop(&self) {
        let inline = {
            let mut state = self.shared.state.lock();
            match *state {
                EncoderState::Created => {
                    *state = EncoderState::Stopped;
                    return;
                }
                EncoderState::Prepared => {
                    *state = EncoderState::Stopping;
                    true
                }
                EncoderState::Running => {
                    *state = EncoderState::Stopping;
                    false
                }
                EncoderState::Stopping | EncoderState::Stopped => return,
            }
        };

        tracing::debug!("{} encoder stop requested", self.shared.kind);
        self.shared.stop_requested.store(true, Ordering::SeqCst);

        if inline {
            // No worker thread was ever started; finish on the caller's thread
            match self.shared.finish_stream() {
                Ok(()) => self.shared.complete(),
                Err(e) => self.shared.fail(e),
            }
        } else {
            self.shared.signal.wake();
        }
    }

    /// Join the worker and free the codec
    pub fn release(&self) {
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("{} encoder thread panicked", self.shared.kind);
            }
        }
        self.shared.release_codec();
    }

    /// Free what can be freed without waiting on a stuck worker
    pub fn force_release(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.signal.wake();

        // Detach the worker; it exits on its own once the codec returns
        drop(self.worker.lock().take());

        match self.shared.codec.try_lock_for(Duration::from_millis(100)) {
            Some(mut codec) => {
                if let Some(mut codec) = codec.take() {
                    codec.release();
                }
            }
            None => tracing::warn!(
                "{} codec still busy during forced release",
                self.shared.kind
            ),
        }
        *self.shared.state.lock() = EncoderState::Stopped;
    }
}

impl Drop for MediaEncoder {
    fn drop(&mut self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.signal.wake();
    }
}

impl EncoderShared {
    fn prepare(&self) -> RecorderResult<()> {
        let mut state = self.state.lock();
        if *state != EncoderState::Created {
            return Err(RecorderError::EncoderFailure {
                track: self.kind,
                reason: format!("cannot prepare from state {:?}", *state),
            });
        }

        let format = {
            let mut codec = self.codec.lock();
            let codec = codec.as_mut().ok_or_else(|| {
                RecorderError::ResourceExhausted(format!("{} codec already released", self.kind))
            })?;
            codec.configure(&self.params)?
        };

        *state = EncoderState::Prepared;
        drop(state);

        tracing::info!("{} encoder prepared: codec={}, bitrate={}", self.kind, format.codec, format.bitrate);
        self.listener.on_event(EncoderEvent::Prepared {
            kind: self.kind,
            format,
        });
        Ok(())
    }

    fn feed_input(&self) -> RecorderResult<bool> {
        let mut guard = self.input.lock();
        let InputState {
            input,
            last_generation,
            frames_read,
            pcm,
        } = &mut *guard;

        match input {
            EncoderInput::Surface(surface) => {
                if !self.signal.take() {
                    return Ok(false);
                }
                let Some((generation, frame)) = surface.frame_since(*last_generation) else {
                    return Ok(false);
                };
                *last_generation = generation;

                let pts_us = self.next_video_pts();
                self.queue(CodecInput::Frame {
                    data: &frame,
                    pts_us,
                })?;
                Ok(true)
            }
            EncoderInput::Audio { source, .. } => {
                let channels = AUDIO_CHANNELS as u64;
                let chunk_frames = (pcm.len() as u64 / channels).max(1);
                let elapsed_us = self.elapsed().as_micros() as u64;
                let due_frames = elapsed_us * codec::AUDIO_SAMPLE_RATE as u64 / 1_000_000;

                let mut queued = false;
                // Stay at most one chunk ahead of wall-clock time
                while *frames_read < due_frames + chunk_frames {
                    let read = source.read(pcm)?;
                    let read = read - read % channels as usize;
                    if read == 0 {
                        break;
                    }
                    let pts_us = (*frames_read * 1_000_000 / codec::AUDIO_SAMPLE_RATE as u64) as i64;
                    self.queue(CodecInput::Pcm {
                        data: &pcm[..read],
                        pts_us,
                    })?;
                    *frames_read += read as u64 / channels;
                    queued = true;
                }
                Ok(queued)
            }
        }
    }

    fn queue(&self, input: CodecInput<'_>) -> RecorderResult<()> {
        let mut codec = self.codec.lock();
        let codec = codec.as_mut().ok_or_else(|| RecorderError::EncoderFailure {
            track: self.kind,
            reason: "codec released".to_string(),
        })?;
        codec.queue_input(input)?;
        self.inputs_queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn elapsed(&self) -> Duration {
        self.clock.lock().get_or_insert_with(Instant::now).elapsed()
    }

    /// Wall-clock pts, clamped so it never goes backwards
    fn next_video_pts(&self) -> i64 {
        let now = self.elapsed().as_micros() as i64;
        let mut last = self.last_pts_us.lock();
        let pts = now.max(*last);
        *last = pts;
        pts
    }

    fn drain_output(&self) -> RecorderResult<Drained> {
        let mut drained = Drained::default();
        let mut codec = self.codec.lock();
        let Some(codec) = codec.as_mut() else {
            drained.end_of_stream = true;
            return Ok(drained);
        };

        while let Some(output) = codec.dequeue_output()? {
            match output {
                CodecOutput::Sample(sample) => drained.samples.push(sample),
                CodecOutput::EndOfStream => {
                    drained.end_of_stream = true;
                    break;
                }
            }
        }
        Ok(drained)
    }

    /// Drain the codec into the sink; returns whether end-of-stream was reached
    fn pump(&self) -> RecorderResult<bool> {
        let drained = self.drain_output()?;
        for sample in drained.samples {
            self.sink.write_sample(sample)?;
        }
        Ok(drained.end_of_stream)
    }

    fn finish_stream(&self) -> RecorderResult<()> {
        {
            let mut codec = self.codec.lock();
            if let Some(codec) = codec.as_mut() {
                codec.signal_end_of_stream()?;
            }
        }

        for _ in 0..MAX_EOS_DRAIN_ATTEMPTS {
            if self.pump()? {
                return Ok(());
            }
            std::thread::sleep(EOS_DRAIN_BACKOFF);
        }

        Err(RecorderError::EncoderFailure {
            track: self.kind,
            reason: "codec never reached end of stream".to_string(),
        })
    }

    fn complete(&self) {
        {
            let mut state = self.state.lock();
            if *state == EncoderState::Stopped {
                return;
            }
            *state = EncoderState::Stopped;
        }
        tracing::info!(
            "{} encoder stopped after {} inputs",
            self.kind,
            self.inputs_queued.load(Ordering::Relaxed)
        );
        self.listener.on_event(EncoderEvent::Stopped { kind: self.kind });
    }

    fn fail(&self, error: RecorderError) {
        {
            let mut state = self.state.lock();
            if *state == EncoderState::Stopped {
                return;
            }
            *state = EncoderState::Stopped;
        }
        tracing::error!("{} encoder failed: {}", self.kind, error);
        self.listener.on_event(EncoderEvent::Failed {
            kind: self.kind,
            reason: error.to_string(),
        });
    }

    fn release_codec(&self) {
        if let Some(mut codec) = self.codec.lock().take() {
            codec.release();
            tracing::debug!("{} codec released", self.kind);
        }
    }
}

fn run_worker(shared: Arc<EncoderShared>) {
    tracing::debug!("{} encoder thread started", shared.kind);

    loop {
        if !shared.stop_requested.load(Ordering::SeqCst) {
            shared.signal.wait_for(shared.poll_interval);
        }

        if shared.stop_requested.load(Ordering::SeqCst) {
            match shared.finish_stream() {
                Ok(()) => shared.complete(),
                Err(e) => shared.fail(e),
            }
            break;
        }

        match shared.feed_input().and_then(|_| shared.pump()) {
            Ok(false) => {}
            Ok(true) => {
                tracing::warn!("{} codec ended the stream on its own", shared.kind);
                shared.complete();
                break;
            }
            Err(e) => {
                shared.fail(e);
                break;
            }
        }
    }

    tracing::debug!("{} encoder thread exiting", shared.kind);
}
