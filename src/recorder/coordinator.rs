//! Recorder
//!
//! Orchestrates the capture surface, the per-track encoders, the muxer and
//! the frame pacer, and drives the recording lifecycle
//! `Idle -> Configured -> Recording -> Stopping -> Idle`.

use super::output::resolve_output_path;
use super::pacer::{FramePacer, PacerTarget};
use super::state::{PipelineConfig, RecorderSettings, RecorderState, RecordingOutput, StreamSet};
use crate::capture::{
    AudioSource, CaptureSurface, HostLifecycle, MicrophoneSource, MirrorSource, NoopLifecycle, SilenceSource,
};
use crate::encoder::{
    CodecFactory, CodecParams, EncoderHandle, EncoderInput, EncoderListener, FrameSignal, MediaEncoder,
    SampleSink, SoftwareCodecFactory, TrackKind,
};
use crate::muxer::{Mp4WriterFactory, MuxerSummary, MuxerWrapper, WriterFactory};
use crate::utils::error::{RecorderError, RecorderResult};
use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted during recording
#[derive(Debug, Clone)]
pub enum RecordingEvent {
    /// Encoders running
    Started { output_path: PathBuf },
    /// A track announced its format. Its index is assigned when the writer starts.
    TrackReady { kind: TrackKind },
    /// The barrier closed and the container writer started; tracks in final index order
    WriterStarted { tracks: Vec<TrackKind> },
    /// A track was dropped
    TrackFailed { kind: TrackKind, reason: String },
    /// A track reached end of stream
    TrackStopped { kind: TrackKind },
    /// The container file is complete
    Finalized { path: PathBuf },
    /// Teardown finished
    Stopped,
}

/// Collaborators the recorder drives
///
/// The default backend encodes H.264 and PCM in software, writes MP4 through
/// ffmpeg and records the default microphone when no audio source is attached.
pub struct RecorderBackend {
    pub codecs: Arc<dyn CodecFactory>,
    pub writers: Arc<dyn WriterFactory>,
    pub mirror: Option<Box<dyn MirrorSource>>,
    pub audio: Option<Box<dyn AudioSource>>,
    pub lifecycle: Arc<dyn HostLifecycle>,
}

impl Default for RecorderBackend {
    fn default() -> Self {
        Self {
            codecs: Arc::new(SoftwareCodecFactory::new()),
            writers: Arc::new(Mp4WriterFactory::default()),
            mirror: None,
            audio: None,
            lifecycle: Arc::new(NoopLifecycle),
        }
    }
}

impl RecorderBackend {
    pub fn with_codecs(mut self, codecs: Arc<dyn CodecFactory>) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_writers(mut self, writers: Arc<dyn WriterFactory>) -> Self {
        self.writers = writers;
        self
    }

    pub fn with_mirror(mut self, mirror: Box<dyn MirrorSource>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_audio(mut self, audio: Box<dyn AudioSource>) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn HostLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

/// Recording pipeline orchestrator
///
/// One instance drives one recording. After `end_record` the recorder is back
/// in `Idle` and cannot be restarted.
pub struct Recorder {
    config: PipelineConfig,
    settings: RecorderSettings,
    recording_id: Uuid,

    state: Arc<RwLock<RecorderState>>,

    /// Serializes start/end against each other
    control: Mutex<()>,

    surface: Arc<CaptureSurface>,
    muxer: Arc<MuxerWrapper>,
    backend: Mutex<RecorderBackend>,
    mirror_bound: AtomicBool,

    encoders: RwLock<Vec<Arc<MediaEncoder>>>,
    video_signal: RwLock<Option<Arc<FrameSignal>>>,
    frame_hints: AtomicU64,
    pacer: Mutex<Option<FramePacer>>,
    torn_down: Arc<AtomicBool>,
    started_at: Mutex<Option<DateTime<Local>>>,

    event_tx: broadcast::Sender<RecordingEvent>,
}

impl Recorder {
    /// Allocate the capture surface and the muxer. Idle -> Configured.
    pub fn create(
        config: PipelineConfig,
        settings: RecorderSettings,
        backend: RecorderBackend,
    ) -> RecorderResult<Self> {
        config.validate()?;

        let output_path = resolve_output_path(&config, &settings, backend.writers.extension())?;
        let writer = backend.writers.create(&output_path)?;

        let (event_tx, _) = broadcast::channel(100);
        let muxer = MuxerWrapper::new(output_path.clone(), writer, settings.pending_sample_capacity)
            .with_events(event_tx.clone());
        let surface = CaptureSurface::new(config.width, config.height, config.density);

        let recording_id = Uuid::new_v4();
        tracing::info!(
            "Recorder {} configured: {}x{} -> {:?}",
            recording_id,
            config.width,
            config.height,
            output_path
        );

        Ok(Self {
            config,
            settings,
            recording_id,
            state: Arc::new(RwLock::new(RecorderState::Configured)),
            control: Mutex::new(()),
            surface: Arc::new(surface),
            muxer: Arc::new(muxer),
            backend: Mutex::new(backend),
            mirror_bound: AtomicBool::new(false),
            encoders: RwLock::new(Vec::new()),
            video_signal: RwLock::new(None),
            frame_hints: AtomicU64::new(0),
            pacer: Mutex::new(None),
            torn_down: Arc::new(AtomicBool::new(false)),
            started_at: Mutex::new(None),
            event_tx,
        })
    }

    pub fn state(&self) -> RecorderState {
        *self.state.read()
    }

    pub fn recording_id(&self) -> Uuid {
        self.recording_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn output_path(&self) -> &Path {
        self.muxer.output_path()
    }

    /// The surface handed to the mirroring source
    pub fn surface(&self) -> Arc<CaptureSurface> {
        self.surface.clone()
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.event_tx.subscribe()
    }

    /// Identity and state of each active encoder
    pub fn encoder_handles(&self) -> Vec<EncoderHandle> {
        self.encoders
            .read()
            .iter()
            .map(|encoder| {
                let mut handle = encoder.handle();
                handle.track_index = self.muxer.track_index(encoder.kind());
                handle
            })
            .collect()
    }

    /// Frame hints forwarded to the video encoder
    pub fn frame_hints(&self) -> u64 {
        self.frame_hints.load(Ordering::Relaxed)
    }

    /// Build and start the encoders for `stream_set`. Configured -> Recording.
    ///
    /// `stream_set` must match the one the pipeline was configured with.
    /// A track whose codec cannot be allocated is dropped and the recording
    /// continues with the rest. Any other preparation error aborts the whole
    /// pipeline.
    pub fn start_record(&self, stream_set: StreamSet) -> RecorderResult<()> {
        let _control = self.control.lock();
        if *self.state.read() != RecorderState::Configured {
            return Err(RecorderError::AlreadyRecording);
        }
        if stream_set != self.config.stream_set {
            return Err(RecorderError::UnsupportedFormat(format!(
                "recorder was configured for {:?}, cannot record {:?}",
                self.config.stream_set, stream_set
            )));
        }

        let tracks = stream_set.tracks();
        tracing::info!("Starting recording: {:?}", stream_set);
        self.muxer.configure(tracks.len());

        let mut backend = self.backend.lock();
        let mut encoders: Vec<Arc<MediaEncoder>> = Vec::with_capacity(tracks.len());
        let mut exhausted = None;

        for &kind in tracks {
            match self.build_encoder(kind, &mut backend) {
                Ok(encoder) => encoders.push(encoder),
                Err(RecorderError::ResourceExhausted(reason)) => {
                    tracing::warn!("Dropping {} track: {}", kind, reason);
                    self.muxer.on_track_failed(kind, &reason);
                    exhausted = Some(RecorderError::ResourceExhausted(reason));
                }
                Err(e) => {
                    drop(backend);
                    return Err(self.abort_start(encoders, e));
                }
            }
        }

        if encoders.is_empty() {
            drop(backend);
            let error = exhausted
                .unwrap_or_else(|| RecorderError::ResourceExhausted("no track could be prepared".to_string()));
            return Err(self.abort_start(encoders, error));
        }

        let video = encoders.iter().find(|e| e.kind() == TrackKind::Video).cloned();
        if video.is_some() {
            match backend.mirror.as_mut() {
                Some(mirror) => {
                    if let Err(e) = mirror.bind(self.surface.clone()) {
                        drop(backend);
                        return Err(self.abort_start(encoders, e));
                    }
                    self.mirror_bound.store(true, Ordering::SeqCst);
                }
                None => tracing::warn!("No mirroring source attached, video track will be empty"),
            }
        }

        for encoder in &encoders {
            if let Err(e) = encoder.start() {
                drop(backend);
                return Err(self.abort_start(encoders, e));
            }
        }

        if let Some(video) = &video {
            let signal = video.frame_signal();
            *self.video_signal.write() = Some(signal.clone());

            let target = PacerTarget {
                signal,
                torn_down: self.torn_down.clone(),
            };
            match FramePacer::start(self.settings.frame_interval(), target) {
                Ok(pacer) => *self.pacer.lock() = Some(pacer),
                Err(e) => {
                    drop(backend);
                    return Err(self.abort_start(encoders, e));
                }
            }
        }

        backend.lifecycle.recording_started(self.output_path());
        drop(backend);

        *self.encoders.write() = encoders;
        *self.started_at.lock() = Some(Local::now());
        *self.state.write() = RecorderState::Recording;
        let _ = self.event_tx.send(RecordingEvent::Started {
            output_path: self.output_path().to_path_buf(),
        });

        tracing::info!("Recording started");
        Ok(())
    }

    /// Hint that the mirroring source just produced a frame
    ///
    /// No-op unless recording with a video track.
    pub fn frame_available_soon(&self) {
        if *self.state.read() != RecorderState::Recording {
            return;
        }
        if let Some(signal) = self.video_signal.read().as_ref() {
            signal.notify();
            self.frame_hints.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stop every encoder, wait for the container to finalize, then release
    /// everything. Recording -> Stopping -> Idle.
    ///
    /// Returns `Ok(None)` when not recording. Resources are released on every
    /// path, including `StopTimeout`.
    pub fn end_record(&self) -> RecorderResult<Option<RecordingOutput>> {
        let _control = self.control.lock();
        {
            let mut state = self.state.write();
            if *state != RecorderState::Recording {
                tracing::debug!("end_record ignored in state {:?}", *state);
                return Ok(None);
            }
            *state = RecorderState::Stopping;
        }
        tracing::info!("Stopping recording");

        self.torn_down.store(true, Ordering::SeqCst);
        if let Some(pacer) = self.pacer.lock().take() {
            pacer.stop();
        }
        self.unbind_mirror();

        let encoders = self.encoders.read().clone();
        for encoder in &encoders {
            encoder.request_stop();
        }

        let timeout = self.settings.stop_timeout();
        let result = match self.muxer.wait_finished(timeout) {
            Some(result) => {
                for encoder in &encoders {
                    encoder.release();
                }
                result.map(|summary| Some(self.recording_output(summary)))
            }
            None => {
                tracing::warn!("Encoders did not stop within {:?}, forcing release", timeout);
                for encoder in &encoders {
                    encoder.force_release();
                }
                match self.muxer.force_finalize() {
                    Ok(summary) => tracing::warn!("Container force-finalized at {:?}", summary.path),
                    Err(e) => tracing::error!("Forced finalization failed: {}", e),
                }
                Err(RecorderError::StopTimeout(timeout))
            }
        };

        self.teardown();
        result
    }

    fn build_encoder(&self, kind: TrackKind, backend: &mut RecorderBackend) -> RecorderResult<Arc<MediaEncoder>> {
        let params = CodecParams::for_track(kind, &self.config, &self.settings);
        let codec = backend.codecs.create(kind)?;

        let input = match kind {
            TrackKind::Video => EncoderInput::Surface(self.surface.clone()),
            TrackKind::Audio => {
                let source = match backend.audio.take() {
                    Some(source) => source,
                    None => default_audio_source(),
                };
                EncoderInput::Audio {
                    source,
                    chunk_frames: self.settings.audio_chunk_frames,
                }
            }
        };

        let listener: Arc<dyn EncoderListener> = self.muxer.clone();
        let sink: Arc<dyn SampleSink> = self.muxer.clone();
        let encoder = Arc::new(MediaEncoder::new(params, codec, input, listener, sink));
        if let Err(e) = encoder.prepare() {
            encoder.force_release();
            return Err(e);
        }
        Ok(encoder)
    }

    /// Undo a partially built pipeline and return to Idle
    fn abort_start(&self, encoders: Vec<Arc<MediaEncoder>>, error: RecorderError) -> RecorderError {
        tracing::error!("Failed to start recording: {}", error);

        self.torn_down.store(true, Ordering::SeqCst);
        if let Some(pacer) = self.pacer.lock().take() {
            pacer.stop();
        }
        self.unbind_mirror();
        self.muxer.abort();
        for encoder in &encoders {
            encoder.force_release();
        }
        self.surface.release();
        *self.state.write() = RecorderState::Idle;
        error
    }

    fn unbind_mirror(&self) {
        if self.mirror_bound.swap(false, Ordering::SeqCst) {
            if let Some(mirror) = self.backend.lock().mirror.as_mut() {
                mirror.unbind();
            }
        }
    }

    fn teardown(&self) {
        *self.video_signal.write() = None;
        if self.surface.release() {
            tracing::debug!("Capture surface released");
        }
        self.backend.lock().lifecycle.recording_stopped();

        *self.state.write() = RecorderState::Idle;
        let _ = self.event_tx.send(RecordingEvent::Stopped);
        tracing::info!("Recording stopped");
    }

    fn recording_output(&self, summary: MuxerSummary) -> RecordingOutput {
        RecordingOutput {
            recording_id: self.recording_id,
            path: summary.path,
            started_at: (*self.started_at.lock()).unwrap_or_else(Local::now),
            tracks: summary.tracks,
            dropped_samples: summary.dropped_samples,
            failed_tracks: summary.failed_tracks,
        }
    }
}

/// Default microphone, or silence when no input device can be opened
fn default_audio_source() -> Box<dyn AudioSource> {
    match MicrophoneSource::open_default() {
        Ok(microphone) => {
            tracing::info!("Recording audio from {}", microphone.device_name());
            Box::new(microphone)
        }
        Err(e) => {
            tracing::warn!("No microphone available ({}), recording silence", e);
            Box::new(SilenceSource)
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.state() == RecorderState::Recording {
            tracing::warn!("Recorder dropped while recording, stopping");
            if let Err(e) = self.end_record() {
                tracing::error!("Failed to stop recording on drop: {}", e);
            }
        } else if self.state() == RecorderState::Configured {
            self.muxer.abort();
        }
    }
}
