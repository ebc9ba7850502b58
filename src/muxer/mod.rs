//! Muxer wrapper
//!
//! Owns the container writer and gates it behind a start barrier: the writer
//! only starts once every expected track has announced its format. Samples
//! that arrive earlier are parked in a bounded per-track queue and flushed in
//! timestamp order when the barrier closes. The file is finalized exactly once,
//! when the last running track stops or fails.

pub mod container;
pub mod mp4;

#[cfg(test)]
pub(crate) mod pcf;
#[cfg(test)]
pub(crate) mod testing;

pub use container::{ContainerWriter, WriterFactory};
pub use mp4::{list_streams, MediaStream, Mp4Writer, Mp4WriterFactory};

use crate::encoder::{EncoderEvent, EncoderListener, Sample, SampleSink, TrackFormat, TrackKind};
use crate::recorder::coordinator::RecordingEvent;
use crate::utils::error::{RecorderError, RecorderResult};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Snapshot of the barrier/finalization counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuxerState {
    pub expected_track_count: usize,
    pub ready_track_count: usize,
    pub started: bool,
    pub finished: bool,
}

/// What ended up in the container for one track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub kind: TrackKind,
    pub track_index: usize,
    pub samples: u64,
    pub first_pts_us: Option<i64>,
    pub last_pts_us: Option<i64>,
}

/// Result of a successful finalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxerSummary {
    pub path: PathBuf,
    pub tracks: Vec<TrackSummary>,
    pub dropped_samples: u64,
    pub failed_tracks: Vec<TrackKind>,
}

#[derive(Debug, Clone)]
enum Outcome {
    Written(PathBuf),
    Incomplete(String),
    Failed(String),
}

#[derive(Debug)]
struct ReadyTrack {
    kind: TrackKind,
    format: TrackFormat,
    samples: u64,
    first_pts_us: Option<i64>,
    last_pts_us: Option<i64>,
}

struct MuxerInner {
    expected_tracks: usize,
    running_tracks: usize,
    /// Registered formats; position is the final track index
    ready: Vec<ReadyTrack>,
    started: bool,
    finished: bool,
    writer: Option<Box<dyn ContainerWriter>>,
    pending: HashMap<TrackKind, VecDeque<Sample>>,
    pending_capacity: usize,
    last_pts: HashMap<TrackKind, i64>,
    dropped_samples: u64,
    failed: Vec<TrackKind>,
    outcome: Option<Outcome>,
    events: Option<broadcast::Sender<RecordingEvent>>,
}

/// Shared container writer gated by the track readiness barrier
pub struct MuxerWrapper {
    output_path: PathBuf,
    inner: Mutex<MuxerInner>,
    finished_cv: Condvar,
}

impl MuxerWrapper {
    pub fn new(output_path: PathBuf, writer: Box<dyn ContainerWriter>, pending_capacity: usize) -> Self {
        Self {
            output_path,
            inner: Mutex::new(MuxerInner {
                expected_tracks: 0,
                running_tracks: 0,
                ready: Vec::new(),
                started: false,
                finished: false,
                writer: Some(writer),
                pending: HashMap::new(),
                pending_capacity: pending_capacity.max(1),
                last_pts: HashMap::new(),
                dropped_samples: 0,
                failed: Vec::new(),
                outcome: None,
                events: None,
            }),
            finished_cv: Condvar::new(),
        }
    }

    /// Publish pipeline events on `events`
    pub fn with_events(self, events: broadcast::Sender<RecordingEvent>) -> Self {
        self.inner.lock().events = Some(events);
        self
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Set how many tracks must become ready before the writer starts
    pub fn configure(&self, expected_track_count: usize) {
        let mut inner = self.inner.lock();
        if inner.started || inner.finished {
            tracing::warn!("Ignoring muxer configure({}) after start", expected_track_count);
            return;
        }
        inner.expected_tracks = expected_track_count;
        inner.running_tracks = expected_track_count;
        tracing::debug!("Muxer expects {} tracks", expected_track_count);
    }

    /// Register a track's format.
    ///
    /// The call that brings the ready count up to the expected count starts
    /// the writer and flushes everything buffered so far. Track indices are
    /// assigned at that point, so this returns `Some(index)` only once the
    /// writer is running; before that a failing track can still shift them.
    pub fn on_track_ready(&self, kind: TrackKind, format: TrackFormat) -> RecorderResult<Option<usize>> {
        let mut inner = self.inner.lock();
        if inner.finished {
            return Err(RecorderError::WriterClosed);
        }
        if inner.ready.iter().any(|t| t.kind == kind) {
            return Ok(inner.final_index(kind));
        }
        if inner.started {
            return Err(RecorderError::Container(format!(
                "{} track became ready after the container started",
                kind
            )));
        }

        inner.ready.push(ReadyTrack {
            kind,
            format,
            samples: 0,
            first_pts_us: None,
            last_pts_us: None,
        });
        tracing::info!(
            "{} track ready ({}/{})",
            kind,
            inner.ready.len(),
            inner.expected_tracks
        );
        inner.emit(RecordingEvent::TrackReady { kind });

        if inner.ready.len() >= inner.expected_tracks {
            if let Err(e) = inner.start_writer() {
                tracing::error!("Failed to start container writer: {}", e);
                inner.finalize();
                self.finished_cv.notify_all();
                return Err(e);
            }
        }
        Ok(inner.final_index(kind))
    }

    /// Accept one sample, buffering it if the barrier has not closed yet
    pub fn write_sample(&self, mut sample: Sample) -> RecorderResult<()> {
        let mut inner = self.inner.lock();
        if inner.finished {
            return Err(RecorderError::WriterClosed);
        }

        let last = inner.last_pts.entry(sample.track_kind).or_insert(sample.pts_us);
        if sample.pts_us < *last {
            tracing::debug!(
                "Clamping {} pts {} to {}",
                sample.track_kind,
                sample.pts_us,
                *last
            );
            sample.pts_us = *last;
        }
        *last = sample.pts_us;

        if inner.started {
            return inner.write_started(sample);
        }

        let capacity = inner.pending_capacity;
        let kind = sample.track_kind;
        let queue = inner.pending.entry(kind).or_default();
        let overflowed = if queue.len() >= capacity {
            queue.pop_front();
            true
        } else {
            false
        };
        queue.push_back(sample);

        if overflowed {
            inner.dropped_samples += 1;
            if inner.dropped_samples == 1 {
                tracing::warn!(
                    "{} pre-start queue full ({} samples), dropping oldest",
                    kind,
                    capacity
                );
            }
        }
        Ok(())
    }

    /// A track reached end of stream; finalizes once no track is running
    pub fn on_track_stopped(&self, kind: TrackKind) {
        let mut inner = self.inner.lock();
        if inner.finished {
            return;
        }
        inner.running_tracks = inner.running_tracks.saturating_sub(1);
        tracing::info!("{} track stopped, {} still running", kind, inner.running_tracks);
        inner.emit(RecordingEvent::TrackStopped { kind });

        if inner.running_tracks == 0 {
            inner.finalize();
            self.finished_cv.notify_all();
        }
    }

    /// A track died. It no longer counts towards the barrier or the running set.
    pub fn on_track_failed(&self, kind: TrackKind, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.finished {
            return;
        }
        tracing::warn!("{} track failed: {}", kind, reason);
        inner.failed.push(kind);
        inner.emit(RecordingEvent::TrackFailed {
            kind,
            reason: reason.to_string(),
        });

        if !inner.started {
            if let Some(position) = inner.ready.iter().position(|t| t.kind == kind) {
                inner.ready.remove(position);
            }
            inner.pending.remove(&kind);
            inner.expected_tracks = inner.expected_tracks.saturating_sub(1);

            if inner.expected_tracks > 0 && inner.ready.len() >= inner.expected_tracks {
                tracing::info!("Barrier closing with reduced track count {}", inner.expected_tracks);
                if let Err(e) = inner.start_writer() {
                    tracing::error!("Failed to start container writer: {}", e);
                    inner.finalize();
                    self.finished_cv.notify_all();
                    return;
                }
            }
        }

        inner.running_tracks = inner.running_tracks.saturating_sub(1);
        if inner.running_tracks == 0 {
            inner.finalize();
            self.finished_cv.notify_all();
        }
    }

    /// Wait up to `timeout` for finalization. `None` if it did not happen in time.
    pub fn wait_finished(&self, timeout: Duration) -> Option<RecorderResult<MuxerSummary>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !inner.finished {
            if self.finished_cv.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        if inner.finished {
            Some(inner.summary())
        } else {
            None
        }
    }

    /// Finalize now, regardless of tracks still running
    pub fn force_finalize(&self) -> RecorderResult<MuxerSummary> {
        let mut inner = self.inner.lock();
        if !inner.finished {
            tracing::warn!(
                "Forcing muxer finalization with {} tracks still running",
                inner.running_tracks
            );
            inner.finalize();
            self.finished_cv.notify_all();
        }
        inner.summary()
    }

    /// Discard the output without finalizing
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        if inner.finished {
            return;
        }
        if let Some(writer) = inner.writer.take() {
            writer.abort();
        }
        inner.pending.clear();
        inner.finished = true;
        inner.outcome = Some(Outcome::Incomplete("recording aborted".to_string()));
        self.finished_cv.notify_all();
    }

    pub fn state(&self) -> MuxerState {
        let inner = self.inner.lock();
        MuxerState {
            expected_track_count: inner.expected_tracks,
            ready_track_count: inner.ready.len(),
            started: inner.started,
            finished: inner.finished,
        }
    }

    /// Final track index of `kind`, once the writer has started
    pub fn track_index(&self, kind: TrackKind) -> Option<usize> {
        self.inner.lock().final_index(kind)
    }
}

impl MuxerInner {
    fn emit(&self, event: RecordingEvent) {
        if let Some(events) = &self.events {
            // No subscribers is fine
            let _ = events.send(event);
        }
    }

    fn final_index(&self, kind: TrackKind) -> Option<usize> {
        if !self.started {
            return None;
        }
        self.ready.iter().position(|t| t.kind == kind)
    }

    fn start_writer(&mut self) -> RecorderResult<()> {
        let writer = self.writer.as_mut().ok_or(RecorderError::WriterClosed)?;
        for track in &self.ready {
            writer.add_track(&track.format)?;
        }
        writer.start()?;
        self.started = true;

        let tracks: Vec<TrackKind> = self.ready.iter().map(|t| t.kind).collect();
        tracing::info!("Muxer started: {} tracks {:?}", tracks.len(), tracks);
        self.emit(RecordingEvent::WriterStarted { tracks });

        self.flush_pending()
    }

    fn flush_pending(&mut self) -> RecorderResult<()> {
        let mut queued: Vec<Sample> = self.pending.drain().flat_map(|(_, queue)| queue).collect();
        if queued.is_empty() {
            return Ok(());
        }
        // Stable sort keeps each track's own order intact
        queued.sort_by_key(|sample| sample.pts_us);
        tracing::debug!("Flushing {} buffered samples", queued.len());

        for sample in queued {
            self.write_started(sample)?;
        }
        Ok(())
    }

    fn write_started(&mut self, sample: Sample) -> RecorderResult<()> {
        let Some(index) = self.ready.iter().position(|t| t.kind == sample.track_kind) else {
            tracing::debug!("Dropping {} sample: track not in container", sample.track_kind);
            self.dropped_samples += 1;
            return Ok(());
        };

        let writer = self.writer.as_mut().ok_or(RecorderError::WriterClosed)?;
        writer.write_sample(index, &sample)?;

        let track = &mut self.ready[index];
        track.samples += 1;
        track.first_pts_us.get_or_insert(sample.pts_us);
        track.last_pts_us = Some(sample.pts_us);
        Ok(())
    }

    fn finalize(&mut self) {
        if self.finished {
            return;
        }

        let outcome = if !self.started && self.ready.is_empty() {
            if let Some(writer) = self.writer.take() {
                writer.abort();
            }
            Outcome::Incomplete("no track ever became ready".to_string())
        } else {
            let started = if self.started {
                Ok(())
            } else {
                tracing::warn!(
                    "Finalizing before the barrier closed: starting with {} of {} tracks",
                    self.ready.len(),
                    self.expected_tracks
                );
                self.start_writer()
            };

            match (started, self.writer.take()) {
                (Ok(()), Some(writer)) => match writer.finish() {
                    Ok(path) => Outcome::Written(path),
                    Err(RecorderError::IncompleteRecording(reason)) => {
                        tracing::warn!("Container has nothing to publish: {}", reason);
                        Outcome::Incomplete(reason)
                    }
                    Err(e) => {
                        tracing::error!("Failed to finalize container: {}", e);
                        Outcome::Failed(e.to_string())
                    }
                },
                (Ok(()), None) => Outcome::Failed("container writer already closed".to_string()),
                (Err(e), writer) => {
                    if let Some(writer) = writer {
                        writer.abort();
                    }
                    Outcome::Failed(e.to_string())
                }
            }
        };

        self.finished = true;
        self.pending.clear();
        if let Outcome::Written(path) = &outcome {
            self.emit(RecordingEvent::Finalized { path: path.clone() });
        }
        self.outcome = Some(outcome);
    }

    fn summary(&self) -> RecorderResult<MuxerSummary> {
        match &self.outcome {
            Some(Outcome::Written(path)) => Ok(MuxerSummary {
                path: path.clone(),
                tracks: self
                    .ready
                    .iter()
                    .enumerate()
                    .map(|(index, track)| TrackSummary {
                        kind: track.kind,
                        track_index: index,
                        samples: track.samples,
                        first_pts_us: track.first_pts_us,
                        last_pts_us: track.last_pts_us,
                    })
                    .collect(),
                dropped_samples: self.dropped_samples,
                failed_tracks: self.failed.clone(),
            }),
            Some(Outcome::Incomplete(reason)) => Err(RecorderError::IncompleteRecording(reason.clone())),
            Some(Outcome::Failed(reason)) => Err(RecorderError::Container(reason.clone())),
            None => Err(RecorderError::NotStarted),
        }
    }
}

impl SampleSink for MuxerWrapper {
    fn write_sample(&self, sample: Sample) -> RecorderResult<()> {
        MuxerWrapper::write_sample(self, sample)
    }
}

impl EncoderListener for MuxerWrapper {
    fn on_event(&self, event: EncoderEvent) {
        match event {
            EncoderEvent::Prepared { kind, format } => {
                if let Err(e) = self.on_track_ready(kind, format) {
                    tracing::error!("Failed to register {} track: {}", kind, e);
                }
            }
            EncoderEvent::Stopped { kind } => self.on_track_stopped(kind),
            EncoderEvent::Failed { kind, reason } => self.on_track_failed(kind, &reason),
        }
    }
}
