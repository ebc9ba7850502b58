//! In-memory container writer used by the muxer and recorder tests

use super::container::{ContainerWriter, WriterFactory};
use crate::encoder::{Sample, TrackFormat, TrackKind};
use crate::utils::error::{RecorderError, RecorderResult};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterCall {
    AddTrack(TrackKind),
    Start(Instant),
    Sample { track_index: usize, pts_us: i64 },
    Finish,
    Abort,
}

/// Records every call; clones share the same log
#[derive(Debug, Clone)]
pub struct MockWriter {
    path: PathBuf,
    started: bool,
    calls: Arc<Mutex<Vec<WriterCall>>>,
}

impl MockWriter {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("mock.pcf"),
            started: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<WriterCall> {
        self.calls.lock().clone()
    }

    pub fn start_count(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, WriterCall::Start(_))).count()
    }

    pub fn finish_count(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, WriterCall::Finish)).count()
    }

    pub fn sample_count(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, WriterCall::Sample { .. })).count()
    }

    pub fn aborted(&self) -> bool {
        self.calls().iter().any(|c| matches!(c, WriterCall::Abort))
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.calls().into_iter().find_map(|c| match c {
            WriterCall::Start(at) => Some(at),
            _ => None,
        })
    }

    pub fn tracks(&self) -> Vec<TrackKind> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                WriterCall::AddTrack(kind) => Some(kind),
                _ => None,
            })
            .collect()
    }

    pub fn pts_for(&self, index: usize) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                WriterCall::Sample { track_index, pts_us } if track_index == index => Some(pts_us),
                _ => None,
            })
            .collect()
    }
}

impl ContainerWriter for MockWriter {
    fn add_track(&mut self, format: &TrackFormat) -> RecorderResult<usize> {
        let mut calls = self.calls.lock();
        calls.push(WriterCall::AddTrack(format.kind));
        Ok(calls.iter().filter(|c| matches!(c, WriterCall::AddTrack(_))).count() - 1)
    }

    fn start(&mut self) -> RecorderResult<()> {
        self.started = true;
        self.calls.lock().push(WriterCall::Start(Instant::now()));
        Ok(())
    }

    fn write_sample(&mut self, track_index: usize, sample: &Sample) -> RecorderResult<()> {
        if !self.started {
            return Err(RecorderError::NotStarted);
        }
        self.calls.lock().push(WriterCall::Sample {
            track_index,
            pts_us: sample.pts_us,
        });
        Ok(())
    }

    fn finish(self: Box<Self>) -> RecorderResult<PathBuf> {
        self.calls.lock().push(WriterCall::Finish);
        Ok(self.path.clone())
    }

    fn abort(self: Box<Self>) {
        self.calls.lock().push(WriterCall::Abort);
    }
}

/// Hands out clones of one [`MockWriter`]
#[derive(Debug, Clone)]
pub struct MockWriterFactory {
    pub writer: MockWriter,
}

impl MockWriterFactory {
    pub fn new() -> Self {
        Self {
            writer: MockWriter::new(),
        }
    }
}

impl WriterFactory for MockWriterFactory {
    fn extension(&self) -> &'static str {
        "pcf"
    }

    fn create(&self, path: &Path) -> RecorderResult<Box<dyn ContainerWriter>> {
        let mut writer = self.writer.clone();
        writer.path = path.to_path_buf();
        Ok(Box::new(writer))
    }
}

pub fn format_for(kind: TrackKind) -> TrackFormat {
    match kind {
        TrackKind::Video => TrackFormat {
            kind,
            codec: "rle".to_string(),
            bitrate: 1_000_000,
            width: Some(64),
            height: Some(36),
            frame_rate: Some(30),
            sample_rate: None,
            channels: None,
        },
        TrackKind::Audio => TrackFormat {
            kind,
            codec: "pcm_s16le".to_string(),
            bitrate: 64_000,
            width: None,
            height: None,
            frame_rate: None,
            sample_rate: Some(44_100),
            channels: Some(2),
        },
    }
}
