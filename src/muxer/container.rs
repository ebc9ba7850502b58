//! Container writer collaborator
//!
//! The muxer drives a `ContainerWriter` through add_track, start,
//! write_sample and finally finish or abort. Writers must keep the
//! destination path untouched until `finish` publishes the complete file.

use crate::encoder::{Sample, TrackFormat};
use crate::utils::error::RecorderResult;
use std::path::{Path, PathBuf};

/// Writes samples of several tracks into one output file
pub trait ContainerWriter: Send {
    /// Register a track; only valid before `start`
    fn add_track(&mut self, format: &TrackFormat) -> RecorderResult<usize>;

    /// Write the container header. No samples may be written before this.
    fn start(&mut self) -> RecorderResult<()>;

    fn write_sample(&mut self, track_index: usize, sample: &Sample) -> RecorderResult<()>;

    /// Write trailer/index, close, and publish the file at its final path
    fn finish(self: Box<Self>) -> RecorderResult<PathBuf>;

    /// Discard everything written so far
    fn abort(self: Box<Self>);
}

/// Opens container writers for an output path
pub trait WriterFactory: Send + Sync {
    /// File extension used when deriving output names
    fn extension(&self) -> &'static str;

    fn create(&self, path: &Path) -> RecorderResult<Box<dyn ContainerWriter>>;
}
