//! Recording pipeline
//!
//! This module implements the recording lifecycle:
//! - Recorder to orchestrate encoders, muxer and capture surface
//! - FramePacer to drive the video encoder's frame hint
//! - Pipeline configuration, settings and output naming

pub mod coordinator;
pub mod output;
pub mod pacer;
pub mod state;


pub use coordinator::{Recorder, RecorderBackend, RecordingEvent};
pub use pacer::{CancelToken, FramePacer, PacerTarget};
pub use state::{PipelineConfig, RecorderSettings, RecorderState, RecordingOutput, StreamSet};
