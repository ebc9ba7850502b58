//! Puff Recorder - screen and audio recording pipeline.
//!
//! Coordinates per-track encoders feeding a shared container writer that only
//! starts once every expected track is ready, and tears the pipeline down
//! deterministically on stop.

pub mod capture;
pub mod encoder;
pub mod muxer;
pub mod recorder;
pub mod utils;

pub use encoder::{EncoderHandle, EncoderState, Sample, TrackKind};
pub use muxer::{list_streams, MediaStream, Mp4WriterFactory, MuxerState, MuxerWrapper};
pub use recorder::{
    PipelineConfig, Recorder, RecorderBackend, RecorderSettings, RecorderState, RecordingEvent, RecordingOutput,
    StreamSet,
};
pub use utils::{ErrorResponse, RecorderError, RecorderResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "puff_recorder=debug,puff_record=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
