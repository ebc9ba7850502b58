//! Error types and handling
//!
//! Common error types used across the recording pipeline.

use crate::encoder::TrackKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Pipeline-wide error type
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Encoder failure on {track} track: {reason}")]
    EncoderFailure { track: TrackKind, reason: String },

    #[error("Muxer has not started")]
    NotStarted,

    #[error("Incomplete recording: {0}")]
    IncompleteRecording(String),

    #[error("Encoders did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("Recording already in progress")]
    AlreadyRecording,

    #[error("Container writer is closed")]
    WriterClosed,

    #[error("Capture surface has been released")]
    SurfaceReleased,

    #[error("Container error: {0}")]
    Container(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RecorderError {
    /// Stable error code for hosts and logs
    pub fn code(&self) -> &'static str {
        match self {
            RecorderError::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            RecorderError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            RecorderError::EncoderFailure { .. } => "ENCODER_FAILURE",
            RecorderError::NotStarted => "NOT_STARTED",
            RecorderError::IncompleteRecording(_) => "INCOMPLETE_RECORDING",
            RecorderError::StopTimeout(_) => "STOP_TIMEOUT",
            RecorderError::AlreadyRecording => "ALREADY_RECORDING",
            RecorderError::WriterClosed => "WRITER_CLOSED",
            RecorderError::SurfaceReleased => "SURFACE_RELEASED",
            RecorderError::Container(_) => "CONTAINER_ERROR",
            RecorderError::Io(_) => "IO_ERROR",
            RecorderError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Error response handed to the host process
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<RecorderError> for ErrorResponse {
    fn from(error: RecorderError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using RecorderError
pub type RecorderResult<T> = Result<T, RecorderError>;
