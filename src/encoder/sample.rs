//! Track kinds and compressed samples

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    /// Wire tag used by the container format
    pub fn tag(&self) -> u8 {
        match self {
            TrackKind::Video => 0,
            TrackKind::Audio => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(TrackKind::Video),
            1 => Some(TrackKind::Audio),
            _ => None,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// One compressed access unit produced by an encoder
///
/// Samples are handed straight to the muxer and never outlive the write call
/// (except while parked in the muxer's pre-start queue).
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Track this sample belongs to
    pub track_kind: TrackKind,

    /// Compressed payload
    pub payload: Bytes,

    /// Presentation time relative to stream start, in microseconds
    pub pts_us: i64,

    /// Whether the sample can be decoded independently
    pub key_frame: bool,
}

impl Sample {
    pub fn new(track_kind: TrackKind, payload: impl Into<Bytes>, pts_us: i64, key_frame: bool) -> Self {
        Self {
            track_kind,
            payload: payload.into(),
            pts_us,
            key_frame,
        }
    }
}
