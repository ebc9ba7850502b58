//! MP4 output through the ffmpeg command-line tool
//!
//! While recording, each track is spooled to a hidden elementary-stream file
//! next to the destination: Annex-B H.264 for video, raw `s16le` for audio.
//! `finish` hands the spools to `ffmpeg`, which copies the video stream,
//! encodes the PCM to AAC and writes the MP4 into another hidden temp file.
//! That file is renamed into place only after ffmpeg exits successfully.

use super::container::{ContainerWriter, WriterFactory};
use crate::encoder::codec::PCM_CODEC_NAME;
use crate::encoder::h264::H264_CODEC_NAME;
use crate::encoder::{Sample, TrackFormat, TrackKind};
use crate::utils::error::{RecorderError, RecorderResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;

const DEFAULT_FRAME_RATE: u32 = 30;

/// Factory for [`Mp4Writer`]
#[derive(Debug, Clone)]
pub struct Mp4WriterFactory {
    ffmpeg: PathBuf,
}

impl Default for Mp4WriterFactory {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

impl Mp4WriterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific ffmpeg binary instead of the one on `PATH`
    pub fn with_ffmpeg(ffmpeg: impl Into<PathBuf>) -> Self {
        Self { ffmpeg: ffmpeg.into() }
    }
}

impl WriterFactory for Mp4WriterFactory {
    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn create(&self, path: &Path) -> RecorderResult<Box<dyn ContainerWriter>> {
        Ok(Box::new(Mp4Writer::create(path, &self.ffmpeg)?))
    }
}

struct TrackSpool {
    format: TrackFormat,
    file: BufWriter<NamedTempFile>,
    samples: u64,
    first_pts_us: Option<i64>,
    last_pts_us: Option<i64>,
}

/// One spooled track as handed to ffmpeg
#[derive(Debug, Clone, Copy)]
struct SpoolInput<'a> {
    format: &'a TrackFormat,
    path: &'a Path,
    samples: u64,
    first_pts_us: i64,
    last_pts_us: i64,
}

/// MP4 writer for H.264 video and PCM audio tracks
pub struct Mp4Writer {
    path: PathBuf,
    dir: PathBuf,
    ffmpeg: PathBuf,
    tracks: Vec<TrackSpool>,
    started: bool,
}

impl Mp4Writer {
    pub fn create(path: &Path, ffmpeg: &Path) -> RecorderResult<Self> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        Ok(Self {
            path: path.to_path_buf(),
            dir,
            ffmpeg: ffmpeg.to_path_buf(),
            tracks: Vec::new(),
            started: false,
        })
    }

    fn mux(&self, inputs: &[SpoolInput<'_>]) -> RecorderResult<NamedTempFile> {
        let output = tempfile::Builder::new()
            .prefix(".puff-")
            .suffix(".mp4.part")
            .tempfile_in(&self.dir)?;
        let args = ffmpeg_args(inputs, output.path());

        tracing::info!("Running ffmpeg to finalize {:?}: {:?}", self.path, args);

        let result = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| RecorderError::Container(format!("Failed to run ffmpeg: {}", e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(RecorderError::Container(format!(
                "ffmpeg exited with error: {}",
                stderr.trim()
            )));
        }
        Ok(output)
    }
}

impl ContainerWriter for Mp4Writer {
    fn add_track(&mut self, format: &TrackFormat) -> RecorderResult<usize> {
        if self.started {
            return Err(RecorderError::Container(
                "cannot add a track after the container has started".to_string(),
            ));
        }

        let (expected, suffix) = match format.kind {
            TrackKind::Video => (H264_CODEC_NAME, ".h264"),
            TrackKind::Audio => (PCM_CODEC_NAME, ".pcm"),
        };
        if format.codec != expected {
            return Err(RecorderError::UnsupportedFormat(format!(
                "MP4 output expects {} for the {} track, got {}",
                expected, format.kind, format.codec
            )));
        }

        let spool = tempfile::Builder::new()
            .prefix(".puff-")
            .suffix(suffix)
            .tempfile_in(&self.dir)?;
        tracing::debug!("Spooling {} track to {:?}", format.kind, spool.path());

        self.tracks.push(TrackSpool {
            format: format.clone(),
            file: BufWriter::new(spool),
            samples: 0,
            first_pts_us: None,
            last_pts_us: None,
        });
        Ok(self.tracks.len() - 1)
    }

    fn start(&mut self) -> RecorderResult<()> {
        if self.tracks.is_empty() {
            return Err(RecorderError::Container("no tracks to write".to_string()));
        }
        self.started = true;
        Ok(())
    }

    fn write_sample(&mut self, track_index: usize, sample: &Sample) -> RecorderResult<()> {
        if !self.started {
            return Err(RecorderError::NotStarted);
        }
        let Some(track) = self.tracks.get_mut(track_index) else {
            return Err(RecorderError::Container(format!(
                "unknown track index {}",
                track_index
            )));
        };

        track.file.write_all(&sample.payload)?;
        track.samples += 1;
        track.first_pts_us.get_or_insert(sample.pts_us);
        track.last_pts_us = Some(sample.pts_us);
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> RecorderResult<PathBuf> {
        for track in &mut self.tracks {
            track.file.flush()?;
        }

        let inputs: Vec<SpoolInput<'_>> = self
            .tracks
            .iter()
            .filter_map(|track| match (track.first_pts_us, track.last_pts_us) {
                (Some(first_pts_us), Some(last_pts_us)) if track.samples > 0 => Some(SpoolInput {
                    format: &track.format,
                    path: track.file.get_ref().path(),
                    samples: track.samples,
                    first_pts_us,
                    last_pts_us,
                }),
                _ => {
                    tracing::warn!("{} track has no samples, leaving it out of the MP4", track.format.kind);
                    None
                }
            })
            .collect();

        // An MP4 needs at least one stream with data
        if inputs.is_empty() {
            return Err(RecorderError::IncompleteRecording(
                "no samples were recorded".to_string(),
            ));
        }

        let output = self.mux(&inputs)?;
        output.as_file().sync_all()?;
        output.persist(&self.path).map_err(|e| e.error)?;

        tracing::info!("Container finalized: {:?}", self.path);
        Ok(self.path.clone())
    }

    fn abort(self: Box<Self>) {
        // Dropping the spools deletes them
        tracing::warn!("Container aborted, discarding partial output for {:?}", self.path);
    }
}

/// Average frame rate over the recorded span, falling back to the nominal rate
fn effective_frame_rate(input: &SpoolInput<'_>) -> f64 {
    let span_us = input.last_pts_us - input.first_pts_us;
    if input.samples > 1 && span_us > 0 {
        (input.samples - 1) as f64 * 1_000_000.0 / span_us as f64
    } else {
        input.format.frame_rate.unwrap_or(DEFAULT_FRAME_RATE) as f64
    }
}

fn ffmpeg_args(inputs: &[SpoolInput<'_>], output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".to_string(), "-v".to_string(), "error".to_string()];
    let origin = inputs.iter().map(|i| i.first_pts_us).min().unwrap_or(0);

    for input in inputs {
        let offset_us = input.first_pts_us - origin;
        if offset_us > 0 {
            args.extend(["-itsoffset".to_string(), format!("{:.6}", offset_us as f64 / 1_000_000.0)]);
        }
        match input.format.kind {
            TrackKind::Video => args.extend([
                "-f".to_string(),
                "h264".to_string(),
                "-framerate".to_string(),
                format!("{:.3}", effective_frame_rate(input)),
            ]),
            TrackKind::Audio => args.extend([
                "-f".to_string(),
                "s16le".to_string(),
                "-ar".to_string(),
                input.format.sample_rate.unwrap_or(44_100).to_string(),
                "-ac".to_string(),
                input.format.channels.unwrap_or(2).to_string(),
            ]),
        }
        args.extend(["-i".to_string(), input.path.to_string_lossy().to_string()]);
    }

    for index in 0..inputs.len() {
        args.extend(["-map".to_string(), format!("{}:0", index)]);
    }

    args.extend(["-c:v".to_string(), "copy".to_string()]);
    if let Some(audio) = inputs.iter().find(|i| i.format.kind == TrackKind::Audio) {
        args.extend([
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            audio.format.bitrate.to_string(),
        ]);
    }

    args.extend([
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-f".to_string(),
        "mp4".to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}

/// One stream of a media file as reported by ffprobe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub codec_type: String,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default)]
    pub nb_read_packets: Option<String>,
}

impl MediaStream {
    pub fn packets(&self) -> u64 {
        self.nb_read_packets
            .as_deref()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct StreamList {
    #[serde(default)]
    streams: Vec<MediaStream>,
}

/// List the streams of a finished recording using ffprobe
pub fn list_streams(path: &Path) -> RecorderResult<Vec<MediaStream>> {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-count_packets", "-show_entries"])
        .arg("stream=codec_type,codec_name,nb_read_packets")
        .args(["-of", "json"])
        .arg(path)
        .output()
        .map_err(|e| RecorderError::Container(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RecorderError::Container(format!("ffprobe failed: {}", stderr.trim())));
    }

    let parsed: StreamList = serde_json::from_slice(&output.stdout)?;
    Ok(parsed.streams)
}
