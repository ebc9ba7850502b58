//! PCF: a minimal self-describing container used by the pipeline tests
//!
//! Layout (all integers little-endian):
//! - magic `PUFFPCF1`, `u32` header length, JSON header (version + track formats)
//! - sample records: `b'S'`, `u8` track, `u8` flags, `i64` pts, `u32` length, payload
//! - trailer: `b'T'`, `u32` length, JSON per-track index
//! - footer: `u64` trailer offset, magic `PCFEND!!`
//!
//! A file without a valid footer was never finalized and is rejected by the reader.

use super::container::{ContainerWriter, WriterFactory};
use crate::encoder::{Sample, TrackFormat, TrackKind};
use crate::utils::error::{RecorderError, RecorderResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const HEADER_MAGIC: &[u8; 8] = b"PUFFPCF1";
const FOOTER_MAGIC: &[u8; 8] = b"PCFEND!!";
const FORMAT_VERSION: u32 = 1;
const SAMPLE_TAG: u8 = b'S';
const TRAILER_TAG: u8 = b'T';
const KEY_FRAME_FLAG: u8 = 0x01;
const SAMPLE_RECORD_OVERHEAD: usize = 1 + 1 + 1 + 8 + 4;
const FOOTER_LEN: usize = 8 + 8;

/// Per-track entry of the trailer index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackIndex {
    pub samples: u64,
    pub bytes: u64,
    pub key_frames: u64,
    pub first_pts_us: Option<i64>,
    pub last_pts_us: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PcfHeader {
    version: u32,
    tracks: Vec<TrackFormat>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PcfTrailer {
    tracks: Vec<TrackIndex>,
}

/// Factory for [`PcfWriter`]
#[derive(Debug, Default, Clone, Copy)]
pub struct PcfWriterFactory;

impl WriterFactory for PcfWriterFactory {
    fn extension(&self) -> &'static str {
        "pcf"
    }

    fn create(&self, path: &Path) -> RecorderResult<Box<dyn ContainerWriter>> {
        Ok(Box::new(PcfWriter::create(path)?))
    }
}

/// PCF writer
///
/// Data goes to a hidden temp file next to the destination and is renamed
/// into place by `finish`, so readers never observe a half-written file.
pub struct PcfWriter {
    path: PathBuf,
    file: BufWriter<NamedTempFile>,
    tracks: Vec<TrackFormat>,
    index: Vec<TrackIndex>,
    started: bool,
    offset: u64,
}

impl PcfWriter {
    pub fn create(path: &Path) -> RecorderResult<Self> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let temp = tempfile::Builder::new()
            .prefix(".puff-")
            .suffix(".part")
            .tempfile_in(&dir)?;

        tracing::debug!("Opened container temp file {:?} for {:?}", temp.path(), path);

        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(temp),
            tracks: Vec::new(),
            index: Vec::new(),
            started: false,
            offset: 0,
        })
    }

    fn write_all(&mut self, data: &[u8]) -> RecorderResult<()> {
        self.file.write_all(data)?;
        self.offset += data.len() as u64;
        Ok(())
    }
}

impl ContainerWriter for PcfWriter {
    fn add_track(&mut self, format: &TrackFormat) -> RecorderResult<usize> {
        if self.started {
            return Err(RecorderError::Container(
                "cannot add a track after the container has started".to_string(),
            ));
        }
        self.tracks.push(format.clone());
        self.index.push(TrackIndex::default());
        Ok(self.tracks.len() - 1)
    }

    fn start(&mut self) -> RecorderResult<()> {
        if self.started {
            return Ok(());
        }

        let header = serde_json::to_vec(&PcfHeader {
            version: FORMAT_VERSION,
            tracks: self.tracks.clone(),
        })?;

        let mut buf = BytesMut::with_capacity(HEADER_MAGIC.len() + 4 + header.len());
        buf.put_slice(HEADER_MAGIC);
        buf.put_u32_le(header.len() as u32);
        buf.put_slice(&header);
        self.write_all(&buf)?;

        self.started = true;
        Ok(())
    }

    fn write_sample(&mut self, track_index: usize, sample: &Sample) -> RecorderResult<()> {
        if !self.started {
            return Err(RecorderError::NotStarted);
        }
        let Some(entry) = self.index.get_mut(track_index) else {
            return Err(RecorderError::Container(format!(
                "unknown track index {}",
                track_index
            )));
        };

        entry.samples += 1;
        entry.bytes += sample.payload.len() as u64;
        if sample.key_frame {
            entry.key_frames += 1;
        }
        entry.first_pts_us.get_or_insert(sample.pts_us);
        entry.last_pts_us = Some(sample.pts_us);

        let mut buf = BytesMut::with_capacity(SAMPLE_RECORD_OVERHEAD + sample.payload.len());
        buf.put_u8(SAMPLE_TAG);
        buf.put_u8(track_index as u8);
        buf.put_u8(if sample.key_frame { KEY_FRAME_FLAG } else { 0 });
        buf.put_i64_le(sample.pts_us);
        buf.put_u32_le(sample.payload.len() as u32);
        buf.put_slice(&sample.payload);
        self.write_all(&buf)
    }

    fn finish(mut self: Box<Self>) -> RecorderResult<PathBuf> {
        if !self.started {
            self.start()?;
        }

        let trailer_offset = self.offset;
        let trailer = serde_json::to_vec(&PcfTrailer {
            tracks: self.index.clone(),
        })?;

        let mut buf = BytesMut::with_capacity(1 + 4 + trailer.len() + FOOTER_LEN);
        buf.put_u8(TRAILER_TAG);
        buf.put_u32_le(trailer.len() as u32);
        buf.put_slice(&trailer);
        buf.put_u64_le(trailer_offset);
        buf.put_slice(FOOTER_MAGIC);
        self.write_all(&buf)?;

        let PcfWriter { path, file, .. } = *self;
        let temp = file.into_inner().map_err(|e| e.into_error())?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| e.error)?;

        tracing::info!("Container finalized: {:?}", path);
        Ok(path)
    }

    fn abort(self: Box<Self>) {
        // Dropping the temp file deletes it
        tracing::warn!("Container aborted, discarding partial output for {:?}", self.path);
    }
}

/// A demuxed PCF file
#[derive(Debug, Clone)]
pub struct Container {
    pub tracks: Vec<TrackFormat>,
    pub index: Vec<TrackIndex>,
    /// Samples per track, in file order
    pub samples: Vec<Vec<Sample>>,
}

impl Container {
    /// Samples of the first track of the given kind
    pub fn track_samples(&self, kind: TrackKind) -> Option<&[Sample]> {
        self.tracks
            .iter()
            .position(|t| t.kind == kind)
            .map(|i| self.samples[i].as_slice())
    }
}

/// Reads and validates finalized PCF files
pub struct ContainerReader;

impl ContainerReader {
    pub fn open(path: &Path) -> RecorderResult<Container> {
        let data = fs::read(path)?;
        Self::parse(Bytes::from(data))
    }

    pub fn parse(data: Bytes) -> RecorderResult<Container> {
        let corrupt = |what: &str| RecorderError::Container(format!("corrupt container: {}", what));

        if data.len() < HEADER_MAGIC.len() + 4 + FOOTER_LEN || &data[..8] != HEADER_MAGIC {
            return Err(corrupt("bad header magic"));
        }
        if &data[data.len() - 8..] != FOOTER_MAGIC {
            return Err(corrupt("missing footer, file was not finalized"));
        }

        let mut footer = &data[data.len() - FOOTER_LEN..];
        let trailer_offset = footer.get_u64_le() as usize;
        if trailer_offset < HEADER_MAGIC.len() + 4 || trailer_offset >= data.len() - FOOTER_LEN {
            return Err(corrupt("trailer offset out of range"));
        }

        let mut cursor = &data[HEADER_MAGIC.len()..trailer_offset];
        let header_len = cursor.get_u32_le() as usize;
        if cursor.remaining() < header_len {
            return Err(corrupt("truncated header"));
        }
        let header: PcfHeader = serde_json::from_slice(&cursor[..header_len])?;
        cursor.advance(header_len);
        if header.version != FORMAT_VERSION {
            return Err(corrupt("unsupported version"));
        }

        let mut samples: Vec<Vec<Sample>> = vec![Vec::new(); header.tracks.len()];
        while cursor.has_remaining() {
            if cursor.remaining() < SAMPLE_RECORD_OVERHEAD || cursor.get_u8() != SAMPLE_TAG {
                return Err(corrupt("bad sample record"));
            }
            let track = cursor.get_u8() as usize;
            let flags = cursor.get_u8();
            let pts_us = cursor.get_i64_le();
            let len = cursor.get_u32_le() as usize;
            if cursor.remaining() < len {
                return Err(corrupt("truncated sample payload"));
            }
            let Some(format) = header.tracks.get(track) else {
                return Err(corrupt("sample for unknown track"));
            };
            let offset = trailer_offset - cursor.remaining();
            let payload = data.slice(offset..offset + len);
            cursor.advance(len);
            samples[track].push(Sample {
                track_kind: format.kind,
                payload,
                pts_us,
                key_frame: flags & KEY_FRAME_FLAG != 0,
            });
        }

        let mut trailer = &data[trailer_offset..data.len() - FOOTER_LEN];
        if trailer.remaining() < 5 || trailer.get_u8() != TRAILER_TAG {
            return Err(corrupt("bad trailer"));
        }
        let trailer_len = trailer.get_u32_le() as usize;
        if trailer.remaining() != trailer_len {
            return Err(corrupt("trailer length mismatch"));
        }
        let trailer: PcfTrailer = serde_json::from_slice(trailer)?;

        if trailer.tracks.len() != header.tracks.len()
            || trailer
                .tracks
                .iter()
                .zip(&samples)
                .any(|(entry, track)| entry.samples != track.len() as u64)
        {
            return Err(corrupt("index does not match sample records"));
        }

        Ok(Container {
            tracks: header.tracks,
            index: trailer.tracks,
            samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn video_format() -> TrackFormat {
        TrackFormat {
            kind: TrackKind::Video,
            codec: "rle".to_string(),
            bitrate: 1000,
            width: Some(2),
            height: Some(2),
            frame_rate: Some(30),
            sample_rate: None,
            channels: None,
        }
    }

    fn audio_format() -> TrackFormat {
        TrackFormat {
            kind: TrackKind::Audio,
            codec: "pcm_s16le".to_string(),
            bitrate: 64000,
            width: None,
            height: None,
            frame_rate: None,
            sample_rate: Some(44100),
            channels: Some(2),
        }
    }

    #[test]
    fn test_write_and_read_container() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("VID_test.pcf");

        let mut writer: Box<dyn ContainerWriter> = PcfWriterFactory.create(&path).unwrap();
        assert_eq!(writer.add_track(&video_format()).unwrap(), 0);
        assert_eq!(writer.add_track(&audio_format()).unwrap(), 1);
        writer.start().unwrap();
        writer
            .write_sample(0, &Sample::new(TrackKind::Video, vec![1, 2, 3], 0, true))
            .unwrap();
        writer
            .write_sample(1, &Sample::new(TrackKind::Audio, vec![4, 5], 100, true))
            .unwrap();
        writer
            .write_sample(0, &Sample::new(TrackKind::Video, vec![6], 33_000, false))
            .unwrap();

        // Nothing visible at the destination until finish
        assert!(!path.exists());
        let written = writer.finish().unwrap();
        assert_eq!(written, path);

        let container = ContainerReader::open(&path).unwrap();
        assert_eq!(container.tracks.len(), 2);
        let video = container.track_samples(TrackKind::Video).unwrap();
        assert_eq!(video.len(), 2);
        assert_eq!(video[0].payload.as_ref(), &[1, 2, 3]);
        assert_eq!(video[1].pts_us, 33_000);
        assert!(!video[1].key_frame);
        assert_eq!(container.index[0].key_frames, 1);
        assert_eq!(container.index[1].first_pts_us, Some(100));
    }

    #[test]
    fn test_empty_tracks_are_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.pcf");

        let mut writer = PcfWriterFactory.create(&path).unwrap();
        writer.add_track(&audio_format()).unwrap();
        writer.start().unwrap();
        writer.finish().unwrap();

        let container = ContainerReader::open(&path).unwrap();
        assert_eq!(container.tracks.len(), 1);
        assert!(container.samples[0].is_empty());
        assert_eq!(container.index[0].last_pts_us, None);
    }

    #[test]
    fn test_write_before_start_is_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = PcfWriterFactory.create(&dir.path().join("a.pcf")).unwrap();
        writer.add_track(&video_format()).unwrap();
        let err = writer
            .write_sample(0, &Sample::new(TrackKind::Video, vec![0], 0, true))
            .unwrap_err();
        assert!(matches!(err, RecorderError::NotStarted));
    }

    #[test]
    fn test_abort_leaves_no_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("aborted.pcf");
        let mut writer = PcfWriterFactory.create(&path).unwrap();
        writer.add_track(&video_format()).unwrap();
        writer.start().unwrap();
        writer.abort();

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.pcf");
        let mut writer = PcfWriterFactory.create(&path).unwrap();
        writer.add_track(&video_format()).unwrap();
        writer.start().unwrap();
        writer
            .write_sample(0, &Sample::new(TrackKind::Video, vec![1; 32], 0, true))
            .unwrap();
        writer.finish().unwrap();

        let data = fs::read(&path).unwrap();
        let truncated = Bytes::copy_from_slice(&data[..data.len() - 4]);
        assert!(matches!(
            ContainerReader::parse(truncated),
            Err(RecorderError::Container(_))
        ));
    }
}
