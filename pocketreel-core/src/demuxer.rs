//! Demuxer facade
//!
//! Both transports (RIFF/AVI read incrementally from storage, and
//! H.264 + ADTS blobs held in memory) hand out the same `MediaUnit`
//! sequence through the `Demuxer` trait.

use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::avi_demux::AviDemuxer;
use crate::config::PlayerConfig;
use crate::es_demux::ElementaryDemuxer;
use crate::media::{MediaItem, MediaUnit, StreamInfo};

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("Media not found: {0}")]
    NotFound(String),
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Counters kept by every demuxer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DemuxStats {
    pub video_units: u64,
    pub audio_units: u64,
    /// Non-payload chunks stepped over (JUNK, index, unknown streams)
    pub skipped_chunks: u64,
    /// Chunks over the size limit, skipped with a warning
    pub oversized_chunks: u64,
    /// Bytes discarded while hunting for a sync word
    pub resync_bytes: u64,
    pub resyncs: u64,
}

pub trait Demuxer: Send {
    fn info(&self) -> &StreamInfo;

    /// Next unit in stream order. `Ok(None)` is end of stream and stays so.
    fn next_unit(&mut self) -> Result<Option<MediaUnit<'_>>, DemuxError>;

    fn stats(&self) -> DemuxStats;

    fn is_finished(&self) -> bool;
}

// ============================================================================
// Sources
// ============================================================================

pub enum MediaSource {
    /// AVI read incrementally from storage
    AviFile(PathBuf),
    /// AVI already resident in memory
    AviMemory(Bytes),
    /// H.264 Annex-B video with optional AAC-ADTS audio
    Elementary { video: Bytes, audio: Option<Bytes> },
}

impl MediaSource {
    /// Resolve a playlist item against the media root.
    pub fn from_item(item: &MediaItem, root: &Path) -> Result<Self, DemuxError> {
        let video_path = root.join(&item.video_file);
        let ext = video_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match ext.as_str() {
            "avi" => {
                if !video_path.is_file() {
                    return Err(DemuxError::NotFound(video_path.display().to_string()));
                }
                Ok(Self::AviFile(video_path))
            }
            "h264" | "264" | "avc" => {
                let video = read_blob(&video_path)?;
                let audio = match &item.audio_file {
                    Some(audio_file) => Some(read_blob(&root.join(audio_file))?),
                    None => None,
                };
                Ok(Self::Elementary { video, audio })
            }
            _ => Err(DemuxError::InvalidFormat(format!(
                "Unsupported media file: {}",
                video_path.display()
            ))),
        }
    }
}

fn read_blob(path: &Path) -> Result<Bytes, DemuxError> {
    match std::fs::read(path) {
        Ok(data) => Ok(Bytes::from(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(DemuxError::NotFound(path.display().to_string()))
        }
        Err(e) => Err(DemuxError::Io(e)),
    }
}

/// Open a demuxer for the given source.
pub fn open(source: MediaSource, config: &PlayerConfig) -> Result<Box<dyn Demuxer>, DemuxError> {
    match source {
        MediaSource::AviFile(path) => {
            let file = File::open(&path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    DemuxError::NotFound(path.display().to_string())
                } else {
                    DemuxError::Io(e)
                }
            })?;
            let demuxer = AviDemuxer::new(BufReader::new(file), config.max_chunk_size)?;
            Ok(Box::new(demuxer))
        }
        MediaSource::AviMemory(data) => {
            let demuxer = AviDemuxer::new(Cursor::new(data), config.max_chunk_size)?;
            Ok(Box::new(demuxer))
        }
        MediaSource::Elementary { video, audio } => {
            let demuxer = ElementaryDemuxer::new(video, audio, &config.elementary)?;
            Ok(Box::new(demuxer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::UnitKind;
    use crate::testutil::{AviBuilder, H264Builder};

    #[test]
    fn test_from_item_resolves_files() {
        let dir = tempfile::tempdir().unwrap();
        let avi = AviBuilder::new(8, 8, 30).video_frames(2).build();
        std::fs::write(dir.path().join("clip.avi"), &avi).unwrap();

        let item = MediaItem::new("clip", "clip.avi");
        let source = MediaSource::from_item(&item, dir.path()).unwrap();
        let mut demuxer = open(source, &PlayerConfig::default()).unwrap();
        assert_eq!(demuxer.info().width, 8);
        assert_eq!(demuxer.next_unit().unwrap().unwrap().kind, UnitKind::Video);

        let missing = MediaItem::new("gone", "gone.avi");
        assert!(matches!(
            MediaSource::from_item(&missing, dir.path()),
            Err(DemuxError::NotFound(_))
        ));

        let odd = MediaItem::new("odd", "clip.mkv");
        assert!(matches!(
            MediaSource::from_item(&odd, dir.path()),
            Err(DemuxError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_elementary_item_needs_audio_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.h264"), H264Builder::new().pictures(3).build())
            .unwrap();

        let mut item = MediaItem::new("clip", "clip.h264");
        item.audio_file = Some("clip.aac".into());
        assert!(matches!(
            MediaSource::from_item(&item, dir.path()),
            Err(DemuxError::NotFound(_))
        ));

        item.audio_file = None;
        let source = MediaSource::from_item(&item, dir.path()).unwrap();
        let demuxer = open(source, &PlayerConfig::default()).unwrap();
        assert!(demuxer.info().has_video);
        assert!(!demuxer.info().has_audio);
    }
}
