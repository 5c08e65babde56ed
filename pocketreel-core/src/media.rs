// MEDIA - Units, stream description and playlist items
//
// A MediaUnit is one compressed access unit (video picture or audio
// frame). It borrows from the demuxer that produced it, so it is only
// valid until the next call to `next_unit`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::PlayerError;

/// Fallback frame rate when a stream declares none
pub const DEFAULT_FPS: f64 = 30.0;

/// Playlists are capped to what the menu can show
pub const MAX_PLAYLIST_ITEMS: usize = 16;

// ============================================================================
// Units
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy)]
pub struct MediaUnit<'a> {
    pub kind: UnitKind,
    pub data: &'a [u8],
    /// Strictly increasing per demuxer, across both kinds
    pub sequence: u64,
}

// ============================================================================
// Codecs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    Mjpeg,
    RawI420,
    H264,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioCodec {
    Pcm,
    Mp3,
    Aac,
    Unknown,
}

// ============================================================================
// Stream Info
// ============================================================================

/// Immutable description of an opened stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// 0 when unknown (elementary streams)
    pub total_frames: u32,

    pub has_video: bool,
    pub video_codec: VideoCodec,
    pub video_fourcc: String,

    pub has_audio: bool,
    pub audio_codec: AudioCodec,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub audio_bits_per_sample: u16,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            fps: DEFAULT_FPS,
            total_frames: 0,
            has_video: false,
            video_codec: VideoCodec::Unknown,
            video_fourcc: String::new(),
            has_audio: false,
            audio_codec: AudioCodec::Unknown,
            audio_sample_rate: 0,
            audio_channels: 0,
            audio_bits_per_sample: 0,
        }
    }
}

impl StreamInfo {
    pub fn effective_fps(&self) -> f64 {
        if self.fps > 0.0 && self.fps.is_finite() {
            self.fps
        } else {
            DEFAULT_FPS
        }
    }

    pub fn frame_duration_us(&self) -> u64 {
        ((1_000_000.0 / self.effective_fps()) as u64).max(1)
    }

    pub fn duration_ms(&self) -> u64 {
        self.total_frames as u64 * self.frame_duration_us() / 1000
    }
}

// ============================================================================
// Playlist
// ============================================================================

/// One selectable title. Paths are relative to the media root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub video_file: PathBuf,
    /// Elementary-stream titles keep audio in a separate ADTS file
    #[serde(default)]
    pub audio_file: Option<PathBuf>,
    #[serde(default)]
    pub duration_sec: u32,
}

impl MediaItem {
    pub fn new(id: impl Into<String>, video_file: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            video_file: video_file.into(),
            audio_file: None,
            duration_sec: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    #[serde(default)]
    pub title: String,
    pub items: Vec<MediaItem>,
}

impl Playlist {
    pub fn from_json(text: &str) -> Result<Self, PlayerError> {
        let mut playlist: Playlist =
            serde_json::from_str(text).map_err(|e| PlayerError::Config(e.to_string()))?;
        if playlist.items.len() > MAX_PLAYLIST_ITEMS {
            tracing::warn!(
                "Playlist has {} items, keeping the first {}",
                playlist.items.len(),
                MAX_PLAYLIST_ITEMS
            );
            playlist.items.truncate(MAX_PLAYLIST_ITEMS);
        }
        Ok(playlist)
    }

    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, PlayerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PlayerError::NotFound(path.display().to_string())
            } else {
                PlayerError::Io(e)
            }
        })?;
        Self::from_json(&text)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
