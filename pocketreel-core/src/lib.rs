//! # PocketReel Core
//!
//! Playback engine for a handheld with a rotated panel: RIFF/AVI and
//! H.264 + AAC elementary-stream demuxing, bounded buffering, hardware
//! decode with software fallback, rotated color conversion and
//! audio-clocked A/V sync.

// ============================================================================
// Configuration / Errors
// ============================================================================
pub mod config;
pub mod error;
pub mod media;

// ============================================================================
// Container Demuxers
// ============================================================================
pub mod demuxer;
pub mod avi_demux;
pub mod es_demux;
pub mod h264_utils;
pub mod adts;

// ============================================================================
// Buffering
// ============================================================================
pub mod frame_ring;
pub mod audio_queue;

// ============================================================================
// Decoders
// ============================================================================
pub mod decode;
pub mod hw_decode;
pub mod audio_decode;

// ============================================================================
// Output
// ============================================================================
pub mod audio;
pub mod pixel_convert;
pub mod sync;

// ============================================================================
// Playback
// ============================================================================
pub mod session;
pub mod player;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::PlayerConfig;
pub use error::PlayerError;
pub use media::{MediaItem, MediaUnit, Playlist, StreamInfo, UnitKind};
pub use player::{Display, OffscreenDisplay, Player, PlayerCommand, PlayerState, PlayerStatus};
pub use session::{Session, SessionDeps, SessionStats, TickOutcome};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
