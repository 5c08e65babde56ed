//! Player configuration
//!
//! Every tunable of the engine lives here. Defaults match the handheld
//! target (16-slot video ring, 64 KiB frame slots, 300ms pre-buffer).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PlayerError;
use crate::pixel_convert::Upscale;

// ============================================================================
// Elementary stream geometry
// ============================================================================

/// Geometry for elementary streams, which carry no container header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementaryConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl Default for ElementaryConfig {
    fn default() -> Self {
        Self {
            width: 300,
            height: 240,
            fps: 30.0,
        }
    }
}

// ============================================================================
// Player Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Directory that playlist paths are resolved against
    pub media_root: PathBuf,

    /// Video ring slots (K)
    pub ring_capacity: usize,
    /// Largest compressed video unit a ring slot holds
    pub max_video_unit_size: usize,
    /// Largest container chunk the AVI walker will read
    pub max_chunk_size: usize,

    /// Audio chunk queue depth (Q)
    pub audio_queue_capacity: usize,
    /// Largest compressed audio unit
    pub max_audio_chunk_size: usize,

    pub prebuffer_ms: u32,
    pub min_prebuffer_frames: usize,
    /// Longest pre-buffering may wait on a full audio queue
    pub prebuffer_timeout_ms: u64,
    /// Slots kept free when pre-buffering
    pub ring_headroom: usize,
    /// Demux budget per presentation tick
    pub max_units_per_tick: usize,

    pub vsync_timeout_ms: u64,
    pub audio_write_timeout_ms: u64,
    pub audio_stop_timeout_ms: u64,

    /// Software volume, percent
    pub volume: u8,

    pub upscale: Upscale,
    pub max_upscale: u32,

    pub hardware_decode: bool,
    /// Consecutive accelerator failures before it is abandoned for the session
    pub hw_failure_limit: u32,

    pub elementary: ElementaryConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("."),
            ring_capacity: 16,
            max_video_unit_size: 64 * 1024,
            max_chunk_size: 100 * 1024,
            audio_queue_capacity: 16,
            max_audio_chunk_size: 16 * 1024,
            prebuffer_ms: 300,
            min_prebuffer_frames: 3,
            prebuffer_timeout_ms: 2000,
            ring_headroom: 2,
            max_units_per_tick: 8,
            vsync_timeout_ms: 50,
            audio_write_timeout_ms: 100,
            audio_stop_timeout_ms: 500,
            volume: 50,
            upscale: Upscale::Auto,
            max_upscale: 4,
            hardware_decode: true,
            hw_failure_limit: 8,
            elementary: ElementaryConfig::default(),
        }
    }
}

impl PlayerConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PlayerError> {
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

    pub fn from_json(text: &str) -> Result<Self, PlayerError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| PlayerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PlayerError> {
        if self.ring_capacity < self.ring_headroom + 1 {
            return Err(PlayerError::Config(format!(
                "ring_capacity {} leaves no room after headroom {}",
                self.ring_capacity, self.ring_headroom
            )));
        }
        if self.audio_queue_capacity == 0 {
            return Err(PlayerError::Config("audio_queue_capacity must be > 0".into()));
        }
        if self.max_video_unit_size == 0 || self.max_audio_chunk_size == 0 {
            return Err(PlayerError::Config("unit sizes must be > 0".into()));
        }
        if self.max_upscale == 0 {
            return Err(PlayerError::Config("max_upscale must be >= 1".into()));
        }
        if self.volume > 100 {
            return Err(PlayerError::Config(format!("volume {} exceeds 100", self.volume)));
        }
        Ok(())
    }

    /// Pre-buffer depth in frames for a given frame rate.
    pub fn prebuffer_target(&self, fps: f64) -> usize {
        let wanted = (self.prebuffer_ms as f64 * fps / 1000.0) as usize;
        let ceiling = self.ring_capacity.saturating_sub(self.ring_headroom);
        wanted.max(self.min_prebuffer_frames).min(ceiling)
    }

    pub fn prebuffer_timeout(&self) -> Duration {
        Duration::from_millis(self.prebuffer_timeout_ms)
    }

    pub fn vsync_timeout(&self) -> Duration {
        Duration::from_millis(self.vsync_timeout_ms)
    }

    pub fn audio_write_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_write_timeout_ms)
    }

    pub fn audio_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_stop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prebuffer_target_clamps() {
        let config = PlayerConfig::default();
        // 300ms at 30fps = 9 frames
        assert_eq!(config.prebuffer_target(30.0), 9);
        // 300ms at 5fps = 1 frame, raised to the minimum
        assert_eq!(config.prebuffer_target(5.0), 3);
        // 300ms at 60fps = 18 frames, capped at K - 2
        assert_eq!(config.prebuffer_target(60.0), 14);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PlayerConfig::from_json(r#"{ "volume": 80, "upscale": { "fixed": 2 } }"#)
            .unwrap();
        assert_eq!(config.volume, 80);
        assert_eq!(config.upscale, Upscale::Fixed(2));
        assert_eq!(config.ring_capacity, 16);
        assert_eq!(config.elementary.width, 300);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = PlayerConfig::from_json(r#"{ "ring_capacity": 2 }"#).unwrap_err();
        assert!(matches!(err, PlayerError::Config(_)));

        let err = PlayerConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, PlayerError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player.json");
        std::fs::write(&path, r#"{ "prebuffer_ms": 500 }"#).unwrap();

        let config = PlayerConfig::load(&path).unwrap();
        assert_eq!(config.prebuffer_ms, 500);

        let missing = PlayerConfig::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, PlayerError::NotFound(_)));
    }
}
