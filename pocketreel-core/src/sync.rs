//! Audio/Video Synchronization
//!
//! Audio is the master clock: the position is the number of samples the
//! audio thread has handed to the output. Streams without audio run on
//! wall time. Once audio runs out before video, the clock carries on
//! from the last audio position using wall time.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Time Sources
// ============================================================================

/// Monotonic microsecond counter
pub trait TimeSource: Send + Sync {
    fn now_us(&self) -> u64;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Hand-driven clock for deterministic playback
#[derive(Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now_us.fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: u64) {
        self.now_us.store(ms * 1000, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Audio Clock
// ============================================================================

/// Samples written to the output. Single writer: the audio thread.
///
/// A rate change starts a new segment, so time already played keeps the
/// rate it was played at.
pub struct AudioClock {
    samples_written: AtomicU64,
    sample_rate: AtomicU32,
    /// Position at the start of the current segment
    segment_base_us: AtomicU64,
    segment_start: AtomicU64,
    finished: AtomicBool,
}

impl AudioClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples_written: AtomicU64::new(0),
            sample_rate: AtomicU32::new(sample_rate),
            segment_base_us: AtomicU64::new(0),
            segment_start: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }

    /// Add per-channel sample frames
    pub fn add_samples(&self, n: u64) {
        self.samples_written.fetch_add(n, Ordering::SeqCst);
    }

    pub fn set_sample_rate(&self, rate: u32) {
        if rate == self.sample_rate() {
            return;
        }
        let total = self.samples_written();
        self.segment_base_us.store(self.position_us(), Ordering::SeqCst);
        self.segment_start.store(total, Ordering::SeqCst);
        self.sample_rate.store(rate, Ordering::SeqCst);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::SeqCst)
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written.load(Ordering::SeqCst)
    }

    fn position_us(&self) -> u64 {
        let base = self.segment_base_us.load(Ordering::SeqCst);
        let rate = self.sample_rate() as u64;
        if rate == 0 {
            return base;
        }
        let samples = self
            .samples_written()
            .saturating_sub(self.segment_start.load(Ordering::SeqCst));
        base + samples * 1_000_000 / rate
    }

    pub fn position_ms(&self) -> u64 {
        self.position_us() / 1000
    }

    /// The audio thread has written everything it will write
    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Playback Clock
// ============================================================================

pub struct PlaybackClock {
    time: Arc<dyn TimeSource>,
    audio: Option<Arc<AudioClock>>,
    origin_us: u64,
    /// (audio position, wall time) when the audio thread finished
    audio_end: Option<(u64, u64)>,
    high_water_ms: u64,
}

impl PlaybackClock {
    pub fn new(time: Arc<dyn TimeSource>, audio: Option<Arc<AudioClock>>) -> Self {
        let origin_us = time.now_us();
        Self {
            time,
            audio,
            origin_us,
            audio_end: None,
            high_water_ms: 0,
        }
    }

    /// Restart wall time from now. Audio position is not affected.
    pub fn start(&mut self) {
        self.origin_us = self.time.now_us();
        self.audio_end = None;
        self.high_water_ms = 0;
    }

    pub fn is_audio_driven(&self) -> bool {
        self.audio.is_some()
    }

    /// Current position, never lower than any value returned before.
    pub fn now_ms(&mut self) -> u64 {
        let now_us = self.time.now_us();
        let raw = match &self.audio {
            None => now_us.saturating_sub(self.origin_us) / 1000,
            Some(audio) if audio.is_finished() => {
                let (end_ms, at_us) = *self
                    .audio_end
                    .get_or_insert_with(|| (audio.position_ms(), now_us));
                end_ms + now_us.saturating_sub(at_us) / 1000
            }
            Some(audio) => audio.position_ms(),
        };
        self.high_water_ms = self.high_water_ms.max(raw);
        self.high_water_ms
    }

    pub fn wall_ms(&self) -> u64 {
        self.time.now_us().saturating_sub(self.origin_us) / 1000
    }
}
