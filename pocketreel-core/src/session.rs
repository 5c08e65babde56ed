// SESSION - one title from open to teardown
//
// ┌─────────┐ video ┌───────────┐ pop ┌──────────────┐ frame ┌───────────┐
// │ Demuxer │──────►│ FrameRing │────►│ VideoDecoder │──────►│ Converter │──► Surface
// └─────────┘       └───────────┘     └──────────────┘       └───────────┘
//      │ audio      ┌─────────────┐    ┌───────────────┐
//      └───────────►│ AudioFeeder │───►│ AudioPipeline │──► AudioClock ──► PlaybackClock
//                   └─────────────┘    └───────────────┘
//
// Everything except the audio thread runs on the caller's thread, one
// `tick` per display refresh. Each tick refills the buffers, then shows at
// most one frame: the one the playback clock says is due.
//
// A refused audio unit waits in the feeder's pending slot while video keeps
// flowing into the ring. Demuxing only pauses when a second audio unit
// turns up behind it; that one is held here until the first is taken.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audio::{AudioPipeline, AudioSink, AudioStats};
use crate::audio_decode::create_audio_decoder;
use crate::audio_queue::{AudioFeeder, AudioOffer, AudioQueue, FeederStats};
use crate::avi_demux::should_log;
use crate::config::PlayerConfig;
use crate::decode::DecodeOutcome;
use crate::demuxer::{self, DemuxStats, Demuxer, MediaSource};
use crate::error::PlayerError;
use crate::frame_ring::{FrameRing, RingStats};
use crate::hw_decode::{Accelerator, DecoderBackend, DecoderStats, VideoDecoder};
use crate::media::{MediaItem, StreamInfo, UnitKind};
use crate::pixel_convert::{FrameConverter, Surface};
use crate::sync::{PlaybackClock, TimeSource};

/// Frames between timing reports
const TIMING_WINDOW: u64 = 30;

/// Wall time allowed for the audio tail after the last frame
const AUDIO_DRAIN_LIMIT_MS: u64 = 2000;

/// Longest single wait on the audio queue while pre-buffering
const AUDIO_SPACE_WAIT: Duration = Duration::from_millis(20);

/// What a session is built from besides the media itself
pub struct SessionDeps {
    pub time: Arc<dyn TimeSource>,
    pub sink: Box<dyn AudioSink>,
    pub accelerator: Option<Box<dyn Accelerator>>,
    /// Incremented while the session is alive
    pub live: Option<Arc<AtomicUsize>>,
}

impl SessionDeps {
    pub fn new(time: Arc<dyn TimeSource>, sink: Box<dyn AudioSink>) -> Self {
        Self {
            time,
            sink,
            accelerator: None,
            live: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame was converted into the surface
    Presented { frame_index: u64 },
    /// Nothing due yet, or nothing buffered
    Waiting,
    /// Every unit has been played
    Ended,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub title: String,
    pub backend: Option<DecoderBackend>,
    pub audio_driven: bool,
    pub frames_presented: u64,
    /// Discarded by the ring because playback had moved past them
    pub frames_dropped: u64,
    /// Too large for a ring slot; never buffered
    pub frames_skipped: u64,
    pub decode_failures: u64,
    pub convert_failures: u64,
    /// Ticks where a frame was due but the ring was empty
    pub underruns: u64,
    pub position_ms: u64,
    pub ring: RingStats,
    pub demux: DemuxStats,
    pub feeder: FeederStats,
    pub audio: AudioStats,
    pub decoder: DecoderStats,
    pub audio_thread_joined: bool,
}

/// Result of trying to move one unit out of the demuxer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pull {
    Unit,
    /// Both the pending slot and the held unit are occupied
    AudioBlocked,
    RingFull,
    EndOfStream,
}

#[derive(Default)]
struct TimingWindow {
    frames: u64,
    decode_us: u64,
    convert_us: u64,
    max_decode_us: u64,
}

impl TimingWindow {
    fn record(&mut self, decode_us: u64, convert_us: u64) {
        self.frames += 1;
        self.decode_us += decode_us;
        self.convert_us += convert_us;
        self.max_decode_us = self.max_decode_us.max(decode_us);
    }
}

pub struct Session {
    title: String,
    config: PlayerConfig,
    info: StreamInfo,
    demuxer: Box<dyn Demuxer>,
    ring: FrameRing,
    decoder: Option<VideoDecoder>,
    converter: FrameConverter,
    feeder: Option<AudioFeeder>,
    /// Audio unit demuxed while the feeder still had one pending
    held_audio: Vec<u8>,
    audio_held: bool,
    audio: Option<AudioPipeline>,
    clock: PlaybackClock,
    frame_duration_us: u64,
    next_frame_index: u64,
    current_frame: u64,
    position_ms: u64,
    eos: bool,
    audio_end_signalled: bool,
    /// Wall clock when the last frame had been shown
    video_done_at_ms: Option<u64>,
    stopped: bool,
    live: Option<Arc<AtomicUsize>>,
    timing: TimingWindow,
    stats: SessionStats,
}

impl Session {
    /// Open a playlist item relative to `config.media_root`.
    pub fn open(item: &MediaItem, config: &PlayerConfig, deps: SessionDeps) -> Result<Self, PlayerError> {
        let source = MediaSource::from_item(item, &config.media_root)?;
        Self::open_source(item.name(), source, config, deps)
    }

    /// Open, start the audio thread, pre-buffer, then start the clock.
    pub fn open_source(
        title: &str,
        source: MediaSource,
        config: &PlayerConfig,
        deps: SessionDeps,
    ) -> Result<Self, PlayerError> {
        config.validate()?;
        let demuxer = demuxer::open(source, config)?;
        let info = demuxer.info().clone();
        if !info.has_video && !info.has_audio {
            return Err(PlayerError::InvalidFormat(format!("{}: no playable streams", title)));
        }

        let ring = FrameRing::new(config.ring_capacity, config.max_video_unit_size)?;

        let decoder = if info.has_video {
            let accelerator = deps.accelerator.filter(|_| config.hardware_decode);
            Some(VideoDecoder::create(
                info.video_codec,
                info.width,
                info.height,
                accelerator,
                config.hw_failure_limit,
            )?)
        } else {
            None
        };

        let (feeder, audio) = if info.has_audio {
            match open_audio(&info, config, deps.sink) {
                Some((feeder, pipeline)) => (Some(feeder), Some(pipeline)),
                None => (None, None),
            }
        } else {
            (None, None)
        };

        let clock = PlaybackClock::new(deps.time, audio.as_ref().map(|a| a.clock()));

        info!(
            "Opened '{}': {}x{} {:?} @ {:.2} fps, {} frames, audio {:?} {}Hz x{}{}",
            title,
            info.width,
            info.height,
            info.video_codec,
            info.effective_fps(),
            info.total_frames,
            info.audio_codec,
            info.audio_sample_rate,
            info.audio_channels,
            if audio.is_some() { "" } else { " (not played)" }
        );

        if let Some(live) = &deps.live {
            live.fetch_add(1, Ordering::SeqCst);
        }

        let mut session = Self {
            title: title.to_string(),
            config: config.clone(),
            frame_duration_us: info.frame_duration_us(),
            info,
            demuxer,
            ring,
            decoder,
            converter: FrameConverter::new(config.upscale, config.max_upscale),
            feeder,
            held_audio: Vec::new(),
            audio_held: false,
            audio,
            clock,
            next_frame_index: 0,
            current_frame: 0,
            position_ms: 0,
            eos: false,
            audio_end_signalled: false,
            video_done_at_ms: None,
            stopped: false,
            live: deps.live,
            timing: TimingWindow::default(),
            stats: SessionStats {
                title: title.to_string(),
                ..SessionStats::default()
            },
        };

        // The audio thread drains the queue while video pre-buffers
        if let Some(audio) = session.audio.as_mut() {
            audio.start()?;
        }
        session.prebuffer()?;
        session.clock.start();
        Ok(session)
    }

    // ========================================================================
    // Buffering
    // ========================================================================

    fn prebuffer(&mut self) -> Result<(), PlayerError> {
        let started = Instant::now();
        let target = match self.decoder {
            Some(_) => self.config.prebuffer_target(self.info.effective_fps()),
            None => 0,
        };

        let limit = self.config.prebuffer_timeout();
        let stop = loop {
            if self.decoder.is_some() && self.ring.len() >= target {
                break Pull::Unit;
            }
            match self.pull_one()? {
                Pull::Unit => {}
                // Video is still wanted: wait for the audio thread to make room
                Pull::AudioBlocked if self.decoder.is_some() => {
                    let remaining = limit.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        warn!("'{}': audio queue did not drain while pre-buffering", self.title);
                        break Pull::AudioBlocked;
                    }
                    if let Some(feeder) = &self.feeder {
                        feeder.queue().wait_for_space(remaining.min(AUDIO_SPACE_WAIT));
                    }
                }
                other => break other,
            }
        };

        info!(
            "Pre-buffered {}/{} frames, {} audio chunks in {:?}{}",
            self.ring.len(),
            target,
            self.feeder.as_ref().map_or(0, |f| f.queue().len()),
            started.elapsed(),
            match stop {
                Pull::AudioBlocked => " (audio queue full)",
                Pull::EndOfStream => " (end of stream)",
                _ => "",
            }
        );
        Ok(())
    }

    /// Move at most one unit from the demuxer into the ring or the audio
    /// path. Nothing is read while the ring has no room or an audio unit is
    /// already held, so no unit is ever lost for lack of space.
    fn pull_one(&mut self) -> Result<Pull, PlayerError> {
        if !self.flush_audio() {
            return Ok(Pull::AudioBlocked);
        }
        if self.decoder.is_some() && self.ring.is_full() {
            return Ok(Pull::RingFull);
        }
        if self.eos {
            return Ok(Pull::EndOfStream);
        }

        let Some(unit) = self.demuxer.next_unit()? else {
            self.eos = true;
            debug!("'{}': demuxer reached end of stream", self.title);
            return Ok(Pull::EndOfStream);
        };

        match unit.kind {
            UnitKind::Video if self.decoder.is_some() => {
                let frame_index = self.next_frame_index;
                self.next_frame_index += 1;
                if !self.ring.try_push(unit.data, frame_index) {
                    self.stats.frames_skipped += 1;
                    if should_log(self.stats.frames_skipped) {
                        warn!(
                            "Frame {} ({} bytes) exceeds {} byte ring slots, skipped ({} so far)",
                            frame_index,
                            unit.data.len(),
                            self.ring.max_unit_size(),
                            self.stats.frames_skipped
                        );
                    }
                }
            }
            UnitKind::Audio => {
                if let Some(feeder) = self.feeder.as_mut() {
                    match feeder.offer(unit.data) {
                        AudioOffer::Deferred => debug!("Audio queue full, chunk parked"),
                        AudioOffer::Blocked => {
                            self.held_audio.clear();
                            self.held_audio.extend_from_slice(unit.data);
                            self.audio_held = true;
                        }
                        AudioOffer::Queued | AudioOffer::Dropped => {}
                    }
                }
            }
            UnitKind::Video => {}
        }
        Ok(Pull::Unit)
    }

    /// Retry the pending chunk and pass the held unit on once it clears.
    /// False while a unit is still held.
    fn flush_audio(&mut self) -> bool {
        let Some(feeder) = self.feeder.as_mut() else {
            return true;
        };
        if !feeder.retry_pending() {
            return !self.audio_held;
        }
        if self.audio_held {
            self.audio_held = false;
            // The pending slot is free, so this is queued or parked
            feeder.offer(&self.held_audio);
        }
        true
    }

    fn signal_audio_end(&mut self) {
        if self.audio_end_signalled {
            return;
        }
        self.flush_audio();
        if self.audio_held {
            return;
        }
        match self.feeder.as_mut() {
            Some(feeder) => {
                if feeder.finish() {
                    self.audio_end_signalled = true;
                    debug!("'{}': audio end of stream queued", self.title);
                }
            }
            None => self.audio_end_signalled = true,
        }
    }

    // ========================================================================
    // Playback
    // ========================================================================

    /// One display refresh: refill, then present the frame that is due.
    pub fn tick(&mut self, surface: &mut Surface<'_>) -> Result<TickOutcome, PlayerError> {
        if self.stopped {
            return Ok(TickOutcome::Ended);
        }

        for _ in 0..self.config.max_units_per_tick {
            if self.pull_one()? != Pull::Unit {
                break;
            }
        }
        if self.eos {
            self.signal_audio_end();
        }
        if self.is_finished() {
            return Ok(TickOutcome::Ended);
        }
        if self.decoder.is_some() && self.eos && self.ring.is_empty() {
            let wall_ms = self.clock.wall_ms();
            let done_at = *self.video_done_at_ms.get_or_insert(wall_ms);
            if wall_ms.saturating_sub(done_at) > AUDIO_DRAIN_LIMIT_MS {
                warn!("'{}': audio did not drain after the last frame", self.title);
                return Ok(TickOutcome::Ended);
            }
            return Ok(TickOutcome::Waiting);
        }

        let now_ms = self.clock.now_ms();
        self.position_ms = now_ms;

        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(TickOutcome::Waiting);
        };

        let expected = now_ms * 1000 / self.frame_duration_us;
        if self.current_frame > expected {
            return Ok(TickOutcome::Waiting);
        }
        if self.ring.is_empty() {
            self.stats.underruns += 1;
            return Ok(TickOutcome::Waiting);
        }

        if let Some(last_dropped) = self.ring.drop_stale(expected) {
            self.current_frame = last_dropped + 1;
        }

        let Some(slot) = self.ring.pop() else {
            return Ok(TickOutcome::Waiting);
        };
        let frame_index = slot.frame_index();
        // A failed frame still uses up its display slot
        self.current_frame = frame_index + 1;

        let decode_start = Instant::now();
        let frame = match decoder.decode(slot.data()) {
            Ok(DecodeOutcome::Frame(frame)) => frame,
            Ok(DecodeOutcome::NeedMoreData) => return Ok(TickOutcome::Waiting),
            Err(e) => {
                self.stats.decode_failures += 1;
                if should_log(self.stats.decode_failures) {
                    warn!("Frame {} failed to decode: {}", frame_index, e);
                }
                return Ok(TickOutcome::Waiting);
            }
        };
        let decode_us = decode_start.elapsed().as_micros() as u64;

        let convert_start = Instant::now();
        if let Err(e) = self.converter.convert(&frame, surface) {
            self.stats.convert_failures += 1;
            if should_log(self.stats.convert_failures) {
                warn!("Frame {} not shown: {}", frame_index, e);
            }
            return Ok(TickOutcome::Waiting);
        }
        let convert_us = convert_start.elapsed().as_micros() as u64;

        self.stats.frames_presented += 1;
        self.timing.record(decode_us, convert_us);
        if self.timing.frames >= TIMING_WINDOW {
            self.log_timing(now_ms);
        }

        Ok(TickOutcome::Presented { frame_index })
    }

    fn log_timing(&mut self, now_ms: u64) {
        let window = std::mem::take(&mut self.timing);
        let frames = window.frames.max(1);
        debug!(
            "Frame {}: decode avg {}us (max {}us), convert avg {}us, clock {}ms ({}), wall {}ms, ring {}/{}, dropped {}",
            self.current_frame,
            window.decode_us / frames,
            window.max_decode_us,
            window.convert_us / frames,
            now_ms,
            if self.clock.is_audio_driven() { "audio" } else { "wall" },
            self.clock.wall_ms(),
            self.ring.len(),
            self.ring.capacity(),
            self.ring.stats().dropped
        );
    }

    /// True once everything has been played: end of stream, an empty
    /// ring and, when audio is playing, a drained audio thread.
    pub fn is_finished(&self) -> bool {
        if self.stopped {
            return true;
        }
        if !self.eos || !self.ring.is_empty() {
            return false;
        }
        match &self.audio {
            Some(audio) => self.audio_end_signalled && audio.is_finished(),
            None => true,
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Stop the audio thread and release buffers. Safe to call again.
    pub fn stop(&mut self) -> SessionStats {
        if !self.stopped {
            self.stopped = true;
            self.stats.audio_thread_joined = match self.audio.as_mut() {
                Some(audio) => audio.stop(),
                None => true,
            };
            self.ring.clear();
            self.audio_held = false;
            self.held_audio = Vec::new();
            if let Some(live) = &self.live {
                live.fetch_sub(1, Ordering::SeqCst);
            }

            let stats = self.stats();
            info!(
                "Stopped '{}' at {}ms: {} presented, {} dropped, {} skipped, {} decode failures, {} underruns",
                self.title,
                stats.position_ms,
                stats.frames_presented,
                stats.frames_dropped,
                stats.frames_skipped,
                stats.decode_failures,
                stats.underruns
            );
            if !stats.audio_thread_joined {
                warn!("'{}': audio thread did not exit in time", self.title);
            }
            return stats;
        }
        self.stats()
    }

    pub fn stats(&self) -> SessionStats {
        let ring = self.ring.stats();
        SessionStats {
            backend: self.decoder.as_ref().map(|d| d.backend()),
            audio_driven: self.clock.is_audio_driven(),
            frames_dropped: ring.dropped,
            position_ms: self.position_ms,
            ring,
            demux: self.demuxer.stats(),
            feeder: self.feeder.as_ref().map(|f| f.stats()).unwrap_or_default(),
            audio: self.audio.as_ref().map(|a| a.stats()).unwrap_or_default(),
            decoder: self.decoder.as_ref().map(|d| d.stats()).unwrap_or_default(),
            ..self.stats.clone()
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Index of the next frame to show
    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn total_frames(&self) -> u64 {
        self.info.total_frames as u64
    }

    /// Playback clock as of the last tick
    pub fn position_ms(&self) -> u64 {
        self.position_ms
    }

    pub fn is_audio_driven(&self) -> bool {
        self.clock.is_audio_driven()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Audio decoder, queue and output for a session, or `None` to play on
/// the wall clock.
fn open_audio(
    info: &StreamInfo,
    config: &PlayerConfig,
    sink: Box<dyn AudioSink>,
) -> Option<(AudioFeeder, AudioPipeline)> {
    let decoder = match create_audio_decoder(info) {
        Ok(decoder) => decoder,
        Err(e) => {
            warn!("Audio disabled: {}", e);
            return None;
        }
    };
    let queue = Arc::new(AudioQueue::new(
        config.audio_queue_capacity,
        config.max_audio_chunk_size,
    ));
    match AudioPipeline::new(queue.clone(), decoder, sink, config) {
        Ok(pipeline) => Some((AudioFeeder::new(queue), pipeline)),
        Err(e) => {
            warn!("Audio output unavailable, playing without sound: {}", e);
            None
        }
    }
}
