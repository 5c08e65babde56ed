// PLAYER - playlist state machine and presentation loop
//
//   Loading ──load──► Menu ──select──► Preloading ──open──► Playing
//                      ▲                    │                  │
//                      │                    └──fail──► Error ◄─┤ engine failure
//                      └──────── end / cancel / acknowledge ───┘
//
// One `step` per display refresh: apply queued commands, run the state,
// wait for vsync, present.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::audio::AudioSink;
use crate::avi_demux::should_log;
use crate::config::PlayerConfig;
use crate::error::PlayerError;
use crate::hw_decode::Accelerator;
use crate::media::Playlist;
use crate::pixel_convert::{Surface, SurfaceFormat};
use crate::session::{Session, SessionDeps, SessionStats, TickOutcome};
use crate::sync::{SystemClock, TimeSource};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PlayerState {
    /// No playlist yet
    Loading,
    /// Waiting for a selection
    Menu,
    /// Selection made; the session opens on the next step
    Preloading,
    Playing,
    /// Session failed; waits for `Acknowledge`
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerCommand {
    Select(usize),
    Cancel,
    Acknowledge,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerStatus {
    pub state: PlayerState,
    pub item: Option<String>,
    pub current_frame: u64,
    pub total_frames: u64,
    pub position_ms: u64,
    pub progress_percent: u8,
    pub error: Option<String>,
}

// ============================================================================
// Display
// ============================================================================

/// The panel the player draws into
pub trait Display {
    fn surface(&mut self) -> Surface<'_>;

    /// Block until the next refresh. False when `timeout` passed first.
    fn wait_vsync(&mut self, timeout: Duration) -> bool;

    fn present(&mut self);
}

/// A framebuffer in memory, optionally paced to a fixed refresh rate.
pub struct OffscreenDisplay {
    buffer: Vec<u8>,
    stride: usize,
    rows: usize,
    format: SurfaceFormat,
    refresh: Option<Duration>,
    next_vsync: Option<Instant>,
    presented: u64,
}

impl OffscreenDisplay {
    /// `width` x `height` is the logical (rotated) size
    pub fn new(width: usize, height: usize, format: SurfaceFormat) -> Self {
        Self {
            buffer: vec![0; width * height * format.bytes_per_pixel()],
            stride: height,
            rows: width,
            format,
            refresh: None,
            next_vsync: None,
            presented: 0,
        }
    }

    pub fn with_refresh(mut self, period: Duration) -> Self {
        self.refresh = Some(period);
        self
    }

    /// Physical framebuffer contents
    pub fn frame(&self) -> &[u8] {
        &self.buffer
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl Display for OffscreenDisplay {
    fn surface(&mut self) -> Surface<'_> {
        Surface {
            data: self.buffer.as_mut_slice(),
            stride: self.stride,
            rows: self.rows,
            format: self.format,
        }
    }

    fn wait_vsync(&mut self, timeout: Duration) -> bool {
        let Some(period) = self.refresh else {
            return true;
        };
        let now = Instant::now();
        let due = *self.next_vsync.get_or_insert(now);
        let wait = due.saturating_duration_since(now);
        if wait > timeout {
            thread::sleep(timeout);
            return false;
        }
        thread::sleep(wait);
        // Late refreshes are not made up
        self.next_vsync = Some(due.max(now) + period);
        true
    }

    fn present(&mut self) {
        self.presented += 1;
    }
}

// ============================================================================
// Player
// ============================================================================

pub type SinkFactory = Box<dyn FnMut() -> Box<dyn AudioSink>>;
pub type AcceleratorFactory = Box<dyn FnMut() -> Option<Box<dyn Accelerator>>>;

#[cfg(feature = "audio")]
fn default_sink() -> Box<dyn AudioSink> {
    Box::new(crate::audio::CpalSink::new())
}

#[cfg(not(feature = "audio"))]
fn default_sink() -> Box<dyn AudioSink> {
    Box::new(crate::audio::NullSink::new())
}

pub struct Player {
    config: PlayerConfig,
    state: PlayerState,
    playlist: Playlist,
    selected: Option<usize>,
    session: Option<Session>,
    commands: VecDeque<PlayerCommand>,
    time: Arc<dyn TimeSource>,
    make_sink: SinkFactory,
    make_accelerator: Option<AcceleratorFactory>,
    live_sessions: Arc<AtomicUsize>,
    last_stats: Option<SessionStats>,
    vsync_timeouts: u64,
}

impl Player {
    pub fn new(config: PlayerConfig) -> Self {
        Self {
            config,
            state: PlayerState::Loading,
            playlist: Playlist::default(),
            selected: None,
            session: None,
            commands: VecDeque::new(),
            time: Arc::new(SystemClock::new()),
            make_sink: Box::new(default_sink),
            make_accelerator: None,
            live_sessions: Arc::new(AtomicUsize::new(0)),
            last_stats: None,
            vsync_timeouts: 0,
        }
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn with_sink_factory(mut self, make: impl FnMut() -> Box<dyn AudioSink> + 'static) -> Self {
        self.make_sink = Box::new(make);
        self
    }

    /// Offered to every session; `None` means software decode.
    pub fn with_accelerator_factory(
        mut self,
        make: impl FnMut() -> Option<Box<dyn Accelerator>> + 'static,
    ) -> Self {
        self.make_accelerator = Some(Box::new(make));
        self
    }

    /// Replace the playlist. Any running session is stopped.
    pub fn load(&mut self, playlist: Playlist) {
        self.end_session();
        self.playlist = playlist;
        if self.playlist.is_empty() {
            warn!("Playlist is empty");
            self.state = PlayerState::Error("Playlist is empty".into());
        } else {
            info!(
                "Loaded playlist '{}' with {} items",
                self.playlist.title,
                self.playlist.len()
            );
            self.state = PlayerState::Menu;
        }
    }

    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), PlayerError> {
        match Playlist::load(path) {
            Ok(playlist) => {
                self.load(playlist);
                Ok(())
            }
            Err(e) => {
                error!("Failed to load playlist: {}", e);
                self.state = PlayerState::Error(e.to_string());
                Err(e)
            }
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Queue a command for the next `step`
    pub fn send(&mut self, command: PlayerCommand) {
        self.commands.push_back(command);
    }

    pub fn select(&mut self, index: usize) {
        self.send(PlayerCommand::Select(index));
    }

    pub fn cancel(&mut self) {
        self.send(PlayerCommand::Cancel);
    }

    pub fn acknowledge(&mut self) {
        self.send(PlayerCommand::Acknowledge);
    }

    fn apply(&mut self, command: PlayerCommand) {
        match command {
            PlayerCommand::Select(index) if self.state == PlayerState::Menu => {
                match self.playlist.items.get(index) {
                    Some(item) => {
                        info!("Selected '{}'", item.name());
                        self.selected = Some(index);
                        self.state = PlayerState::Preloading;
                    }
                    None => warn!(
                        "No playlist entry {} ({} items)",
                        index,
                        self.playlist.len()
                    ),
                }
            }
            PlayerCommand::Cancel
                if matches!(self.state, PlayerState::Playing | PlayerState::Preloading) =>
            {
                info!("Playback cancelled");
                self.end_session();
                self.state = PlayerState::Menu;
            }
            PlayerCommand::Acknowledge if matches!(self.state, PlayerState::Error(_)) => {
                self.state = if self.playlist.is_empty() {
                    PlayerState::Loading
                } else {
                    PlayerState::Menu
                };
            }
            other => debug!("Ignoring {:?} in {:?}", other, self.state),
        }
    }

    // ========================================================================
    // Presentation Loop
    // ========================================================================

    /// One display refresh
    pub fn step(&mut self, display: &mut dyn Display) -> &PlayerState {
        while let Some(command) = self.commands.pop_front() {
            self.apply(command);
        }

        let present = match self.state {
            PlayerState::Preloading => self.start_session(display),
            PlayerState::Playing => self.tick_session(display),
            _ => false,
        };

        if !display.wait_vsync(self.config.vsync_timeout()) {
            self.vsync_timeouts += 1;
            if should_log(self.vsync_timeouts) {
                debug!("Vsync wait timed out ({} so far)", self.vsync_timeouts);
            }
        }
        if present {
            display.present();
        }
        &self.state
    }

    /// Open the selected item. The cleared surface is presented either way.
    fn start_session(&mut self, display: &mut dyn Display) -> bool {
        let Some(item) = self
            .selected
            .and_then(|index| self.playlist.items.get(index))
            .cloned()
        else {
            self.state = PlayerState::Menu;
            return false;
        };

        display.surface().clear();
        let deps = SessionDeps {
            time: self.time.clone(),
            sink: (self.make_sink)(),
            accelerator: self.make_accelerator.as_mut().and_then(|make| make()),
            live: Some(self.live_sessions.clone()),
        };

        match Session::open(&item, &self.config, deps) {
            Ok(session) => {
                self.session = Some(session);
                self.state = PlayerState::Playing;
            }
            Err(e) => {
                error!("Failed to start '{}': {}", item.name(), e);
                self.state = PlayerState::Error(e.to_string());
            }
        }
        true
    }

    fn tick_session(&mut self, display: &mut dyn Display) -> bool {
        let Some(session) = self.session.as_mut() else {
            self.state = PlayerState::Menu;
            return false;
        };

        let outcome = {
            let mut surface = display.surface();
            session.tick(&mut surface)
        };
        match outcome {
            Ok(TickOutcome::Presented { .. }) => true,
            Ok(TickOutcome::Waiting) => false,
            Ok(TickOutcome::Ended) => {
                info!("Playback finished");
                self.end_session();
                self.state = PlayerState::Menu;
                false
            }
            Err(e) => {
                error!("Playback failed: {}", e);
                self.end_session();
                self.state = PlayerState::Error(e.to_string());
                false
            }
        }
    }

    fn end_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            self.last_stats = Some(session.stop());
        }
        self.selected = None;
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn state(&self) -> &PlayerState {
        &self.state
    }

    pub fn status(&self) -> PlayerStatus {
        let item = self
            .session
            .as_ref()
            .map(|s| s.title().to_string())
            .or_else(|| {
                self.selected
                    .and_then(|index| self.playlist.items.get(index))
                    .map(|item| item.name().to_string())
            });
        let (current_frame, total_frames, position_ms) = match &self.session {
            Some(session) => (
                session.current_frame(),
                session.total_frames(),
                session.position_ms(),
            ),
            None => (0, 0, 0),
        };
        let progress_percent = if total_frames > 0 {
            (current_frame * 100 / total_frames).min(100) as u8
        } else {
            0
        };
        let error = match &self.state {
            PlayerState::Error(message) => Some(message.clone()),
            _ => None,
        };

        PlayerStatus {
            state: self.state.clone(),
            item,
            current_frame,
            total_frames,
            position_ms,
            progress_percent,
            error,
        }
    }

    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Stats of the most recently stopped session
    pub fn last_stats(&self) -> Option<&SessionStats> {
        self.last_stats.as_ref()
    }

    /// Sessions opened and not yet stopped
    pub fn live_sessions(&self) -> usize {
        self.live_sessions.load(Ordering::SeqCst)
    }

    pub fn vsync_timeouts(&self) -> u64 {
        self.vsync_timeouts
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.end_session();
    }
}
