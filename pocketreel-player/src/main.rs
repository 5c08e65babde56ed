//! # PocketReel Player
//!
//! Headless runner for the playback engine: opens one title, plays it
//! against an offscreen panel at the panel's refresh rate and logs the
//! session statistics.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use pocketreel_core::pixel_convert::SurfaceFormat;
use pocketreel_core::player::OffscreenDisplay;
use pocketreel_core::{MediaItem, Player, PlayerConfig, PlayerState, Playlist};

/// Logical panel size; the physical panel is mounted rotated 270°
const PANEL_WIDTH: usize = 320;
const PANEL_HEIGHT: usize = 240;
const PANEL_REFRESH: Duration = Duration::from_micros(16_667);

/// Status line every this many steps
const STATUS_INTERVAL: u64 = 120;

struct Options {
    media: Option<PathBuf>,
    audio: Option<PathBuf>,
    playlist: Option<PathBuf>,
    item: usize,
    config: Option<PathBuf>,
    frames: Option<u64>,
}

fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "pocketreel=info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    tracing::info!("PocketReel v{}", pocketreel_core::VERSION);

    let mut config = match &options.config {
        Some(path) => PlayerConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PlayerConfig::default(),
    };

    let (playlist, item) = match (&options.playlist, &options.media) {
        (Some(path), _) => {
            let playlist = Playlist::load(path)
                .with_context(|| format!("Failed to load playlist {}", path.display()))?;
            (playlist, options.item)
        }
        (None, Some(media)) => {
            let (root, item) = single_item(media, options.audio.as_deref())?;
            config.media_root = root;
            (
                Playlist {
                    title: "command line".into(),
                    items: vec![item],
                },
                0,
            )
        }
        (None, None) => {
            print_usage();
            return Err(anyhow::anyhow!("Nothing to play"));
        }
    };

    run(config, playlist, item, options.frames)
}

fn run(config: PlayerConfig, playlist: Playlist, item: usize, frames: Option<u64>) -> Result<()> {
    let mut player = Player::new(config);
    player.load(playlist);
    if let PlayerState::Error(message) = player.state() {
        return Err(anyhow::anyhow!("{}", message));
    }

    let mut display = OffscreenDisplay::new(PANEL_WIDTH, PANEL_HEIGHT, SurfaceFormat::Rgb565)
        .with_refresh(PANEL_REFRESH);

    player.select(item);
    let mut steps: u64 = 0;
    let mut cancelled = false;
    loop {
        let state = player.step(&mut display).clone();
        steps += 1;
        match state {
            PlayerState::Playing | PlayerState::Preloading => {}
            PlayerState::Error(message) => {
                return Err(anyhow::anyhow!("Playback failed: {}", message));
            }
            PlayerState::Menu | PlayerState::Loading => break,
        }

        if steps % STATUS_INTERVAL == 0 {
            let status = player.status();
            tracing::info!(
                "{}: frame {}/{} ({}%), {}ms",
                status.item.as_deref().unwrap_or("?"),
                status.current_frame,
                status.total_frames,
                status.progress_percent,
                status.position_ms
            );
        }

        if let Some(limit) = frames {
            if !cancelled && display.presented() >= limit {
                tracing::info!("Frame limit {} reached", limit);
                player.cancel();
                cancelled = true;
            }
        }
    }

    match player.last_stats() {
        Some(stats) => {
            tracing::info!(
                "Playback complete: {} presented, {} dropped, {} skipped, {} decode failures in {} steps",
                stats.frames_presented,
                stats.frames_dropped,
                stats.frames_skipped,
                stats.decode_failures,
                steps
            );
            tracing::debug!("{}", serde_json::to_string_pretty(stats)?);
        }
        None => tracing::warn!("No session statistics recorded"),
    }
    Ok(())
}

/// A playlist entry for a file given on the command line, and the
/// directory it resolves against.
fn single_item(media: &Path, audio: Option<&Path>) -> Result<(PathBuf, MediaItem)> {
    let file_name = media
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Not a file: {}", media.display()))?;
    let root = media
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut item = MediaItem::new(file_name.to_string_lossy(), file_name);
    if let Some(audio) = audio {
        let audio_name = audio
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Not a file: {}", audio.display()))?;
        if audio.parent() != media.parent() {
            return Err(anyhow::anyhow!(
                "Audio file must sit next to the video file"
            ));
        }
        item.audio_file = Some(PathBuf::from(audio_name));
    }
    Ok((root, item))
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut options = Options {
        media: None,
        audio: None,
        playlist: None,
        item: 0,
        config: None,
        frames: None,
    };

    let mut i = 1;
    while i < args.len() {
        let value = || {
            args.get(i + 1)
                .ok_or_else(|| anyhow::anyhow!("Missing value for {}", args[i]))
        };
        match args[i].as_str() {
            "--playlist" | "-p" => {
                options.playlist = Some(PathBuf::from(value()?));
                i += 2;
            }
            "--item" => {
                let v = value()?;
                options.item = v
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid item index {}: {}", v, e))?;
                i += 2;
            }
            "--audio" | "-a" => {
                options.audio = Some(PathBuf::from(value()?));
                i += 2;
            }
            "--config" | "-c" => {
                options.config = Some(PathBuf::from(value()?));
                i += 2;
            }
            "--frames" | "-n" => {
                let v = value()?;
                options.frames = Some(
                    v.parse()
                        .map_err(|e| anyhow::anyhow!("Invalid frame count {}: {}", v, e))?,
                );
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other if other.starts_with('-') => {
                print_usage();
                return Err(anyhow::anyhow!("Unknown option {}", other));
            }
            other => {
                options.media = Some(PathBuf::from(other));
                i += 1;
            }
        }
    }
    Ok(options)
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  pocketreel <file.avi | file.h264 [--audio file.aac]> [--config <json>] [--frames <n>]\n  pocketreel --playlist <json> [--item <n>] [--config <json>] [--frames <n>]\n"
    );
}
