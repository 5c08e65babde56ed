//! Engine-level error type
//!
//! Per-module errors (`DemuxError`, `DecodeError`, `SinkError`,
//! `ConvertError`) fold into `PlayerError` at the session boundary.

use thiserror::Error;

use crate::audio::SinkError;
use crate::decode::DecodeError;
use crate::demuxer::DemuxError;
use crate::pixel_convert::ConvertError;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Media not found: {0}")]
    NotFound(String),
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
    #[error("Decoder error: {0}")]
    Decoder(#[from] DecodeError),
    #[error("Audio output error: {0}")]
    Audio(#[from] SinkError),
    #[error("Display error: {0}")]
    Display(#[from] ConvertError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<DemuxError> for PlayerError {
    fn from(e: DemuxError) -> Self {
        match e {
            DemuxError::NotFound(path) => Self::NotFound(path),
            DemuxError::InvalidFormat(msg) => Self::InvalidFormat(msg),
            DemuxError::Io(e) => Self::Io(e),
        }
    }
}

impl From<std::collections::TryReserveError> for PlayerError {
    fn from(e: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory(e.to_string())
    }
}
