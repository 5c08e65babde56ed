// HW_DECODE - Hardware-first Video Decoder
//
// A platform JPEG/H.264 engine plugs in through the `Accelerator` trait.
// `VideoDecoder` picks the backend once per session:
// • accelerator present and initialised: Hardware, with a software
//   decoder kept alongside to cover units the engine rejects
// • otherwise: Software for the whole session
//
// After `failure_limit` consecutive engine failures the session stops
// trying the engine and stays on the software path.

use serde::{Deserialize, Serialize};

use crate::decode::{
    ensure_len, DecodeError, DecodeOutcome, FrameFormat, FrameGeometry, SoftwareDecoder,
};
use crate::media::VideoCodec;

// ============================================================================
// Accelerator Interface
// ============================================================================

/// A hardware decode engine
pub trait Accelerator {
    fn name(&self) -> &str;

    /// Prepare for a stream. An error keeps the session on software decode.
    fn init(&mut self, codec: VideoCodec, width: u32, height: u32) -> Result<(), DecodeError>;

    /// Decode one unit into `out`, growing it if needed.
    fn decode(&mut self, unit: &[u8], out: &mut Vec<u8>) -> Result<FrameGeometry, DecodeError>;
}

/// Which backend a session ended up on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecoderBackend {
    Hardware,
    Software,
}

impl DecoderBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hardware => "Hardware",
            Self::Software => "Software",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    pub hardware_frames: u64,
    pub software_frames: u64,
    pub hardware_failures: u64,
    pub fallback_units: u64,
    pub abandoned_hardware: bool,
}

// ============================================================================
// Hardware Decoder
// ============================================================================

pub struct HardwareDecoder {
    accel: Box<dyn Accelerator>,
    fallback: Option<SoftwareDecoder>,
    scratch: Vec<u8>,
    consecutive_failures: u32,
    failure_limit: u32,
    abandoned: bool,
    stats: DecoderStats,
}

impl HardwareDecoder {
    fn new(
        accel: Box<dyn Accelerator>,
        fallback: Option<SoftwareDecoder>,
        width: u32,
        height: u32,
        failure_limit: u32,
    ) -> Result<Self, DecodeError> {
        let mut scratch = Vec::new();
        ensure_len(&mut scratch, FrameFormat::Rgb24.buffer_size(width, height))?;
        Ok(Self {
            accel,
            fallback,
            scratch,
            consecutive_failures: 0,
            failure_limit: failure_limit.max(1),
            abandoned: false,
            stats: DecoderStats::default(),
        })
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<DecodeOutcome<'_>, DecodeError> {
        if !self.abandoned {
            match self.accel.decode(data, &mut self.scratch) {
                Ok(geometry) if geometry.len() <= self.scratch.len() => {
                    self.consecutive_failures = 0;
                    self.stats.hardware_frames += 1;
                    return Ok(DecodeOutcome::Frame(geometry.frame(&self.scratch)));
                }
                Ok(geometry) => {
                    self.note_failure(&DecodeError::DecodeFailed(format!(
                        "engine reported {} bytes but wrote {}",
                        geometry.len(),
                        self.scratch.len()
                    )));
                }
                Err(e) => self.note_failure(&e),
            }
        }

        let Some(fallback) = self.fallback.as_mut() else {
            return Err(DecodeError::DecodeFailed(format!(
                "{} failed and no software decoder is available",
                self.accel.name()
            )));
        };
        self.stats.fallback_units += 1;
        let outcome = fallback.decode(data)?;
        if matches!(outcome, DecodeOutcome::Frame(_)) {
            self.stats.software_frames += 1;
        }
        Ok(outcome)
    }

    fn note_failure(&mut self, error: &DecodeError) {
        self.consecutive_failures += 1;
        self.stats.hardware_failures += 1;
        if self.stats.hardware_failures <= 3 {
            tracing::warn!("{} decode failed: {}", self.accel.name(), error);
        }
        if self.consecutive_failures >= self.failure_limit && self.fallback.is_some() {
            self.abandoned = true;
            self.stats.abandoned_hardware = true;
            tracing::warn!(
                "{} failed {} times in a row, software decode for the rest of the session",
                self.accel.name(),
                self.consecutive_failures
            );
        }
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }
}

// ============================================================================
// Unified Decoder
// ============================================================================

pub enum VideoDecoder {
    Hardware(HardwareDecoder),
    Software(SoftwareDecoder),
}

impl VideoDecoder {
    /// Pick a backend for one session. An accelerator that fails to
    /// initialise is discarded and the session decodes in software.
    pub fn create(
        codec: VideoCodec,
        width: u32,
        height: u32,
        accel: Option<Box<dyn Accelerator>>,
        failure_limit: u32,
    ) -> Result<Self, DecodeError> {
        let software = SoftwareDecoder::new(codec, width, height);

        if let Some(mut accel) = accel {
            match accel.init(codec, width, height) {
                Ok(()) => {
                    let fallback = match software {
                        Ok(sw) => Some(sw),
                        Err(e) => {
                            tracing::warn!("No software fallback for {:?}: {}", codec, e);
                            None
                        }
                    };
                    tracing::info!("Video decoder: {} ({:?} {}x{})", accel.name(), codec, width, height);
                    return Ok(Self::Hardware(HardwareDecoder::new(
                        accel,
                        fallback,
                        width,
                        height,
                        failure_limit,
                    )?));
                }
                Err(e) => {
                    tracing::warn!(
                        "{} init failed ({}), using software decode for this session",
                        accel.name(),
                        e
                    );
                }
            }
        }

        let software = software?;
        tracing::info!("Video decoder: {} ({:?} {}x{})", software.name(), codec, width, height);
        Ok(Self::Software(software))
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<DecodeOutcome<'_>, DecodeError> {
        match self {
            Self::Hardware(d) => d.decode(data),
            Self::Software(d) => d.decode(data),
        }
    }

    pub fn backend(&self) -> DecoderBackend {
        match self {
            Self::Hardware(_) => DecoderBackend::Hardware,
            Self::Software(_) => DecoderBackend::Software,
        }
    }

    pub fn stats(&self) -> DecoderStats {
        match self {
            Self::Hardware(d) => d.stats(),
            Self::Software(d) => DecoderStats {
                software_frames: d.frames_decoded(),
                ..DecoderStats::default()
            },
        }
    }
}
