//! Fixtures shared by the unit tests: synthetic AVI, H.264 and ADTS
//! streams, a recording audio sink and scripted accelerators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::{AudioSink, SinkError};
use crate::decode::{ensure_len, DecodeError, FrameFormat, FrameGeometry};
use crate::hw_decode::Accelerator;
use crate::media::VideoCodec;
use crate::sync::{ManualClock, TimeSource};

// ============================================================================
// RIFF / AVI
// ============================================================================

/// `fourcc`, little-endian size, body, pad byte if odd
pub fn riff_chunk(fourcc: [u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = fourcc.to_vec();
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    if data.len() % 2 == 1 {
        out.push(0);
    }
    out
}

fn list(list_type: [u8; 4], body: &[u8]) -> Vec<u8> {
    let mut data = list_type.to_vec();
    data.extend_from_slice(body);
    riff_chunk(*b"LIST", &data)
}

fn u32s(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Planar I420 frame with a seed-dependent ramp. Bytes stay below 0x60
/// so no payload can look like a FourCC.
pub fn i420_frame(width: u32, height: u32, seed: u8) -> Vec<u8> {
    let len = FrameFormat::I420.buffer_size(width, height);
    (0..len).map(|i| 0x10 + ((i + seed as usize) % 0x40) as u8).collect()
}

pub struct AviBuilder {
    width: u32,
    height: u32,
    fps: u32,
    us_per_frame: Option<u32>,
    strh_rate: Option<(u32, u32)>,
    video_fourcc: [u8; 4],
    audio: Option<(u32, u16, u16)>,
    movi: Vec<u8>,
    video_count: u32,
}

impl AviBuilder {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            us_per_frame: None,
            strh_rate: None,
            video_fourcc: *b"I420",
            audio: None,
            movi: Vec::new(),
            video_count: 0,
        }
    }

    pub fn video_fourcc(mut self, fourcc: [u8; 4]) -> Self {
        self.video_fourcc = fourcc;
        self
    }

    pub fn pcm_audio(mut self, sample_rate: u32, channels: u16, bits: u16) -> Self {
        self.audio = Some((sample_rate, channels, bits));
        self
    }

    pub fn avih_us_per_frame(mut self, us: u32) -> Self {
        self.us_per_frame = Some(us);
        self
    }

    pub fn strh_rate(mut self, rate: u32, scale: u32) -> Self {
        self.strh_rate = Some((rate, scale));
        self
    }

    pub fn video_chunk(mut self, data: Vec<u8>) -> Self {
        let tag = match &self.video_fourcc {
            b"I420" | b"IYUV" => *b"00db",
            _ => *b"00dc",
        };
        self.movi.extend(riff_chunk(tag, &data));
        self.video_count += 1;
        self
    }

    pub fn audio_chunk(mut self, data: Vec<u8>) -> Self {
        self.movi.extend(riff_chunk(*b"01wb", &data));
        self
    }

    pub fn raw_chunk(mut self, fourcc: [u8; 4], data: Vec<u8>) -> Self {
        self.movi.extend(riff_chunk(fourcc, &data));
        self
    }

    /// `n` raw I420 frames at the builder's size
    pub fn video_frames(mut self, n: u32) -> Self {
        for i in 0..n {
            let frame = i420_frame(self.width, self.height, i as u8);
            self = self.video_chunk(frame);
        }
        self
    }

    pub fn build(self) -> Vec<u8> {
        let streams = if self.audio.is_some() { 2 } else { 1 };
        let us_per_frame = self.us_per_frame.unwrap_or(1_000_000 / self.fps.max(1));
        let (rate, scale) = self.strh_rate.unwrap_or((self.fps, 1));

        let mut avih = u32s(&[
            us_per_frame,
            0,
            0,
            0x10,
            self.video_count,
            0,
            streams,
            0,
            self.width,
            self.height,
        ]);
        avih.extend(u32s(&[0; 4]));

        let video_strh = {
            let mut strh = b"vids".to_vec();
            strh.extend_from_slice(&self.video_fourcc);
            strh.extend(u32s(&[0]));
            strh.extend_from_slice(&[0; 4]); // priority, language
            strh.extend(u32s(&[0, scale, rate, 0, self.video_count, 0, 0, 0]));
            strh.extend_from_slice(&[0; 8]); // rcFrame
            strh
        };
        let video_strf = {
            let mut strf = u32s(&[40, self.width, self.height]);
            strf.extend_from_slice(&1u16.to_le_bytes());
            strf.extend_from_slice(&12u16.to_le_bytes());
            strf.extend_from_slice(&self.video_fourcc);
            strf.extend(u32s(&[FrameFormat::I420.buffer_size(self.width, self.height) as u32, 0, 0, 0, 0]));
            strf
        };
        let mut strl = riff_chunk(*b"strh", &video_strh);
        strl.extend(riff_chunk(*b"strf", &video_strf));

        let mut hdrl = riff_chunk(*b"avih", &avih);
        hdrl.extend(list(*b"strl", &strl));

        if let Some((sample_rate, channels, bits)) = self.audio {
            let block_align = channels * bits / 8;
            let mut strh = b"auds".to_vec();
            strh.extend(u32s(&[0, 0]));
            strh.extend_from_slice(&[0; 4]);
            strh.extend(u32s(&[0, 1, sample_rate, 0, 0, 0, 0, block_align as u32]));
            strh.extend_from_slice(&[0; 8]);

            let mut strf = Vec::new();
            strf.extend_from_slice(&1u16.to_le_bytes());
            strf.extend_from_slice(&channels.to_le_bytes());
            strf.extend_from_slice(&sample_rate.to_le_bytes());
            strf.extend_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
            strf.extend_from_slice(&block_align.to_le_bytes());
            strf.extend_from_slice(&bits.to_le_bytes());
            strf.extend_from_slice(&0u16.to_le_bytes());

            let mut strl = riff_chunk(*b"strh", &strh);
            strl.extend(riff_chunk(*b"strf", &strf));
            hdrl.extend(list(*b"strl", &strl));
        }

        let mut body = b"AVI ".to_vec();
        body.extend(list(*b"hdrl", &hdrl));
        body.extend(list(*b"movi", &self.movi));
        riff_chunk(*b"RIFF", &body)
    }
}

// ============================================================================
// H.264 Annex B / ADTS
// ============================================================================

pub struct H264Builder {
    pictures: usize,
}

impl H264Builder {
    pub fn new() -> Self {
        Self { pictures: 0 }
    }

    pub fn pictures(mut self, n: usize) -> Self {
        self.pictures = n;
        self
    }

    /// SPS + PPS + IDR for the first picture, one P slice for each after.
    /// Every slice starts a picture (first_mb_in_slice = 0).
    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut nal = |body: &[u8]| {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(body);
        };
        for i in 0..self.pictures {
            if i == 0 {
                nal(&[0x67, 0x42, 0xC0, 0x1E, 0xDA]);
                nal(&[0x68, 0xCE, 0x3C, 0x80]);
                nal(&[0x65, 0x88, 0x84, 0x21, 0xA0]);
            } else {
                nal(&[0x41, 0x9A, 0x21, 0x6C, (i % 200) as u8 + 1]);
            }
        }
        out
    }
}

/// One AAC-LC ADTS frame without CRC, payload filled with 0x11.
pub fn adts_frame(sample_rate_index: u8, channels: u8, payload_len: usize) -> Vec<u8> {
    let len = 7 + payload_len;
    let mut frame = vec![
        0xFF,
        0xF1,
        (1 << 6) | (sample_rate_index << 2) | ((channels >> 2) & 0x01),
        ((channels & 0x03) << 6) | ((len >> 11) & 0x03) as u8,
        ((len >> 3) & 0xFF) as u8,
        (((len & 0x07) << 5) as u8) | 0x1F,
        0xFC,
    ];
    frame.resize(len, 0x11);
    frame
}

// ============================================================================
// JPEG
// ============================================================================

pub fn encode_jpeg(width: u32, height: u32, pixel: impl Fn(u32, u32) -> [u8; 3]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            rgb.extend_from_slice(&pixel(x, y));
        }
    }
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90)
        .encode(&rgb, width, height, image::ExtendedColorType::Rgb8)
        .unwrap();
    out
}

// ============================================================================
// Audio Sink
// ============================================================================

/// Keeps every sample written. Optionally refuses the first few writes,
/// or only accepts what a manual clock says the device could have played.
pub struct RecordingSink {
    samples: Arc<Mutex<Vec<i16>>>,
    timeouts_left: usize,
    pace: Option<Arc<ManualClock>>,
    sample_rate: u32,
    channels: u16,
    frames_written: u64,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            samples: Arc::new(Mutex::new(Vec::new())),
            timeouts_left: 0,
            pace: None,
            sample_rate: 0,
            channels: 1,
            frames_written: 0,
        }
    }

    pub fn with_timeouts(mut self, n: usize) -> Self {
        self.timeouts_left = n;
        self
    }

    pub fn paced(mut self, clock: Arc<ManualClock>) -> Self {
        self.pace = Some(clock);
        self
    }

    pub fn samples(&self) -> Arc<Mutex<Vec<i16>>> {
        self.samples.clone()
    }
}

impl AudioSink for RecordingSink {
    fn configure(&mut self, sample_rate: u32, channels: u16) -> Result<(), SinkError> {
        self.sample_rate = sample_rate;
        self.channels = channels.max(1);
        Ok(())
    }

    fn write(&mut self, pcm: &[i16], _timeout: Duration) -> Result<usize, SinkError> {
        if self.timeouts_left > 0 {
            self.timeouts_left -= 1;
            thread::sleep(Duration::from_millis(1));
            return Err(SinkError::Timeout);
        }

        let mut accept = pcm.len();
        if let Some(clock) = &self.pace {
            let playable = clock.now_us() * self.sample_rate as u64 / 1_000_000;
            let frames = playable.saturating_sub(self.frames_written) as usize;
            accept = accept.min(frames * self.channels as usize);
            if accept == 0 {
                thread::sleep(Duration::from_millis(1));
                return Err(SinkError::Timeout);
            }
        }

        self.samples.lock().extend_from_slice(&pcm[..accept]);
        self.frames_written += (accept / self.channels as usize) as u64;
        Ok(accept)
    }

    fn silence(&mut self) {}
}

// ============================================================================
// Accelerators
// ============================================================================

/// Refuses to initialise, or initialises and then fails every unit.
pub struct FailingAccelerator {
    fail_init: bool,
    attempts: Arc<AtomicUsize>,
}

impl FailingAccelerator {
    pub fn failing_init() -> Self {
        Self {
            fail_init: true,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_decode() -> Self {
        Self {
            fail_init: false,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn attempts(&self) -> Arc<AtomicUsize> {
        self.attempts.clone()
    }
}

impl Accelerator for FailingAccelerator {
    fn name(&self) -> &str {
        "failing"
    }

    fn init(&mut self, _codec: VideoCodec, _width: u32, _height: u32) -> Result<(), DecodeError> {
        if self.fail_init {
            Err(DecodeError::HardwareInit("engine busy".into()))
        } else {
            Ok(())
        }
    }

    fn decode(&mut self, _unit: &[u8], _out: &mut Vec<u8>) -> Result<FrameGeometry, DecodeError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(DecodeError::DecodeFailed("engine fault".into()))
    }
}

/// Treats each unit as an already-decoded I420 frame.
pub struct MirrorAccelerator {
    width: u32,
    height: u32,
}

impl MirrorAccelerator {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Accelerator for MirrorAccelerator {
    fn name(&self) -> &str {
        "mirror"
    }

    fn init(&mut self, _codec: VideoCodec, _width: u32, _height: u32) -> Result<(), DecodeError> {
        Ok(())
    }

    fn decode(&mut self, unit: &[u8], out: &mut Vec<u8>) -> Result<FrameGeometry, DecodeError> {
        ensure_len(out, unit.len())?;
        out[..unit.len()].copy_from_slice(unit);
        Ok(FrameGeometry {
            width: self.width,
            height: self.height,
            stride: self.width,
            format: FrameFormat::I420,
        })
    }
}
