//! # Video Decode Module
//!
//! Software decoders for the codecs the player accepts:
//! 1. MJPEG - `image` JPEG decoder, RGB24 out
//! 2. Raw I420 - copied through
//! 3. H.264 - openh264 (`software-decode` feature), I420 out
//!
//! Every decoder owns one scratch buffer and lends it out as the
//! decoded frame, so there is at most one live frame per decoder.

use std::collections::TryReserveError;
use std::io::Cursor;

use image::codecs::jpeg::JpegDecoder;
use image::{ColorType, ImageDecoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::media::VideoCodec;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unsupported codec: {0}")]
    Unsupported(String),
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    #[error("Hardware decoder init failed: {0}")]
    HardwareInit(String),
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
}

impl From<TryReserveError> for DecodeError {
    fn from(e: TryReserveError) -> Self {
        Self::OutOfMemory(e.to_string())
    }
}

/// Pixel layout of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameFormat {
    /// 4:2:0 planar: Y plane (stride x height), then U and V at half size
    I420,
    /// Packed 8-bit R, G, B
    Rgb24,
    /// Packed 8-bit B, G, R
    Bgr24,
}

impl FrameFormat {
    /// Bytes needed for a tightly packed frame
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        match self {
            Self::I420 => w * h + 2 * chroma_size(width, height),
            Self::Rgb24 | Self::Bgr24 => w * h * 3,
        }
    }
}

/// Size of one chroma plane of a tightly packed I420 frame
pub fn chroma_size(width: u32, height: u32) -> usize {
    ((width as usize + 1) / 2) * ((height as usize + 1) / 2)
}

/// A decoded frame borrowed from its decoder
#[derive(Debug, Clone, Copy)]
pub struct DecodedFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Bytes per row (of the Y plane for I420)
    pub stride: u32,
    pub format: FrameFormat,
}

#[derive(Debug)]
pub enum DecodeOutcome<'a> {
    Frame(DecodedFrame<'a>),
    /// The unit was consumed but completed no picture (e.g. parameter sets only)
    NeedMoreData,
}

/// Geometry of a frame written into a scratch buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: FrameFormat,
}

impl FrameGeometry {
    pub fn len(&self) -> usize {
        match self.format {
            FrameFormat::I420 => {
                self.stride as usize * self.height as usize + 2 * chroma_size(self.width, self.height)
            }
            FrameFormat::Rgb24 | FrameFormat::Bgr24 => {
                self.stride as usize * self.height as usize
            }
        }
    }

    pub fn frame<'a>(&self, buffer: &'a [u8]) -> DecodedFrame<'a> {
        DecodedFrame {
            data: &buffer[..self.len()],
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format,
        }
    }
}

/// Grow `buffer` to at least `len` bytes, reporting allocation failure.
pub fn ensure_len(buffer: &mut Vec<u8>, len: usize) -> Result<(), DecodeError> {
    if buffer.len() < len {
        buffer.try_reserve_exact(len - buffer.len())?;
        buffer.resize(len, 0);
    }
    Ok(())
}

// ============================================================================
// Software Decoder
// ============================================================================

pub struct SoftwareDecoder {
    codec: VideoCodec,
    width: u32,
    height: u32,
    scratch: Vec<u8>,
    #[cfg(feature = "software-decode")]
    h264: Option<openh264::decoder::Decoder>,
    frames_decoded: u64,
}

impl SoftwareDecoder {
    pub fn new(codec: VideoCodec, width: u32, height: u32) -> Result<Self, DecodeError> {
        #[cfg(feature = "software-decode")]
        let mut h264 = None;

        match codec {
            VideoCodec::Mjpeg => {}
            VideoCodec::RawI420 => {
                if width == 0 || height == 0 {
                    return Err(DecodeError::Unsupported(format!(
                        "Raw I420 needs frame dimensions, got {}x{}",
                        width, height
                    )));
                }
            }
            VideoCodec::H264 => {
                #[cfg(feature = "software-decode")]
                {
                    let decoder = openh264::decoder::Decoder::new().map_err(|e| {
                        DecodeError::Unsupported(format!("OpenH264 unavailable: {:?}", e))
                    })?;
                    h264 = Some(decoder);
                }
                #[cfg(not(feature = "software-decode"))]
                {
                    return Err(DecodeError::Unsupported(
                        "H.264 requires the software-decode feature".into(),
                    ));
                }
            }
            VideoCodec::Unknown => {
                return Err(DecodeError::Unsupported("Unknown video codec".into()));
            }
        }

        // Sized for the declared frame so steady-state decode never grows it
        let mut scratch = Vec::new();
        let expected = FrameFormat::Rgb24.buffer_size(width, height);
        ensure_len(&mut scratch, expected)?;

        Ok(Self {
            codec,
            width,
            height,
            scratch,
            #[cfg(feature = "software-decode")]
            h264,
            frames_decoded: 0,
        })
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn name(&self) -> &'static str {
        match self.codec {
            VideoCodec::Mjpeg => "MJPEG (image)",
            VideoCodec::RawI420 => "Raw I420",
            VideoCodec::H264 => "OpenH264",
            VideoCodec::Unknown => "Software",
        }
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<DecodeOutcome<'_>, DecodeError> {
        let geometry = match self.codec {
            VideoCodec::Mjpeg => Some(self.decode_mjpeg(data)?),
            VideoCodec::RawI420 => Some(self.copy_i420(data)?),
            VideoCodec::H264 => self.decode_h264(data)?,
            VideoCodec::Unknown => {
                return Err(DecodeError::Unsupported("Unknown video codec".into()));
            }
        };

        match geometry {
            Some(geometry) => {
                self.frames_decoded += 1;
                Ok(DecodeOutcome::Frame(geometry.frame(&self.scratch)))
            }
            None => Ok(DecodeOutcome::NeedMoreData),
        }
    }

    fn decode_mjpeg(&mut self, data: &[u8]) -> Result<FrameGeometry, DecodeError> {
        let decoder = JpegDecoder::new(Cursor::new(data))
            .map_err(|e| DecodeError::DecodeFailed(format!("JPEG header: {}", e)))?;
        let (width, height) = decoder.dimensions();
        let color = decoder.color_type();
        let total = decoder.total_bytes() as usize;
        let rgb_len = FrameFormat::Rgb24.buffer_size(width, height);
        ensure_len(&mut self.scratch, rgb_len.max(total))?;

        decoder
            .read_image(&mut self.scratch[..total])
            .map_err(|e| DecodeError::DecodeFailed(format!("JPEG data: {}", e)))?;

        match color {
            ColorType::Rgb8 => {}
            ColorType::L8 => expand_gray_in_place(&mut self.scratch[..rgb_len], total),
            other => {
                return Err(DecodeError::Unsupported(format!("JPEG color type {:?}", other)));
            }
        }

        Ok(FrameGeometry {
            width,
            height,
            stride: width * 3,
            format: FrameFormat::Rgb24,
        })
    }

    fn copy_i420(&mut self, data: &[u8]) -> Result<FrameGeometry, DecodeError> {
        let needed = FrameFormat::I420.buffer_size(self.width, self.height);
        if data.len() < needed {
            return Err(DecodeError::DecodeFailed(format!(
                "Raw I420 frame is {} bytes, expected {}",
                data.len(),
                needed
            )));
        }
        ensure_len(&mut self.scratch, needed)?;
        self.scratch[..needed].copy_from_slice(&data[..needed]);

        Ok(FrameGeometry {
            width: self.width,
            height: self.height,
            stride: self.width,
            format: FrameFormat::I420,
        })
    }

    #[cfg(feature = "software-decode")]
    fn decode_h264(&mut self, data: &[u8]) -> Result<Option<FrameGeometry>, DecodeError> {
        use openh264::formats::YUVSource;

        let decoder = self
            .h264
            .as_mut()
            .ok_or_else(|| DecodeError::Unsupported("H.264 decoder not initialized".into()))?;

        let yuv = match decoder.decode(data) {
            Ok(Some(yuv)) => yuv,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DecodeError::DecodeFailed(format!("OpenH264: {:?}", e))),
        };

        let (width, height) = yuv.dimensions();
        let (y_stride, u_stride, v_stride) = yuv.strides();
        let chroma_w = (width + 1) / 2;
        let chroma_h = (height + 1) / 2;
        let total = width * height + 2 * chroma_w * chroma_h;
        ensure_len(&mut self.scratch, total)?;

        // Repack without stride padding: Y, then U, then V
        let mut offset = 0;
        for (plane, stride, w, h) in [
            (yuv.y(), y_stride, width, height),
            (yuv.u(), u_stride, chroma_w, chroma_h),
            (yuv.v(), v_stride, chroma_w, chroma_h),
        ] {
            for row in 0..h {
                let start = row * stride;
                let src = plane.get(start..start + w).ok_or_else(|| {
                    DecodeError::DecodeFailed("OpenH264 plane shorter than its stride".into())
                })?;
                self.scratch[offset..offset + w].copy_from_slice(src);
                offset += w;
            }
        }

        Ok(Some(FrameGeometry {
            width: width as u32,
            height: height as u32,
            stride: width as u32,
            format: FrameFormat::I420,
        }))
    }

    #[cfg(not(feature = "software-decode"))]
    fn decode_h264(&mut self, _data: &[u8]) -> Result<Option<FrameGeometry>, DecodeError> {
        Err(DecodeError::Unsupported(
            "H.264 requires the software-decode feature".into(),
        ))
    }
}

/// Spread `gray_len` luma bytes at the front of `buf` into RGB triples.
/// Walks backwards so no source byte is overwritten before it is read.
fn expand_gray_in_place(buf: &mut [u8], gray_len: usize) {
    for i in (0..gray_len).rev() {
        let v = buf[i];
        buf[i * 3] = v;
        buf[i * 3 + 1] = v;
        buf[i * 3 + 2] = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{encode_jpeg, i420_frame};

    #[test]
    fn test_mjpeg_matches_reference_decode() {
        let jpeg = encode_jpeg(16, 8, |x, y| [(x * 16) as u8, (y * 32) as u8, 200]);
        let reference = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
            .unwrap()
            .to_rgb8()
            .into_raw();

        let mut decoder = SoftwareDecoder::new(VideoCodec::Mjpeg, 16, 8).unwrap();
        match decoder.decode(&jpeg).unwrap() {
            DecodeOutcome::Frame(frame) => {
                assert_eq!(frame.format, FrameFormat::Rgb24);
                assert_eq!((frame.width, frame.height, frame.stride), (16, 8, 48));
                assert_eq!(frame.data, &reference[..]);
            }
            DecodeOutcome::NeedMoreData => panic!("expected a frame"),
        }
        assert_eq!(decoder.frames_decoded(), 1);
    }

    #[test]
    fn test_mjpeg_garbage_is_an_error() {
        let mut decoder = SoftwareDecoder::new(VideoCodec::Mjpeg, 16, 8).unwrap();
        assert!(matches!(
            decoder.decode(&[0xFF, 0xD8, 0x00, 0x01, 0x02]),
            Err(DecodeError::DecodeFailed(_))
        ));
        // Still usable afterwards
        let jpeg = encode_jpeg(8, 8, |_, _| [10, 20, 30]);
        assert!(matches!(decoder.decode(&jpeg), Ok(DecodeOutcome::Frame(_))));
    }

    #[test]
    fn test_raw_i420_copy() {
        let frame = i420_frame(4, 2, 7);
        let mut decoder = SoftwareDecoder::new(VideoCodec::RawI420, 4, 2).unwrap();
        match decoder.decode(&frame).unwrap() {
            DecodeOutcome::Frame(out) => {
                assert_eq!(out.format, FrameFormat::I420);
                assert_eq!(out.data, &frame[..]);
            }
            DecodeOutcome::NeedMoreData => panic!("expected a frame"),
        }

        assert!(matches!(decoder.decode(&frame[..5]), Err(DecodeError::DecodeFailed(_))));
    }

    #[test]
    fn test_unknown_codec_rejected() {
        assert!(matches!(
            SoftwareDecoder::new(VideoCodec::Unknown, 8, 8),
            Err(DecodeError::Unsupported(_))
        ));
        assert!(matches!(
            SoftwareDecoder::new(VideoCodec::RawI420, 0, 8),
            Err(DecodeError::Unsupported(_))
        ));
    }

    #[test]
    fn test_expand_gray() {
        let mut buf = vec![1, 2, 3, 0, 0, 0, 0, 0, 0];
        expand_gray_in_place(&mut buf, 3);
        assert_eq!(buf, vec![1, 1, 1, 2, 2, 2, 3, 3, 3]);
    }

    #[cfg(feature = "software-decode")]
    #[test]
    fn test_h264_garbage_does_not_panic() {
        let mut decoder = SoftwareDecoder::new(VideoCodec::H264, 300, 240).unwrap();
        let garbage = [0, 0, 0, 1, 0x65, 0xFF, 0x00, 0x13];
        match decoder.decode(&garbage) {
            Ok(DecodeOutcome::NeedMoreData) | Err(DecodeError::DecodeFailed(_)) => {}
            Ok(DecodeOutcome::Frame(_)) => panic!("garbage produced a picture"),
            Err(e) => panic!("unexpected error {e}"),
        }
    }
}
