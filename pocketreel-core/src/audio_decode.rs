// AUDIO DECODE - compressed audio units to interleaved i16 PCM
//
// PCM from AVI is unpacked directly. MP3 and AAC go through symphonia
// one packet at a time (`audio` feature); AAC arrives with its ADTS
// header, which is stripped before the packet is handed over.

use crate::decode::DecodeError;
use crate::media::{AudioCodec, StreamInfo};

/// Per-unit audio decoder. The returned slice is interleaved and valid
/// until the next call.
pub trait AudioDecoder: Send {
    fn decode(&mut self, unit: &[u8]) -> Result<&[i16], DecodeError>;
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    fn name(&self) -> &'static str;
}

/// Pick a decoder for the stream's audio track
pub fn create_audio_decoder(info: &StreamInfo) -> Result<Box<dyn AudioDecoder>, DecodeError> {
    match info.audio_codec {
        AudioCodec::Pcm => Ok(Box::new(PcmDecoder::new(
            info.audio_bits_per_sample,
            info.audio_channels,
            info.audio_sample_rate,
        )?)),
        #[cfg(feature = "audio")]
        AudioCodec::Mp3 | AudioCodec::Aac => Ok(Box::new(SymphoniaDecoder::new(
            info.audio_codec,
            info.audio_sample_rate,
            info.audio_channels,
        )?)),
        #[cfg(not(feature = "audio"))]
        AudioCodec::Mp3 | AudioCodec::Aac => Err(DecodeError::Unsupported(format!(
            "{:?} audio requires the audio feature",
            info.audio_codec
        ))),
        AudioCodec::Unknown => Err(DecodeError::Unsupported("Unknown audio codec".into())),
    }
}

/// Scale samples by `volume` percent into `out`, reusing its capacity.
pub fn apply_volume(samples: &[i16], volume: u8, out: &mut Vec<i16>) {
    out.clear();
    if volume >= 100 {
        out.extend_from_slice(samples);
        return;
    }
    let volume = volume as i32;
    out.extend(samples.iter().map(|&s| (s as i32 * volume / 100) as i16));
}

// ============================================================================
// PCM
// ============================================================================

pub struct PcmDecoder {
    bits: u16,
    channels: u16,
    sample_rate: u32,
    samples: Vec<i16>,
}

impl PcmDecoder {
    pub fn new(bits: u16, channels: u16, sample_rate: u32) -> Result<Self, DecodeError> {
        if bits != 8 && bits != 16 {
            return Err(DecodeError::Unsupported(format!("{}-bit PCM", bits)));
        }
        if channels == 0 || sample_rate == 0 {
            return Err(DecodeError::Unsupported(format!(
                "PCM with {} channels at {}Hz",
                channels, sample_rate
            )));
        }
        Ok(Self {
            bits,
            channels,
            sample_rate,
            samples: Vec::new(),
        })
    }
}

impl AudioDecoder for PcmDecoder {
    fn decode(&mut self, unit: &[u8]) -> Result<&[i16], DecodeError> {
        self.samples.clear();
        match self.bits {
            8 => self
                .samples
                .extend(unit.iter().map(|&b| (b as i16 - 128) << 8)),
            // A trailing odd byte is not a sample
            _ => self.samples.extend(
                unit.chunks_exact(2)
                    .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
            ),
        }
        Ok(&self.samples)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn name(&self) -> &'static str {
        "PCM"
    }
}

// ============================================================================
// Symphonia (MP3 / AAC)
// ============================================================================

#[cfg(feature = "audio")]
pub use self::symphonia_decoder::SymphoniaDecoder;

#[cfg(feature = "audio")]
mod symphonia_decoder {
    use symphonia::core::audio::{Channels, SampleBuffer};
    use symphonia::core::codecs::{
        CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_AAC, CODEC_TYPE_MP3,
    };
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::Packet;

    use super::AudioDecoder;
    use crate::adts::AdtsHeader;
    use crate::decode::DecodeError;
    use crate::media::AudioCodec;

    pub struct SymphoniaDecoder {
        decoder: Box<dyn Decoder>,
        sample_buf: Option<SampleBuffer<i16>>,
        strip_adts: bool,
        sample_rate: u32,
        channels: u16,
        ts: u64,
        name: &'static str,
    }

    impl SymphoniaDecoder {
        pub fn new(codec: AudioCodec, sample_rate: u32, channels: u16) -> Result<Self, DecodeError> {
            let (codec_type, name) = match codec {
                AudioCodec::Mp3 => (CODEC_TYPE_MP3, "MP3 (symphonia)"),
                AudioCodec::Aac => (CODEC_TYPE_AAC, "AAC (symphonia)"),
                other => {
                    return Err(DecodeError::Unsupported(format!("{:?} via symphonia", other)));
                }
            };

            let mut params = CodecParameters::new();
            params.for_codec(codec_type);
            if sample_rate > 0 {
                params.with_sample_rate(sample_rate);
            }
            if let Some(layout) = channel_layout(channels) {
                params.with_channels(layout);
            }

            let decoder = symphonia::default::get_codecs()
                .make(&params, &DecoderOptions::default())
                .map_err(|e| DecodeError::Unsupported(format!("{}: {}", name, e)))?;

            Ok(Self {
                decoder,
                sample_buf: None,
                strip_adts: codec == AudioCodec::Aac,
                sample_rate,
                channels: channels.max(1),
                ts: 0,
                name,
            })
        }
    }

    /// Speaker layout for an AAC channel count (ISO 14496-3 channel
    /// configurations 1 to 7)
    pub(super) fn channel_layout(count: u16) -> Option<Channels> {
        let front = Channels::FRONT_LEFT | Channels::FRONT_RIGHT;
        let surround = front | Channels::FRONT_CENTRE | Channels::REAR_LEFT | Channels::REAR_RIGHT;
        let layout = match count {
            1 => Channels::FRONT_CENTRE,
            2 => front,
            3 => front | Channels::FRONT_CENTRE,
            4 => front | Channels::FRONT_CENTRE | Channels::REAR_CENTRE,
            5 => surround,
            6 => surround | Channels::LFE1,
            8 => surround | Channels::LFE1 | Channels::SIDE_LEFT | Channels::SIDE_RIGHT,
            _ => return None,
        };
        Some(layout)
    }

    impl AudioDecoder for SymphoniaDecoder {
        fn decode(&mut self, unit: &[u8]) -> Result<&[i16], DecodeError> {
            let payload = match (self.strip_adts, AdtsHeader::parse(unit)) {
                (true, Some(header)) => {
                    let end = header.frame_length.min(unit.len());
                    &unit[header.header_len().min(end)..end]
                }
                _ => unit,
            };

            let packet = Packet::new_from_slice(0, self.ts, 0, payload);
            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // Corrupt packet: the decoder stays usable
                Err(SymphoniaError::DecodeError(e)) => {
                    return Err(DecodeError::DecodeFailed(e.to_string()));
                }
                Err(e) => return Err(DecodeError::DecodeFailed(format!("{}: {}", self.name, e))),
            };

            let spec = *decoded.spec();
            let frames = decoded.frames() as u64;
            let needed = decoded.capacity() * spec.channels.count();
            if self
                .sample_buf
                .as_ref()
                .map_or(true, |buf| buf.capacity() < needed)
            {
                self.sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
            }
            self.sample_rate = spec.rate;
            self.channels = spec.channels.count() as u16;
            self.ts += frames;

            match self.sample_buf.as_mut() {
                Some(buf) => {
                    buf.copy_interleaved_ref(decoded);
                    Ok(buf.samples())
                }
                None => Ok(&[]),
            }
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn channels(&self) -> u16 {
            self.channels
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm16_little_endian() {
        let mut decoder = PcmDecoder::new(16, 2, 44100).unwrap();
        let samples = decoder.decode(&[0x01, 0x00, 0xFF, 0xFF, 0x00, 0x80, 0x7F]).unwrap();
        assert_eq!(samples, &[1, -1, i16::MIN]);
        assert_eq!((decoder.sample_rate(), decoder.channels()), (44100, 2));
    }

    #[test]
    fn test_pcm8_is_unsigned() {
        let mut decoder = PcmDecoder::new(8, 1, 8000).unwrap();
        let samples = decoder.decode(&[0, 128, 255]).unwrap();
        assert_eq!(samples, &[i16::MIN, 0, 127 << 8]);
    }

    #[test]
    fn test_pcm_rejects_odd_formats() {
        assert!(PcmDecoder::new(24, 2, 44100).is_err());
        assert!(PcmDecoder::new(16, 0, 44100).is_err());
        assert!(PcmDecoder::new(16, 2, 0).is_err());
    }

    #[test]
    fn test_volume_scaling() {
        let mut out = Vec::new();
        apply_volume(&[1000, -1000, i16::MAX], 50, &mut out);
        assert_eq!(out, vec![500, -500, 16383]);

        apply_volume(&[1000], 100, &mut out);
        assert_eq!(out, vec![1000]);

        apply_volume(&[1000], 0, &mut out);
        assert_eq!(out, vec![0]);
    }

    #[cfg(feature = "audio")]
    #[test]
    fn test_channel_layout_matches_count() {
        use super::symphonia_decoder::channel_layout;

        for count in [1u16, 2, 3, 4, 5, 6, 8] {
            let layout = channel_layout(count).unwrap();
            assert_eq!(layout.count(), count as usize);
        }
        assert!(channel_layout(0).is_none());
        assert!(channel_layout(7).is_none());
    }

    #[test]
    fn test_create_for_stream() {
        let info = StreamInfo {
            has_audio: true,
            audio_codec: AudioCodec::Pcm,
            audio_sample_rate: 22050,
            audio_channels: 1,
            audio_bits_per_sample: 16,
            ..StreamInfo::default()
        };
        let decoder = create_audio_decoder(&info).unwrap();
        assert_eq!(decoder.name(), "PCM");

        let unknown = StreamInfo {
            audio_codec: AudioCodec::Unknown,
            ..info
        };
        assert!(matches!(
            create_audio_decoder(&unknown),
            Err(DecodeError::Unsupported(_))
        ));
    }
}
