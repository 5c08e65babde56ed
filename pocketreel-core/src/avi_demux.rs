// AVI DEMUXER - Incremental RIFF/AVI chunk walker
//
// Reads the header list once at open, then walks the `movi` list one
// chunk at a time into a single reusable buffer. Nothing is indexed and
// nothing seeks backwards, so a clip streams from storage in constant
// memory.
//
// RIFF 'AVI '
// ├── LIST 'hdrl'
// │   ├── avih (main header)
// │   └── LIST 'strl' (per stream)
// │       ├── strh (stream header)
// │       └── strf (stream format)
// ├── LIST 'movi'
// │   ├── 00dc / 00db (video)
// │   ├── 01wb (audio)
// │   └── LIST 'rec ' (grouped chunks, descended into)
// └── idx1 (ignored)

use std::io::{self, Cursor, Read, Seek, SeekFrom};

use serde::{Deserialize, Serialize};

use crate::demuxer::{DemuxError, DemuxStats, Demuxer};
use crate::media::{AudioCodec, MediaUnit, StreamInfo, UnitKind, VideoCodec, DEFAULT_FPS};

// ============================================================================
// RIFF/AVI Constants
// ============================================================================

const RIFF: u32 = 0x46464952; // "RIFF" little-endian
const AVI_: u32 = 0x20495641; // "AVI "
const LIST: u32 = 0x5453494C; // "LIST"
const HDRL: u32 = 0x6C726468; // "hdrl" - header list
const AVIH: u32 = 0x68697661; // "avih" - main AVI header
const STRL: u32 = 0x6C727473; // "strl" - stream list
const STRH: u32 = 0x68727473; // "strh" - stream header
const STRF: u32 = 0x66727473; // "strf" - stream format
const MOVI: u32 = 0x69766F6D; // "movi" - movie data

// Stream types
const VIDS: u32 = 0x73646976; // "vids"
const AUDS: u32 = 0x73647561; // "auds"

// Video codecs (FourCC)
const MJPG: u32 = 0x47504A4D;
const I420: u32 = 0x30323449;
const IYUV: u32 = 0x56555949;
const H264: u32 = 0x34363248;
const AVC1: u32 = 0x31435641;
const X264: u32 = 0x34363258;

// WAVEFORMATEX format tags
const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_MPEGLAYER3: u16 = 0x0055;
const WAVE_FORMAT_AAC: u16 = 0x00FF;
const WAVE_FORMAT_MPEG_ADTS_AAC: u16 = 0x1600;

/// Header list larger than this is treated as corrupt
const MAX_HEADER_LIST_SIZE: u64 = 16 * 1024;

// ============================================================================
// Structures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    Video,
    Audio,
    Unknown,
}

/// Per-stream description from a `strl` list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AviStream {
    pub index: u32,
    pub stream_type: StreamType,
    pub codec_fourcc: String,
    pub rate: u32,
    pub scale: u32,
    pub length: u32,
    // Video-specific
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub compression: Option<u32>,
    // Audio-specific
    pub format_tag: Option<u16>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub bits_per_sample: Option<u16>,
}

#[derive(Debug, Clone, Default)]
struct MainHeader {
    microsec_per_frame: u32,
    total_frames: u32,
    width: u32,
    height: u32,
}

#[derive(Debug, Clone, Default)]
struct StreamHeader {
    fcc_type: u32,
    fcc_handler: u32,
    scale: u32,
    rate: u32,
    length: u32,
}

// ============================================================================
// AVI Demuxer
// ============================================================================

pub struct AviDemuxer<R: Read + Seek> {
    reader: R,
    info: StreamInfo,
    streams: Vec<AviStream>,
    video_stream: Option<u32>,
    audio_stream: Option<u32>,
    movi_end: u64,
    position: u64,
    buffer: Vec<u8>,
    max_chunk_size: usize,
    sequence: u64,
    stats: DemuxStats,
    finished: bool,
}

impl<R: Read + Seek> AviDemuxer<R> {
    pub fn new(mut reader: R, max_chunk_size: usize) -> Result<Self, DemuxError> {
        let mut signature = [0u8; 12];
        reader.read_exact(&mut signature).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => DemuxError::InvalidFormat("File too short".into()),
            _ => DemuxError::Io(e),
        })?;
        if le_u32(&signature[0..4]) != RIFF {
            return Err(DemuxError::InvalidFormat("Not a RIFF file".into()));
        }
        if le_u32(&signature[8..12]) != AVI_ {
            return Err(DemuxError::InvalidFormat("Not an AVI file".into()));
        }

        let mut demuxer = Self {
            reader,
            info: StreamInfo::default(),
            streams: Vec::new(),
            video_stream: None,
            audio_stream: None,
            movi_end: 0,
            position: 12,
            buffer: vec![0u8; max_chunk_size],
            max_chunk_size,
            sequence: 0,
            stats: DemuxStats::default(),
            finished: false,
        };

        demuxer.locate_lists()?;

        tracing::info!(
            "AVI opened: {}x{} @ {:.2}fps, {} frames, video={:?} ({}), audio={:?} {}Hz/{}ch",
            demuxer.info.width,
            demuxer.info.height,
            demuxer.info.fps,
            demuxer.info.total_frames,
            demuxer.info.video_codec,
            demuxer.info.video_fourcc,
            demuxer.info.audio_codec,
            demuxer.info.audio_sample_rate,
            demuxer.info.audio_channels,
        );

        Ok(demuxer)
    }

    /// Walk the top level until `movi`, parsing `hdrl` on the way.
    fn locate_lists(&mut self) -> Result<(), DemuxError> {
        let file_size = self.reader.seek(SeekFrom::End(0))?;
        let mut pos = 12u64;
        let mut main_header: Option<MainHeader> = None;

        while pos + 8 <= file_size {
            self.reader.seek(SeekFrom::Start(pos))?;
            let fourcc = read_u32_le(&mut self.reader)?;
            let size = read_u32_le(&mut self.reader)? as u64;
            pos += 8;

            if fourcc == LIST {
                if size < 4 {
                    return Err(DemuxError::InvalidFormat("LIST chunk too small".into()));
                }
                let list_type = read_u32_le(&mut self.reader)?;
                match list_type {
                    HDRL => {
                        let body_size = size - 4;
                        if body_size > MAX_HEADER_LIST_SIZE {
                            return Err(DemuxError::InvalidFormat(format!(
                                "Header list too large: {} bytes",
                                body_size
                            )));
                        }
                        let mut body = vec![0u8; body_size as usize];
                        self.reader.read_exact(&mut body).map_err(|_| {
                            DemuxError::InvalidFormat("Truncated header list".into())
                        })?;
                        main_header = Some(self.parse_hdrl(&body).map_err(|e| {
                            DemuxError::InvalidFormat(format!("Malformed header list: {}", e))
                        })?);
                    }
                    MOVI => {
                        let header = main_header.take().ok_or_else(|| {
                            DemuxError::InvalidFormat("movi list before hdrl".into())
                        })?;
                        self.build_info(&header);

                        let movi_start = pos + 4;
                        self.movi_end = if size <= 4 {
                            file_size
                        } else {
                            (pos + size).min(file_size)
                        };
                        self.position = movi_start;
                        self.reader.seek(SeekFrom::Start(movi_start))?;
                        return Ok(());
                    }
                    _ => {}
                }
            }

            pos += size + (size & 1);
        }

        if main_header.is_none() && self.streams.is_empty() {
            return Err(DemuxError::InvalidFormat("Missing hdrl list".into()));
        }
        Err(DemuxError::InvalidFormat("Missing movi list".into()))
    }

    fn parse_hdrl(&mut self, data: &[u8]) -> io::Result<MainHeader> {
        let mut header = MainHeader::default();
        let mut cursor = Cursor::new(data);
        let end = data.len() as u64;

        while cursor.position() + 8 <= end {
            let fourcc = read_u32_le(&mut cursor)?;
            let size = read_u32_le(&mut cursor)? as u64;
            let body_start = cursor.position();
            let body_end = (body_start + size).min(end);
            let body = &data[body_start as usize..body_end as usize];

            match fourcc {
                AVIH => header = parse_avih(body)?,
                LIST if body.len() >= 4 && le_u32(&body[0..4]) == STRL => {
                    self.parse_strl(&body[4..])?;
                }
                _ => {}
            }

            cursor.set_position(body_end + (size & 1));
        }

        Ok(header)
    }

    fn parse_strl(&mut self, data: &[u8]) -> io::Result<()> {
        let mut cursor = Cursor::new(data);
        let end = data.len() as u64;
        let mut stream = AviStream {
            index: self.streams.len() as u32,
            stream_type: StreamType::Unknown,
            codec_fourcc: String::new(),
            rate: 0,
            scale: 0,
            length: 0,
            width: None,
            height: None,
            compression: None,
            format_tag: None,
            sample_rate: None,
            channels: None,
            bits_per_sample: None,
        };

        while cursor.position() + 8 <= end {
            let fourcc = read_u32_le(&mut cursor)?;
            let size = read_u32_le(&mut cursor)? as u64;
            let body_start = cursor.position();
            let body_end = (body_start + size).min(end);
            let body = &data[body_start as usize..body_end as usize];

            match fourcc {
                STRH => {
                    let strh = read_strh(body)?;
                    stream.stream_type = match strh.fcc_type {
                        VIDS => StreamType::Video,
                        AUDS => StreamType::Audio,
                        _ => StreamType::Unknown,
                    };
                    stream.codec_fourcc = fourcc_to_string(strh.fcc_handler);
                    stream.rate = strh.rate;
                    stream.scale = strh.scale;
                    stream.length = strh.length;
                }
                STRF => match stream.stream_type {
                    StreamType::Video => parse_video_format(&mut stream, body)?,
                    StreamType::Audio => parse_audio_format(&mut stream, body)?,
                    StreamType::Unknown => {}
                },
                _ => {}
            }

            cursor.set_position(body_end + (size & 1));
        }

        self.streams.push(stream);
        Ok(())
    }

    fn build_info(&mut self, header: &MainHeader) {
        let mut info = StreamInfo {
            width: header.width,
            height: header.height,
            total_frames: header.total_frames,
            fps: if header.microsec_per_frame > 0 {
                1_000_000.0 / header.microsec_per_frame as f64
            } else {
                0.0
            },
            ..StreamInfo::default()
        };

        if let Some(video) = self.streams.iter().find(|s| s.stream_type == StreamType::Video) {
            self.video_stream = Some(video.index);
            info.has_video = true;

            let fourcc = video.compression.filter(|&c| c != 0).unwrap_or_else(|| {
                u32::from_le_bytes(pad_fourcc(video.codec_fourcc.as_bytes()))
            });
            info.video_codec = identify_video_codec(fourcc);
            info.video_fourcc = fourcc_to_string(fourcc);

            // strh rate/scale is exact where avih is rounded to whole microseconds
            if video.scale > 0 && video.rate > 0 {
                info.fps = video.rate as f64 / video.scale as f64;
            }
            if info.width == 0 || info.height == 0 {
                info.width = video.width.unwrap_or(0);
                info.height = video.height.unwrap_or(0);
            }
            if info.total_frames == 0 {
                info.total_frames = video.length;
            }
        }

        if let Some(audio) = self.streams.iter().find(|s| s.stream_type == StreamType::Audio) {
            self.audio_stream = Some(audio.index);
            info.has_audio = true;
            info.audio_codec = identify_audio_codec(audio.format_tag.unwrap_or(0));
            info.audio_sample_rate = audio.sample_rate.unwrap_or(0);
            info.audio_channels = audio.channels.unwrap_or(0);
            info.audio_bits_per_sample = audio.bits_per_sample.unwrap_or(0);
        }

        if info.fps <= 0.0 || !info.fps.is_finite() {
            tracing::warn!("AVI declares no frame rate, assuming {}fps", DEFAULT_FPS);
            info.fps = DEFAULT_FPS;
        }

        self.info = info;
    }

    pub fn streams(&self) -> &[AviStream] {
        &self.streams
    }

    fn skip_to(&mut self, pos: u64) -> io::Result<()> {
        self.position = pos;
        self.reader.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn end_of_stream(&mut self) -> Result<Option<MediaUnit<'_>>, DemuxError> {
        self.finished = true;
        Ok(None)
    }
}

impl<R: Read + Seek + Send> Demuxer for AviDemuxer<R> {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_unit(&mut self) -> Result<Option<MediaUnit<'_>>, DemuxError> {
        loop {
            if self.finished || self.position + 8 > self.movi_end {
                return self.end_of_stream();
            }

            let mut header = [0u8; 8];
            match self.reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::warn!("AVI truncated at chunk header (offset {})", self.position);
                    return self.end_of_stream();
                }
                Err(e) => return Err(e.into()),
            }
            let fourcc = le_u32(&header[0..4]);
            let size = le_u32(&header[4..8]) as u64;
            self.position += 8;

            if fourcc == LIST {
                // Grouping list such as 'rec ': step over the list type and descend
                self.skip_to(self.position + 4)?;
                continue;
            }

            let next = self.position + size + (size & 1);
            let kind = match classify_chunk(fourcc) {
                Some((stream, UnitKind::Video)) if Some(stream) == self.video_stream => {
                    UnitKind::Video
                }
                Some((stream, UnitKind::Audio)) if Some(stream) == self.audio_stream => {
                    UnitKind::Audio
                }
                _ => {
                    self.stats.skipped_chunks += 1;
                    self.skip_to(next)?;
                    continue;
                }
            };

            if size as usize > self.max_chunk_size {
                self.stats.oversized_chunks += 1;
                if should_log(self.stats.oversized_chunks) {
                    tracing::warn!(
                        "Skipping oversized {} chunk: {} > {} bytes ({} so far)",
                        fourcc_to_string(fourcc),
                        size,
                        self.max_chunk_size,
                        self.stats.oversized_chunks
                    );
                }
                self.skip_to(next)?;
                continue;
            }

            let len = size as usize;
            match self.reader.read_exact(&mut self.buffer[..len]) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::warn!(
                        "AVI truncated inside {} chunk (offset {})",
                        fourcc_to_string(fourcc),
                        self.position
                    );
                    return self.end_of_stream();
                }
                Err(e) => return Err(e.into()),
            }
            if size & 1 == 1 {
                self.reader.seek(SeekFrom::Current(1))?;
            }
            self.position = next;

            match kind {
                UnitKind::Video => self.stats.video_units += 1,
                UnitKind::Audio => self.stats.audio_units += 1,
            }
            let sequence = self.sequence;
            self.sequence += 1;

            return Ok(Some(MediaUnit {
                kind,
                data: &self.buffer[..len],
                sequence,
            }));
        }
    }

    fn stats(&self) -> DemuxStats {
        self.stats
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

// ============================================================================
// Header Parsing
// ============================================================================

fn parse_avih(data: &[u8]) -> io::Result<MainHeader> {
    let mut r = Cursor::new(data);
    let microsec_per_frame = read_u32_le(&mut r)?;
    let _max_bytes_per_sec = read_u32_le(&mut r)?;
    let _padding_granularity = read_u32_le(&mut r)?;
    let _flags = read_u32_le(&mut r)?;
    let total_frames = read_u32_le(&mut r)?;
    let _initial_frames = read_u32_le(&mut r)?;
    let _streams = read_u32_le(&mut r)?;
    let _suggested_buffer_size = read_u32_le(&mut r)?;
    let width = read_u32_le(&mut r)?;
    let height = read_u32_le(&mut r)?;

    Ok(MainHeader {
        microsec_per_frame,
        total_frames,
        width,
        height,
    })
}

fn read_strh(data: &[u8]) -> io::Result<StreamHeader> {
    let mut r = Cursor::new(data);
    let fcc_type = read_u32_le(&mut r)?;
    let fcc_handler = read_u32_le(&mut r)?;
    let _flags = read_u32_le(&mut r)?;
    let _priority = read_u16_le(&mut r)?;
    let _language = read_u16_le(&mut r)?;
    let _initial_frames = read_u32_le(&mut r)?;
    let scale = read_u32_le(&mut r)?;
    let rate = read_u32_le(&mut r)?;
    let _start = read_u32_le(&mut r)?;
    let length = read_u32_le(&mut r)?;

    Ok(StreamHeader {
        fcc_type,
        fcc_handler,
        scale,
        rate,
        length,
    })
}

fn parse_video_format(stream: &mut AviStream, data: &[u8]) -> io::Result<()> {
    // BITMAPINFOHEADER
    let mut r = Cursor::new(data);
    let _bih_size = read_u32_le(&mut r)?;
    stream.width = Some(read_u32_le(&mut r)?);
    let height = read_u32_le(&mut r)? as i32;
    stream.height = Some(height.unsigned_abs());
    let _planes = read_u16_le(&mut r)?;
    let _bit_count = read_u16_le(&mut r)?;
    stream.compression = Some(read_u32_le(&mut r)?);
    Ok(())
}

fn parse_audio_format(stream: &mut AviStream, data: &[u8]) -> io::Result<()> {
    // WAVEFORMATEX
    let mut r = Cursor::new(data);
    stream.format_tag = Some(read_u16_le(&mut r)?);
    stream.channels = Some(read_u16_le(&mut r)?);
    stream.sample_rate = Some(read_u32_le(&mut r)?);
    let _avg_bytes_per_sec = read_u32_le(&mut r)?;
    let _block_align = read_u16_le(&mut r)?;
    stream.bits_per_sample = Some(read_u16_le(&mut r)?);
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn read_u16_le<R: Read>(reader: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32_le<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn pad_fourcc(bytes: &[u8]) -> [u8; 4] {
    let mut out = [b' '; 4];
    for (dst, src) in out.iter_mut().zip(bytes) {
        *dst = *src;
    }
    out
}

fn fourcc_to_string(fourcc: u32) -> String {
    fourcc
        .to_le_bytes()
        .iter()
        .filter(|&&b| b.is_ascii_graphic() || b == b' ')
        .map(|&b| b as char)
        .collect()
}

fn to_ascii_uppercase(fourcc: u32) -> u32 {
    u32::from_le_bytes(fourcc.to_le_bytes().map(|b| b.to_ascii_uppercase()))
}

fn identify_video_codec(fourcc: u32) -> VideoCodec {
    match to_ascii_uppercase(fourcc) {
        MJPG => VideoCodec::Mjpeg,
        I420 | IYUV => VideoCodec::RawI420,
        H264 | AVC1 | X264 => VideoCodec::H264,
        _ => VideoCodec::Unknown,
    }
}

fn identify_audio_codec(format_tag: u16) -> AudioCodec {
    match format_tag {
        WAVE_FORMAT_PCM => AudioCodec::Pcm,
        WAVE_FORMAT_MPEGLAYER3 => AudioCodec::Mp3,
        WAVE_FORMAT_AAC | WAVE_FORMAT_MPEG_ADTS_AAC => AudioCodec::Aac,
        _ => AudioCodec::Unknown,
    }
}

/// `##dc`/`##db` are video, `##wb` audio. Returns the stream number.
fn classify_chunk(fourcc: u32) -> Option<(u32, UnitKind)> {
    let b = fourcc.to_le_bytes();
    if !b[0].is_ascii_digit() || !b[1].is_ascii_digit() {
        return None;
    }
    let stream = ((b[0] - b'0') * 10 + (b[1] - b'0')) as u32;
    match &b[2..4] {
        b"dc" | b"db" => Some((stream, UnitKind::Video)),
        b"wb" => Some((stream, UnitKind::Audio)),
        _ => None,
    }
}

/// First ten occurrences, then every hundredth
pub(crate) fn should_log(count: u64) -> bool {
    count <= 10 || count % 100 == 0
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{riff_chunk, AviBuilder};

    fn open(data: Vec<u8>) -> AviDemuxer<Cursor<Vec<u8>>> {
        AviDemuxer::new(Cursor::new(data), 100 * 1024).unwrap()
    }

    fn drain(demuxer: &mut AviDemuxer<Cursor<Vec<u8>>>) -> Vec<(UnitKind, Vec<u8>, u64)> {
        let mut units = Vec::new();
        while let Some(unit) = demuxer.next_unit().unwrap() {
            units.push((unit.kind, unit.data.to_vec(), unit.sequence));
        }
        units
    }

    #[test]
    fn test_header_info() {
        let data = AviBuilder::new(320, 240, 25)
            .video_fourcc(*b"MJPG")
            .pcm_audio(22050, 2, 16)
            .video_frames(3)
            .build();
        let demuxer = open(data);
        let info = demuxer.info();

        assert_eq!(info.width, 320);
        assert_eq!(info.height, 240);
        assert!((info.fps - 25.0).abs() < 1e-9);
        assert_eq!(info.total_frames, 3);
        assert_eq!(info.video_codec, VideoCodec::Mjpeg);
        assert_eq!(info.video_fourcc, "MJPG");
        assert!(info.has_audio);
        assert_eq!(info.audio_codec, AudioCodec::Pcm);
        assert_eq!(info.audio_sample_rate, 22050);
        assert_eq!(info.audio_channels, 2);
        assert_eq!(demuxer.streams().len(), 2);
    }

    #[test]
    fn test_strh_rate_overrides_avih() {
        // avih rounds 29.97fps to 33367us; strh carries 30000/1001
        let data = AviBuilder::new(16, 16, 30)
            .avih_us_per_frame(33367)
            .strh_rate(30000, 1001)
            .video_frames(1)
            .build();
        let demuxer = open(data);
        assert!((demuxer.info().fps - 29.97).abs() < 0.001);
    }

    #[test]
    fn test_units_in_file_order() {
        let data = AviBuilder::new(8, 8, 30)
            .pcm_audio(8000, 1, 16)
            .video_chunk(vec![1; 10])
            .audio_chunk(vec![2; 7])
            .video_chunk(vec![3; 11])
            .audio_chunk(vec![4; 8])
            .build();
        let mut demuxer = open(data);
        let units = drain(&mut demuxer);

        let kinds: Vec<UnitKind> = units.iter().map(|u| u.0).collect();
        assert_eq!(
            kinds,
            vec![UnitKind::Video, UnitKind::Audio, UnitKind::Video, UnitKind::Audio]
        );
        assert_eq!(units[1].1, vec![2; 7]);
        assert_eq!(units[2].1, vec![3; 11]);
        assert!(units.windows(2).all(|w| w[0].2 < w[1].2));

        // EndOfStream is sticky
        assert!(demuxer.next_unit().unwrap().is_none());
        assert!(demuxer.is_finished());
        assert_eq!(demuxer.stats().video_units, 2);
        assert_eq!(demuxer.stats().audio_units, 2);
    }

    #[test]
    fn test_skips_junk_and_descends_rec_lists() {
        let mut rec = b"rec ".to_vec();
        rec.extend(riff_chunk(*b"00dc", &[9; 5]));
        rec.extend(riff_chunk(*b"01wb", &[8; 3]));

        let data = AviBuilder::new(8, 8, 30)
            .pcm_audio(8000, 1, 8)
            .raw_chunk(*b"JUNK", vec![0; 13])
            .video_chunk(vec![7; 3])
            .raw_chunk(*b"LIST", rec)
            .raw_chunk(*b"ix00", vec![0; 24])
            .video_chunk(vec![6; 2])
            .build();
        let mut demuxer = open(data);
        let units = drain(&mut demuxer);

        let payloads: Vec<Vec<u8>> = units.iter().map(|u| u.1.clone()).collect();
        assert_eq!(payloads, vec![vec![7; 3], vec![9; 5], vec![8; 3], vec![6; 2]]);
        assert_eq!(demuxer.stats().skipped_chunks, 2);
    }

    #[test]
    fn test_oversized_chunk_skipped_without_desync() {
        let data = AviBuilder::new(8, 8, 30)
            .video_chunk(vec![1; 4])
            .video_chunk(vec![2; 4097])
            .video_chunk(vec![3; 4])
            .build();
        let mut demuxer = AviDemuxer::new(Cursor::new(data), 4096).unwrap();

        let first = demuxer.next_unit().unwrap().unwrap().data.to_vec();
        let second = demuxer.next_unit().unwrap().unwrap().data.to_vec();
        assert_eq!(first, vec![1; 4]);
        assert_eq!(second, vec![3; 4]);
        assert!(demuxer.next_unit().unwrap().is_none());
        assert_eq!(demuxer.stats().oversized_chunks, 1);
    }

    #[test]
    fn test_truncated_file_ends_stream() {
        let mut data = AviBuilder::new(8, 8, 30)
            .video_chunk(vec![1; 100])
            .video_chunk(vec![2; 100])
            .build();
        data.truncate(data.len() - 50);
        let mut demuxer = open(data);

        assert_eq!(demuxer.next_unit().unwrap().unwrap().data, &[1u8; 100][..]);
        assert!(demuxer.next_unit().unwrap().is_none());
        assert!(demuxer.is_finished());
    }

    #[test]
    fn test_rejects_non_avi() {
        let err = AviDemuxer::new(Cursor::new(b"RIFF\0\0\0\0WAVEfmt ".to_vec()), 1024)
            .err()
            .unwrap();
        assert!(matches!(err, DemuxError::InvalidFormat(_)));

        let err = AviDemuxer::new(Cursor::new(b"OggS".to_vec()), 1024).err().unwrap();
        assert!(matches!(err, DemuxError::InvalidFormat(_)));
    }

    #[test]
    fn test_missing_movi_is_invalid() {
        let mut data = AviBuilder::new(8, 8, 30).video_frames(1).build();
        // Rename 'movi' so the walker never finds it
        let at = data.windows(4).position(|w| w == b"movi").unwrap();
        data[at..at + 4].copy_from_slice(b"xxxx");

        let err = AviDemuxer::new(Cursor::new(data), 1024).err().unwrap();
        assert!(matches!(err, DemuxError::InvalidFormat(_)));
    }

    #[test]
    fn test_classify_chunk() {
        let fourcc = |s: &[u8; 4]| u32::from_le_bytes(*s);
        assert_eq!(classify_chunk(fourcc(b"00dc")), Some((0, UnitKind::Video)));
        assert_eq!(classify_chunk(fourcc(b"00db")), Some((0, UnitKind::Video)));
        assert_eq!(classify_chunk(fourcc(b"01wb")), Some((1, UnitKind::Audio)));
        assert_eq!(classify_chunk(fourcc(b"00pc")), None);
        assert_eq!(classify_chunk(fourcc(b"JUNK")), None);
    }
}
