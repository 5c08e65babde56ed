// ES DEMUXER - H.264 Annex B + AAC ADTS from memory
//
// Both blobs are resident (`Bytes`), so units are zero-copy slices.
// There is no container clock: video unit n is presented at
// n * frame_duration and audio frame m at m * 1024 / sample_rate. The
// two streams are merged by that time, video first on ties.

use bytes::Bytes;

use crate::adts::{self, SAMPLES_PER_FRAME};
use crate::config::ElementaryConfig;
use crate::demuxer::{DemuxError, DemuxStats, Demuxer};
use crate::h264_utils;
use crate::media::{AudioCodec, MediaUnit, StreamInfo, UnitKind, VideoCodec};

pub struct ElementaryDemuxer {
    video: Bytes,
    audio: Option<Bytes>,
    info: StreamInfo,
    video_pos: usize,
    audio_pos: usize,
    video_done: bool,
    audio_done: bool,
    video_count: u64,
    audio_count: u64,
    sequence: u64,
    stats: DemuxStats,
}

impl ElementaryDemuxer {
    pub fn new(
        video: Bytes,
        audio: Option<Bytes>,
        config: &ElementaryConfig,
    ) -> Result<Self, DemuxError> {
        if h264_utils::find_start_code(&video, 0).is_none() {
            return Err(DemuxError::InvalidFormat(
                "Video blob has no Annex B start code".into(),
            ));
        }

        let mut info = StreamInfo {
            width: config.width,
            height: config.height,
            fps: config.fps,
            has_video: true,
            video_codec: VideoCodec::H264,
            video_fourcc: "H264".into(),
            ..StreamInfo::default()
        };

        let audio = match audio {
            Some(blob) => match adts::next_frame(&blob, 0) {
                Some(first) => {
                    info.has_audio = true;
                    info.audio_codec = AudioCodec::Aac;
                    info.audio_sample_rate = first.header.sample_rate();
                    info.audio_channels = first.header.channels();
                    info.audio_bits_per_sample = 16;
                    Some(blob)
                }
                None => {
                    return Err(DemuxError::InvalidFormat(
                        "Audio blob has no ADTS frame".into(),
                    ))
                }
            },
            None => None,
        };
        info.fps = info.effective_fps();

        tracing::info!(
            "Elementary streams opened: video {} bytes ({}x{} @ {}fps), audio {}",
            video.len(),
            info.width,
            info.height,
            info.fps,
            match &audio {
                Some(a) => format!("{} bytes AAC {}Hz/{}ch", a.len(), info.audio_sample_rate, info.audio_channels),
                None => "none".to_string(),
            }
        );

        Ok(Self {
            audio_done: audio.is_none(),
            video,
            audio,
            info,
            video_pos: 0,
            audio_pos: 0,
            video_done: false,
            video_count: 0,
            audio_count: 0,
            sequence: 0,
            stats: DemuxStats::default(),
        })
    }

    fn video_time_us(&self) -> u64 {
        self.video_count * self.info.frame_duration_us()
    }

    fn audio_time_us(&self) -> u64 {
        let rate = self.info.audio_sample_rate.max(1) as u64;
        self.audio_count * SAMPLES_PER_FRAME as u64 * 1_000_000 / rate
    }

    /// Byte range of the next picture, or None at end of blob
    fn take_video(&mut self) -> Option<(usize, usize)> {
        match h264_utils::next_access_unit(&self.video, self.video_pos) {
            Some(range) => {
                self.video_pos = range.end;
                self.video_count += 1;
                self.stats.video_units += 1;
                Some((range.start, range.end))
            }
            None => {
                self.video_done = true;
                None
            }
        }
    }

    fn take_audio(&mut self) -> Option<(usize, usize)> {
        let audio = self.audio.as_ref()?;
        match adts::next_frame(audio, self.audio_pos) {
            Some(frame) => {
                if frame.skipped > 0 {
                    self.stats.resyncs += 1;
                    self.stats.resync_bytes += frame.skipped as u64;
                    tracing::warn!(
                        "ADTS resync: skipped {} bytes at offset {}",
                        frame.skipped,
                        self.audio_pos
                    );
                }
                let end = frame.offset + frame.header.frame_length;
                self.audio_pos = end;
                self.audio_count += 1;
                self.stats.audio_units += 1;
                Some((frame.offset, end))
            }
            None => {
                let trailing = audio.len().saturating_sub(self.audio_pos);
                if trailing > 0 {
                    self.stats.resync_bytes += trailing as u64;
                    tracing::debug!("ADTS stream ends with {} unusable bytes", trailing);
                }
                self.audio_done = true;
                None
            }
        }
    }

    fn unit(&mut self, kind: UnitKind, start: usize, end: usize) -> MediaUnit<'_> {
        let sequence = self.sequence;
        self.sequence += 1;
        let data = match kind {
            UnitKind::Video => &self.video[start..end],
            UnitKind::Audio => match &self.audio {
                Some(audio) => &audio[start..end],
                None => &[],
            },
        };
        MediaUnit {
            kind,
            data,
            sequence,
        }
    }
}

impl Demuxer for ElementaryDemuxer {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_unit(&mut self) -> Result<Option<MediaUnit<'_>>, DemuxError> {
        loop {
            let prefer_video = match (self.video_done, self.audio_done) {
                (true, true) => return Ok(None),
                (false, true) => true,
                (true, false) => false,
                (false, false) => self.video_time_us() <= self.audio_time_us(),
            };

            if prefer_video {
                if let Some((start, end)) = self.take_video() {
                    return Ok(Some(self.unit(UnitKind::Video, start, end)));
                }
            } else if let Some((start, end)) = self.take_audio() {
                return Ok(Some(self.unit(UnitKind::Audio, start, end)));
            }
        }
    }

    fn stats(&self) -> DemuxStats {
        self.stats
    }

    fn is_finished(&self) -> bool {
        self.video_done && self.audio_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{adts_frame, H264Builder};

    fn config() -> ElementaryConfig {
        ElementaryConfig {
            width: 300,
            height: 240,
            fps: 30.0,
        }
    }

    fn adts_blob(frames: usize) -> Vec<u8> {
        // 48kHz mono: one frame = 21.33ms
        (0..frames).flat_map(|i| adts_frame(3, 1, 10 + i % 5)).collect()
    }

    #[test]
    fn test_video_only() {
        let video = H264Builder::new().pictures(5).build();
        let mut demuxer = ElementaryDemuxer::new(Bytes::from(video), None, &config()).unwrap();
        assert!(!demuxer.info().has_audio);

        let mut count = 0;
        while let Some(unit) = demuxer.next_unit().unwrap() {
            assert_eq!(unit.kind, UnitKind::Video);
            assert!(h264_utils::is_annexb(unit.data));
            count += 1;
        }
        assert_eq!(count, 5);
        assert!(demuxer.is_finished());
    }

    #[test]
    fn test_interleaves_by_presentation_time() {
        let video = H264Builder::new().pictures(6).build();
        let audio = adts_blob(9);
        let mut demuxer =
            ElementaryDemuxer::new(Bytes::from(video), Some(Bytes::from(audio)), &config())
                .unwrap();
        assert_eq!(demuxer.info().audio_sample_rate, 48000);
        assert_eq!(demuxer.info().audio_channels, 1);

        let mut order = Vec::new();
        let mut last_sequence = None;
        while let Some(unit) = demuxer.next_unit().unwrap() {
            if let Some(prev) = last_sequence {
                assert!(unit.sequence > prev);
            }
            last_sequence = Some(unit.sequence);
            order.push(unit.kind);
        }

        // v@0 a@0 a@21.3 v@33.3 a@42.7 v@66.7 a@64 ...
        use UnitKind::{Audio as A, Video as V};
        assert_eq!(&order[..5], &[V, A, A, V, A]);
        assert_eq!(order.iter().filter(|k| **k == V).count(), 6);
        assert_eq!(order.iter().filter(|k| **k == A).count(), 9);
    }

    #[test]
    fn test_corrupt_audio_resyncs() {
        let video = H264Builder::new().pictures(1).build();
        let mut audio = adts_frame(3, 1, 10);
        audio.extend_from_slice(&[0xFF, 0x00, 0x13, 0x37, 0x00]);
        audio.extend(adts_frame(3, 1, 11));
        audio.extend(adts_frame(3, 1, 12));

        let mut demuxer =
            ElementaryDemuxer::new(Bytes::from(video), Some(Bytes::from(audio)), &config())
                .unwrap();
        let mut audio_units = 0;
        while let Some(unit) = demuxer.next_unit().unwrap() {
            if unit.kind == UnitKind::Audio {
                assert_eq!(&unit.data[..2], &[0xFF, 0xF1]);
                audio_units += 1;
            }
        }
        assert_eq!(audio_units, 3);
        assert_eq!(demuxer.stats().resyncs, 1);
        assert_eq!(demuxer.stats().resync_bytes, 5);
    }

    #[test]
    fn test_rejects_blobs_without_sync() {
        let err = ElementaryDemuxer::new(Bytes::from_static(&[1, 2, 3, 4]), None, &config())
            .err()
            .unwrap();
        assert!(matches!(err, DemuxError::InvalidFormat(_)));

        let video = Bytes::from(H264Builder::new().pictures(1).build());
        let err = ElementaryDemuxer::new(video, Some(Bytes::from_static(&[0; 32])), &config())
            .err()
            .unwrap();
        assert!(matches!(err, DemuxError::InvalidFormat(_)));
    }
}
