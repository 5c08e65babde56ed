//! AAC ADTS framing
//!
//! Each ADTS frame carries a 7-byte header (9 with CRC) and exactly 1024
//! PCM samples per channel once decoded.

/// Samples per channel in one AAC frame
pub const SAMPLES_PER_FRAME: u32 = 1024;

const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    pub protection_absent: bool,
    pub profile: u8,
    pub sample_rate_index: u8,
    pub channel_config: u8,
    /// Whole frame including header
    pub frame_length: usize,
}

impl AdtsHeader {
    /// Parse a header at the start of `data`. `None` if the sync word,
    /// sample-rate index or length field is not plausible.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 7 {
            return None;
        }
        if data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
            return None;
        }
        // Layer must be 0
        if data[1] & 0x06 != 0 {
            return None;
        }

        let protection_absent = data[1] & 0x01 != 0;
        let profile = (data[2] >> 6) + 1;
        let sample_rate_index = (data[2] >> 2) & 0x0F;
        let channel_config = ((data[2] & 0x01) << 2) | (data[3] >> 6);
        let frame_length = (((data[3] & 0x03) as usize) << 11)
            | ((data[4] as usize) << 3)
            | ((data[5] as usize) >> 5);

        if sample_rate_index as usize >= SAMPLE_RATES.len() {
            return None;
        }
        let header = Self {
            protection_absent,
            profile,
            sample_rate_index,
            channel_config,
            frame_length,
        };
        if frame_length < header.header_len() {
            return None;
        }
        Some(header)
    }

    pub fn header_len(&self) -> usize {
        if self.protection_absent {
            7
        } else {
            9
        }
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATES[self.sample_rate_index as usize]
    }

    pub fn channels(&self) -> u16 {
        match self.channel_config {
            7 => 8,
            n => n as u16,
        }
    }
}

/// A frame located by `next_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsFrame {
    pub header: AdtsHeader,
    pub offset: usize,
    /// Bytes stepped over before `offset` to regain sync
    pub skipped: usize,
}

/// Find the next complete frame at or after `from`, scanning forward
/// past garbage. A frame whose length runs past the end of the buffer
/// is not returned.
pub fn next_frame(data: &[u8], from: usize) -> Option<AdtsFrame> {
    let mut pos = from;
    while pos + 7 <= data.len() {
        if let Some(header) = AdtsHeader::parse(&data[pos..]) {
            if pos + header.frame_length <= data.len() {
                return Some(AdtsFrame {
                    header,
                    offset: pos,
                    skipped: pos - from,
                });
            }
        }
        pos += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::adts_frame;

    #[test]
    fn test_parse_header_fields() {
        let frame = adts_frame(4, 2, 20);
        let header = AdtsHeader::parse(&frame).unwrap();

        assert_eq!(header.frame_length, 27);
        assert_eq!(header.sample_rate(), 44100);
        assert_eq!(header.channels(), 2);
        assert_eq!(header.profile, 2); // AAC LC
        assert!(header.protection_absent);
        assert_eq!(header.header_len(), 7);
    }

    #[test]
    fn test_rejects_bad_headers() {
        let mut frame = adts_frame(4, 2, 20);
        frame[1] = 0xE1;
        assert!(AdtsHeader::parse(&frame).is_none());

        // Sample rate index 15 is reserved
        let mut frame = adts_frame(4, 2, 20);
        frame[2] |= 0x3C;
        assert!(AdtsHeader::parse(&frame).is_none());

        // Length shorter than the header itself
        let mut frame = adts_frame(4, 2, 0);
        frame[4] = 0;
        frame[5] &= 0x1F;
        assert!(AdtsHeader::parse(&frame).is_none());
    }

    #[test]
    fn test_resync_past_garbage() {
        let mut data = vec![0x12, 0xFF, 0x00, 0x34];
        data.extend(adts_frame(3, 1, 10));
        data.extend(adts_frame(3, 1, 12));

        let first = next_frame(&data, 0).unwrap();
        assert_eq!(first.offset, 4);
        assert_eq!(first.skipped, 4);
        assert_eq!(first.header.sample_rate(), 48000);

        let second = next_frame(&data, first.offset + first.header.frame_length).unwrap();
        assert_eq!(second.skipped, 0);
        assert_eq!(second.header.frame_length, 19);
    }

    #[test]
    fn test_truncated_frame_not_returned() {
        let mut data = adts_frame(4, 2, 30);
        data.truncate(20);
        assert!(next_frame(&data, 0).is_none());
    }
}
