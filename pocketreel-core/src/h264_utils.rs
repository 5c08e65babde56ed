//! H.264 Annex B utilities
//!
//! Start-code scanning and access-unit grouping for raw `.h264` blobs.
//! A picture is emitted as one contiguous slice: any SEI/SPS/PPS/AUD
//! that precedes it, plus all of its slices.

use std::ops::Range;

/// Annex B start code (4-byte version)
pub const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR_SLICE: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// Location of one NAL unit inside a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit {
    /// Offset of the start code (the leading zero of a 4-byte code)
    pub start: usize,
    /// Offset of the NAL header byte
    pub payload: usize,
    /// One past the last byte
    pub end: usize,
}

impl NalUnit {
    pub fn header<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.payload..self.end]
    }
}

/// Find the next start code at or after `from`.
/// Returns (offset of the code, length of the code).
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i + 2] > 1 {
            // Neither of the next two positions can start a code
            i += 3;
            continue;
        }
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if i > from && data[i - 1] == 0 {
                return Some((i - 1, 4));
            }
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

/// Iterator over the NAL units of an Annex B blob, starting at `from`.
pub struct NalIter<'a> {
    data: &'a [u8],
    next: Option<(usize, usize)>,
}

impl<'a> NalIter<'a> {
    pub fn new(data: &'a [u8], from: usize) -> Self {
        Self {
            data,
            next: find_start_code(data, from),
        }
    }
}

impl Iterator for NalIter<'_> {
    type Item = NalUnit;

    fn next(&mut self) -> Option<NalUnit> {
        let (start, code_len) = self.next?;
        let payload = start + code_len;
        self.next = find_start_code(self.data, payload);
        let end = self.next.map(|(s, _)| s).unwrap_or(self.data.len());
        Some(NalUnit {
            start,
            payload,
            end,
        })
    }
}

pub fn nal_type(header: u8) -> u8 {
    header & 0x1F
}

pub fn is_vcl(nal_type: u8) -> bool {
    nal_type == NAL_SLICE || nal_type == NAL_IDR_SLICE
}

/// Non-VCL units that belong to the picture that follows them
pub fn is_picture_prefix(nal_type: u8) -> bool {
    matches!(nal_type, NAL_SEI | NAL_SPS | NAL_PPS | NAL_AUD)
}

/// `first_mb_in_slice` is ue(v) coded, so it is zero exactly when the
/// first bit after the NAL header is set.
pub fn starts_new_picture(nal: &[u8]) -> bool {
    nal.len() >= 2 && nal[1] & 0x80 != 0
}

/// Byte range of the access unit beginning at or after `from`.
pub fn next_access_unit(data: &[u8], from: usize) -> Option<Range<usize>> {
    let mut nals = NalIter::new(data, from);
    let first = nals.next()?;
    let mut seen_vcl = first_is_vcl(data, &first);
    let mut end = first.end;

    for nal in nals {
        let header = nal.header(data);
        let Some(&byte) = header.first() else {
            end = nal.end;
            continue;
        };
        let t = nal_type(byte);
        if seen_vcl && (is_picture_prefix(t) || (is_vcl(t) && starts_new_picture(header))) {
            return Some(first.start..nal.start);
        }
        if is_vcl(t) {
            seen_vcl = true;
        }
        end = nal.end;
    }

    Some(first.start..end)
}

fn first_is_vcl(data: &[u8], nal: &NalUnit) -> bool {
    nal.header(data)
        .first()
        .map(|&b| is_vcl(nal_type(b)))
        .unwrap_or(false)
}

/// Check if data already has Annex B start codes
pub fn is_annexb(data: &[u8]) -> bool {
    data.starts_with(&ANNEX_B_START_CODE) || data.starts_with(&[0x00, 0x00, 0x01])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(code: &[u8], body: &[u8]) -> Vec<u8> {
        let mut v = code.to_vec();
        v.extend_from_slice(body);
        v
    }

    #[test]
    fn test_find_start_code_both_lengths() {
        let data = [0xAA, 0x00, 0x00, 0x01, 0x67, 0x00, 0x00, 0x00, 0x01, 0x68];
        assert_eq!(find_start_code(&data, 0), Some((1, 3)));
        assert_eq!(find_start_code(&data, 4), Some((5, 4)));
        assert_eq!(find_start_code(&data, 9), None);
    }

    #[test]
    fn test_nal_iter() {
        let mut data = nal(&ANNEX_B_START_CODE, &[0x67, 0x42]);
        data.extend(nal(&[0, 0, 1], &[0x68, 0xCE]));
        let nals: Vec<NalUnit> = NalIter::new(&data, 0).collect();

        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], NalUnit { start: 0, payload: 4, end: 6 });
        assert_eq!(nals[1].header(&data), &[0x68, 0xCE]);
    }

    #[test]
    fn test_access_units_group_parameter_sets_and_slices() {
        let sps = nal(&ANNEX_B_START_CODE, &[0x67, 0x42, 0x00]);
        let pps = nal(&ANNEX_B_START_CODE, &[0x68, 0xCE]);
        let idr_a = nal(&ANNEX_B_START_CODE, &[0x65, 0x88, 0x01]); // first_mb = 0
        let idr_b = nal(&[0, 0, 1], &[0x65, 0x40, 0x02]); // first_mb != 0, same picture
        let p = nal(&ANNEX_B_START_CODE, &[0x41, 0x9A, 0x03]);
        let aud = nal(&ANNEX_B_START_CODE, &[0x09, 0xF0]);
        let p2 = nal(&ANNEX_B_START_CODE, &[0x41, 0x9A, 0x04]);

        let mut data = Vec::new();
        for part in [&sps, &pps, &idr_a, &idr_b, &p, &aud, &p2] {
            data.extend_from_slice(part);
        }

        let first = next_access_unit(&data, 0).unwrap();
        let first_len = sps.len() + pps.len() + idr_a.len() + idr_b.len();
        assert_eq!(first, 0..first_len);

        let second = next_access_unit(&data, first.end).unwrap();
        assert_eq!(second, first_len..first_len + p.len());

        let third = next_access_unit(&data, second.end).unwrap();
        assert_eq!(third, second.end..data.len());
        assert!(is_annexb(&data[third.clone()]));

        assert_eq!(next_access_unit(&data, third.end), None);
    }

    #[test]
    fn test_leading_garbage_skipped() {
        let mut data = vec![0xDE, 0xAD];
        data.extend(nal(&ANNEX_B_START_CODE, &[0x65, 0x80]));
        assert_eq!(next_access_unit(&data, 0), Some(2..data.len()));
        assert_eq!(next_access_unit(&[0xDE, 0xAD, 0xBE, 0xEF], 0), None);
    }
}
