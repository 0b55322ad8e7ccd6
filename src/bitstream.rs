//! Annex-B helpers for the compressed output: filler padding and NAL scanning.

use crate::Codec;

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const H264_FILLER: u8 = 12;
const HEVC_FILLER: u8 = 38;

/// Smallest filler NAL `filler_nal` can produce for `codec`.
pub fn filler_overhead(codec: Codec) -> usize {
    let header = match codec {
        Codec::H264 => 1,
        Codec::Hevc => 2,
    };
    START_CODE.len() + header + 1
}

/// Builds a filler-data NAL unit of exactly `len` bytes including its start
/// code, or of the minimum size when `len` is smaller than that.
pub fn filler_nal(codec: Codec, len: usize) -> Vec<u8> {
    let len = len.max(filler_overhead(codec));
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(&START_CODE);
    match codec {
        Codec::H264 => out.push(H264_FILLER),
        Codec::Hevc => out.extend_from_slice(&[HEVC_FILLER << 1, 0x01]),
    }
    out.resize(len - 1, 0xFF);
    // rbsp_trailing_bits
    out.push(0x80);
    out
}

/// Offsets and lengths of every Annex-B start code in `data`.
pub fn find_start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 3 <= data.len() {
        if i + 4 <= data.len()
            && data[i] == 0
            && data[i + 1] == 0
            && data[i + 2] == 0
            && data[i + 3] == 1
        {
            out.push((i, 4));
            i += 4;
            continue;
        }
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            out.push((i, 3));
            i += 3;
            continue;
        }
        i += 1;
    }
    out
}

/// NAL payloads of an Annex-B buffer, start codes stripped.
pub fn nal_units(data: &[u8]) -> Vec<&[u8]> {
    let codes = find_start_codes(data);
    codes
        .iter()
        .enumerate()
        .map(|(n, &(offset, len))| {
            let end = codes.get(n + 1).map_or(data.len(), |&(next, _)| next);
            &data[offset + len..end]
        })
        .filter(|nal| !nal.is_empty())
        .collect()
}

pub fn nal_type(codec: Codec, nal: &[u8]) -> Option<u8> {
    let &first = nal.first()?;
    Some(match codec {
        Codec::H264 => first & 0x1f,
        Codec::Hevc => (first >> 1) & 0x3f,
    })
}

pub fn is_filler(codec: Codec, nal: &[u8]) -> bool {
    match codec {
        Codec::H264 => nal_type(codec, nal) == Some(H264_FILLER),
        Codec::Hevc => nal_type(codec, nal) == Some(HEVC_FILLER),
    }
}

pub fn is_vcl(codec: Codec, nal: &[u8]) -> bool {
    match (codec, nal_type(codec, nal)) {
        (Codec::H264, Some(t)) => matches!(t, 1 | 2 | 3 | 4 | 5 | 19),
        (Codec::Hevc, Some(t)) => t <= 31,
        (_, None) => false,
    }
}

pub fn is_key_vcl(codec: Codec, nal: &[u8]) -> bool {
    match (codec, nal_type(codec, nal)) {
        (Codec::H264, Some(t)) => t == 5,
        (Codec::Hevc, Some(t)) => matches!(t, 16..=21),
        (_, None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_sample_annexb() -> Vec<u8> {
        let mut out = Vec::new();
        let mut push_nal = |nal: &[u8]| {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        };

        push_nal(&[0x09, 0xF0]);
        push_nal(&[0x65, 0x88, 0x84, 0x21]);
        out.extend_from_slice(&[0, 0, 1, 0x41, 0x9A, 0x22, 0x11]);

        out
    }

    #[test]
    fn splits_mixed_start_codes() {
        let data = h264_sample_annexb();
        let nals = nal_units(&data);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[1], &[0x65, 0x88, 0x84, 0x21]);
        assert!(is_key_vcl(Codec::H264, nals[1]));
        assert!(is_vcl(Codec::H264, nals[2]));
        assert!(!is_key_vcl(Codec::H264, nals[2]));
        assert!(!is_vcl(Codec::H264, nals[0]));
    }

    #[test]
    fn h264_filler_has_exact_length() {
        let nal = filler_nal(Codec::H264, 32);
        assert_eq!(nal.len(), 32);
        assert_eq!(&nal[..5], &[0, 0, 0, 1, 0x0C]);
        assert_eq!(nal.last(), Some(&0x80));
        assert!(nal[5..31].iter().all(|&b| b == 0xFF));
        let nals = nal_units(&nal);
        assert_eq!(nals.len(), 1);
        assert!(is_filler(Codec::H264, nals[0]));
    }

    #[test]
    fn hevc_filler_uses_two_byte_header() {
        let nal = filler_nal(Codec::Hevc, 3);
        assert_eq!(nal.len(), filler_overhead(Codec::Hevc));
        assert_eq!(nal_type(Codec::Hevc, &nal[4..]), Some(38));
        assert!(is_filler(Codec::Hevc, &nal[4..]));
    }
}
