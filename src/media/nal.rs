//! NAL unit handling
//!
//! The depacketizer yields access units in Annex-B framing (start-code
//! delimited); the MP4 muxer wants AVCC framing (4-byte length prefixes).
//! This module converts between the two and classifies NAL types so the
//! recorder can separate parameter sets from picture data.

use bytes::{BufMut, Bytes, BytesMut};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// NAL unit type (low 5 bits of the header byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Non-IDR slice
    Slice,
    /// IDR slice (keyframe)
    Idr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    /// Anything else
    Other(u8),
}

impl NalUnitType {
    pub fn from_header(b: u8) -> Self {
        match b & 0x1F {
            1 => NalUnitType::Slice,
            5 => NalUnitType::Idr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            other => NalUnitType::Other(other),
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, NalUnitType::Idr)
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NalUnitType::Sps | NalUnitType::Pps)
    }
}

/// Split an Annex-B buffer into NAL units
///
/// Handles both 3-byte (`00 00 01`) and 4-byte (`00 00 00 01`) start codes.
/// Bytes before the first start code are discarded.
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut nalus = Vec::new();
    let mut start: Option<usize> = None;
    let mut i = 0;
    while i < data.len() {
        if i + 3 < data.len() && data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                if let Some(s) = start {
                    nalus.push(&data[s..i]);
                }
                start = Some(i + 3);
                i += 3;
                continue;
            }
            if i + 4 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                if let Some(s) = start {
                    nalus.push(&data[s..i]);
                }
                start = Some(i + 4);
                i += 4;
                continue;
            }
        }
        i += 1;
    }
    if let Some(s) = start {
        if s < data.len() {
            nalus.push(&data[s..]);
        }
    }
    nalus
}

/// Remove emulation-prevention bytes (`00 00 03` becomes `00 00`)
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if i + 2 < data.len() && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 3 {
            out.push(0);
            out.push(0);
            i += 3;
            continue;
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

/// Assemble NAL units into one AVCC sample (4-byte big-endian lengths)
pub fn build_avcc_sample(nalus: &[&[u8]]) -> Bytes {
    let total: usize = nalus.iter().map(|n| n.len() + 4).sum();
    let mut buf = BytesMut::with_capacity(total);
    for nalu in nalus {
        buf.put_u32(nalu.len() as u32);
        buf.put_slice(nalu);
    }
    buf.freeze()
}

/// Decode `sprop-parameter-sets` NAL units from an SDP fmtp line
///
/// Lets the muxer open a segment before the first in-band SPS/PPS arrives.
pub fn parse_sprop_parameter_sets(fmtp: &str) -> Vec<Vec<u8>> {
    for field in fmtp.split(';') {
        let field = field.trim();
        let Some(raw) = field.strip_prefix("sprop-parameter-sets=") else {
            continue;
        };
        let mut nalus = Vec::new();
        for part in raw.split(',') {
            match BASE64.decode(part.trim()) {
                Ok(data) if !data.is_empty() => nalus.push(data),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to decode sprop-parameter-sets value");
                }
            }
        }
        return nalus;
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nal_type_from_header() {
        assert_eq!(NalUnitType::from_header(0x65), NalUnitType::Idr);
        assert_eq!(NalUnitType::from_header(0x67), NalUnitType::Sps);
        assert_eq!(NalUnitType::from_header(0x68), NalUnitType::Pps);
        assert_eq!(NalUnitType::from_header(0x41), NalUnitType::Slice);
        assert!(NalUnitType::from_header(0x65).is_keyframe());
        assert!(NalUnitType::from_header(0x67).is_parameter_set());
        assert!(!NalUnitType::from_header(0x41).is_parameter_set());
    }

    #[test]
    fn test_split_three_byte_start_codes() {
        let data = [0x00, 0x00, 0x01, 0x67, 0xAA, 0x00, 0x00, 0x01, 0x68, 0xBB];
        let nalus = split_annex_b(&data);
        assert_eq!(nalus, vec![&[0x67, 0xAA][..], &[0x68, 0xBB][..]]);
    }

    #[test]
    fn test_split_four_byte_start_codes() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0xAA, //
            0x00, 0x00, 0x00, 0x01, 0x65, 0xCC, 0xDD,
        ];
        let nalus = split_annex_b(&data);
        assert_eq!(nalus, vec![&[0x67, 0xAA][..], &[0x65, 0xCC, 0xDD][..]]);
    }

    #[test]
    fn test_split_discards_leading_garbage() {
        let data = [0xDE, 0xAD, 0x00, 0x00, 0x01, 0x41, 0x99];
        let nalus = split_annex_b(&data);
        assert_eq!(nalus, vec![&[0x41, 0x99][..]]);
    }

    #[test]
    fn test_split_no_start_code() {
        assert!(split_annex_b(&[0x41, 0x99, 0x00]).is_empty());
    }

    #[test]
    fn test_remove_emulation_prevention() {
        let data = [0x00, 0x00, 0x03, 0x01, 0xFF, 0x00, 0x00, 0x03, 0x03];
        assert_eq!(
            remove_emulation_prevention(&data),
            vec![0x00, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x03]
        );
    }

    #[test]
    fn test_remove_emulation_prevention_untouched() {
        let data = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(remove_emulation_prevention(&data), data.to_vec());
    }

    #[test]
    fn test_build_avcc_sample() {
        let sample = build_avcc_sample(&[&[0x65, 0x88], &[0x41]]);
        assert_eq!(
            sample.as_ref(),
            &[0x00, 0x00, 0x00, 0x02, 0x65, 0x88, 0x00, 0x00, 0x00, 0x01, 0x41]
        );
    }

    #[test]
    fn test_parse_sprop_parameter_sets() {
        // "Z0IAHw==" is [0x67, 0x42, 0x00, 0x1F], "aM4G" is [0x68, 0xCE, 0x06]
        let fmtp = "packetization-mode=1;sprop-parameter-sets=Z0IAHw==,aM4G";
        let nalus = parse_sprop_parameter_sets(fmtp);
        assert_eq!(nalus.len(), 2);
        assert_eq!(nalus[0], vec![0x67, 0x42, 0x00, 0x1F]);
        assert_eq!(nalus[1], vec![0x68, 0xCE, 0x06]);
    }

    #[test]
    fn test_parse_sprop_absent() {
        assert!(parse_sprop_parameter_sets("packetization-mode=1").is_empty());
    }
}
