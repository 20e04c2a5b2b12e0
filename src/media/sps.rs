//! H.264 sequence parameter set parsing
//!
//! The MP4 muxer needs the frame geometry and the profile/constraint/level
//! bytes to build a valid `avcC` sample entry. Only the fields up to the
//! frame cropping window are parsed; everything after (VUI) is ignored.
//!
//! Input is the SPS RBSP *without* the NAL header byte and with
//! emulation-prevention bytes already removed (see [`super::nal`]).

use crate::error::{MediaError, Result};
use crate::media::bits::BitReader;

/// Profiles whose SPS carries `chroma_format_idc` and the scaling-list
/// syntax (High and friends, per ISO 14496-10 7.3.2.1.1).
const EXTENDED_PROFILE_IDCS: &[u8] = &[100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134];

/// Geometry and signature fields recovered from an SPS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub width: u16,
    pub height: u16,
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
}

impl SpsInfo {
    /// Parse an SPS RBSP (no NAL header byte, emulation prevention removed)
    pub fn parse(rbsp: &[u8]) -> Result<Self, MediaError> {
        if rbsp.len() < 4 {
            return Err(MediaError::SpsTooShort);
        }
        let profile_idc = rbsp[0];
        let constraint_flags = rbsp[1];
        let level_idc = rbsp[2];
        let mut br = BitReader::new(&rbsp[3..]);

        br.read_ue()?; // seq_parameter_set_id

        let mut chroma_format_idc = 1u32;
        if EXTENDED_PROFILE_IDCS.contains(&profile_idc) {
            chroma_format_idc = br.read_ue()?;
            if chroma_format_idc == 3 {
                br.read_bit()?; // separate_colour_plane_flag
            }
            br.read_ue()?; // bit_depth_luma_minus8
            br.read_ue()?; // bit_depth_chroma_minus8
            br.read_bit()?; // qpprime_y_zero_transform_bypass_flag
            if br.read_bit()? != 0 {
                // seq_scaling_matrix_present_flag
                let list_count = if chroma_format_idc == 3 { 12 } else { 8 };
                for i in 0..list_count {
                    if br.read_bit()? != 0 {
                        skip_scaling_list(&mut br, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        br.read_ue()?; // log2_max_frame_num_minus4
        let pic_order_cnt_type = br.read_ue()?;
        if pic_order_cnt_type == 0 {
            br.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
        } else if pic_order_cnt_type == 1 {
            br.read_bit()?; // delta_pic_order_always_zero_flag
            br.read_se()?; // offset_for_non_ref_pic
            br.read_se()?; // offset_for_top_to_bottom_field
            let num_ref_frames_in_cycle = br.read_ue()?;
            for _ in 0..num_ref_frames_in_cycle {
                br.read_se()?;
            }
        }
        br.read_ue()?; // max_num_ref_frames
        br.read_bit()?; // gaps_in_frame_num_value_allowed_flag

        let pic_width_in_mbs_minus1 = br.read_ue()?;
        let pic_height_in_map_units_minus1 = br.read_ue()?;
        let frame_mbs_only_flag = u32::from(br.read_bit()?);
        if frame_mbs_only_flag == 0 {
            br.read_bit()?; // mb_adaptive_frame_field_flag
        }
        br.read_bit()?; // direct_8x8_inference_flag

        let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
        if br.read_bit()? != 0 {
            // frame_cropping_flag
            crop_left = br.read_ue()?;
            crop_right = br.read_ue()?;
            crop_top = br.read_ue()?;
            crop_bottom = br.read_ue()?;
        }

        // The fields are attacker-controlled; everything below is checked
        // so an absurd dimension or crop is an error, not a wrap
        let mbs_width = pic_width_in_mbs_minus1
            .checked_add(1)
            .ok_or(MediaError::InvalidSpsGeometry)?;
        let mbs_height = pic_height_in_map_units_minus1
            .checked_add(1)
            .and_then(|h| h.checked_mul(2 - frame_mbs_only_flag))
            .ok_or(MediaError::InvalidSpsGeometry)?;

        // Crop units per the conformance window formula (7-21..7-24)
        let (crop_unit_x, crop_unit_y) = match chroma_format_idc {
            0 => (1, 2 - frame_mbs_only_flag),
            1 => (2, 2 * (2 - frame_mbs_only_flag)),
            2 => (2, 2 - frame_mbs_only_flag),
            _ => (1, 2 - frame_mbs_only_flag),
        };

        let crop_x = crop_left
            .checked_add(crop_right)
            .and_then(|c| c.checked_mul(crop_unit_x))
            .ok_or(MediaError::InvalidSpsGeometry)?;
        let crop_y = crop_top
            .checked_add(crop_bottom)
            .and_then(|c| c.checked_mul(crop_unit_y))
            .ok_or(MediaError::InvalidSpsGeometry)?;

        let width = mbs_width
            .checked_mul(16)
            .and_then(|w| w.checked_sub(crop_x))
            .ok_or(MediaError::InvalidSpsGeometry)?;
        let height = mbs_height
            .checked_mul(16)
            .and_then(|h| h.checked_sub(crop_y))
            .ok_or(MediaError::InvalidSpsGeometry)?;

        Ok(SpsInfo {
            width: u16::try_from(width).map_err(|_| MediaError::InvalidSpsGeometry)?,
            height: u16::try_from(height).map_err(|_| MediaError::InvalidSpsGeometry)?,
            profile_idc,
            constraint_flags,
            level_idc,
        })
    }
}

/// Skip a `scaling_list` of the given size
///
/// Deltas are only present while `next_scale` is non-zero; after that the
/// remaining coefficients repeat the last scale and occupy no bits.
fn skip_scaling_list(br: &mut BitReader<'_>, size: usize) -> Result<(), MediaError> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = br.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Baseline profile, level 3.1, 80x45 macroblocks, no cropping: 1280x720.
    // Hand-assembled: ue(0) x5, gaps=0, ue(79), ue(44), frame_mbs_only=1,
    // direct_8x8=1, cropping=0, vui=0, rbsp stop bit.
    const SPS_720P: &[u8] = &[0x42, 0x00, 0x1F, 0xF8, 0x0A, 0x00, 0xB7, 0x20];

    // Same shape with 120x68 macroblocks and crop_bottom=4: 1920x1080.
    const SPS_1080P: &[u8] = &[0x42, 0x00, 0x28, 0xF8, 0x0F, 0x00, 0x44, 0xFC, 0xA8];

    #[test]
    fn test_parse_720p() {
        let info = SpsInfo::parse(SPS_720P).unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.profile_idc, 66);
        assert_eq!(info.constraint_flags, 0);
        assert_eq!(info.level_idc, 31);
    }

    #[test]
    fn test_parse_1080p_with_cropping() {
        let info = SpsInfo::parse(SPS_1080P).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
    }

    #[test]
    fn test_too_short() {
        assert_eq!(SpsInfo::parse(&[0x42, 0x00]), Err(MediaError::SpsTooShort));
    }

    #[test]
    fn test_truncated_reports_overflow() {
        // Valid header bytes but the bitstream ends mid-field
        let truncated = &SPS_720P[..5];
        assert_eq!(
            SpsInfo::parse(truncated),
            Err(MediaError::BitReaderOverflow)
        );
    }

    #[test]
    fn test_oversized_ue_rejected() {
        // seq_parameter_set_id encoded with 32 leading zeros
        let rbsp = &[0x42, 0x00, 0x1F, 0x00, 0x00, 0x00, 0x00, 0x80];
        assert_eq!(SpsInfo::parse(rbsp), Err(MediaError::BitReaderOverflow));
    }

    #[test]
    fn test_crop_exceeding_frame_rejected() {
        // A 16x16 frame with crop_right=16: the conformance window
        // subtraction would underflow.
        // Bits: ue(0) x5, gaps=0, ue(0), ue(0), frame_mbs_only=1,
        // direct_8x8=1, cropping=1, crops ue(0), ue(16), ue(0), ue(0),
        // vui=0, stop bit.
        let rbsp = &[0x42, 0x00, 0x1F, 0xFB, 0xF0, 0x8E, 0x80];
        assert_eq!(SpsInfo::parse(rbsp), Err(MediaError::InvalidSpsGeometry));
    }
}
