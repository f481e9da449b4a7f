//! Frame-rate extraction from H.264/H.265 sequence parameter sets.
//!
//! The frame rate lives in the VUI timing info at the very end of the SPS
//! syntax, so both parsers descend the full SPS structure bit-exactly
//! (ITU-T H.264 §7.3.2.1.1, ITU-T H.265 §7.3.2.2.1) to reach
//! `num_units_in_tick` / `time_scale`. Every failure mode — no start code,
//! truncated payload, missing VUI, missing timing info, zero denominators —
//! resolves to the 25 fps default. No error ever propagates to callers.

use crate::bitstream::BitReader;
use crate::media::DEFAULT_FPS;

/// H.264 profiles whose SPS carries chroma/bit-depth/scaling-list fields
/// before `log2_max_frame_num_minus4` (ITU-T H.264 §7.3.2.1.1).
const H264_HIGH_PROFILES: [u32; 9] = [44, 83, 86, 100, 110, 118, 122, 128, 244];

/// Strip emulation-prevention bytes from a NAL payload.
///
/// Drops every `0x03` whose two preceding input bytes are `00 00`
/// (ITU-T H.264 §7.4.1.1). The input is the NAL unit body after the start
/// code, including the NAL header byte(s).
pub fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut rbsp = Vec::with_capacity(data.len());
    for (i, &byte) in data.iter().enumerate() {
        if i >= 2 && byte == 0x03 && data[i - 1] == 0x00 && data[i - 2] == 0x00 {
            continue;
        }
        rbsp.push(byte);
    }
    rbsp
}

/// Length of the Annex B start code at the head of `data`, or 0 if absent.
fn start_code_len(data: &[u8]) -> usize {
    if data.len() >= 4 && data[0] == 0 && data[1] == 0 {
        if data[2] == 0 && data[3] == 1 {
            return 4;
        }
        if data[2] == 1 {
            return 3;
        }
    }
    0
}

/// Parse the frame rate from an H.264 SPS NAL unit (start code included).
///
/// `fps = time_scale / (2 * num_units_in_tick)` — H.264 timing counts
/// fields, not frames (ITU-T H.264 §E.2.1). Returns 25.0 on any failure.
pub fn parse_h264_fps(sps: &[u8]) -> f64 {
    let offset = start_code_len(sps);
    if offset == 0 || offset + 1 >= sps.len() {
        tracing::warn!("H.264 SPS has no start code, using default fps");
        return DEFAULT_FPS;
    }

    let rbsp = strip_emulation_prevention(&sps[offset..]);
    if rbsp.len() < 4 {
        tracing::warn!("H.264 SPS too short, using default fps");
        return DEFAULT_FPS;
    }

    // Skip the 1-byte NAL header.
    match h264_fps_from_rbsp(&rbsp[1..]) {
        Some(fps) => fps,
        None => {
            tracing::debug!("H.264 SPS carries no usable timing info, using default fps");
            DEFAULT_FPS
        }
    }
}

fn h264_fps_from_rbsp(rbsp: &[u8]) -> Option<f64> {
    let mut r = BitReader::new(rbsp);

    let profile_idc = r.read_bits(8);
    r.skip_bits(8); // constraint_set flags + reserved
    r.skip_bits(8); // level_idc
    r.read_ue(); // seq_parameter_set_id

    if H264_HIGH_PROFILES.contains(&profile_idc) {
        let chroma_format_idc = r.read_ue();
        if chroma_format_idc == 3 {
            r.skip_bits(1); // separate_colour_plane_flag
        }
        r.read_ue(); // bit_depth_luma_minus8
        r.read_ue(); // bit_depth_chroma_minus8
        r.skip_bits(1); // qpprime_y_zero_transform_bypass_flag

        if r.read_bit() == 1 {
            // seq_scaling_matrix_present_flag
            let count = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..count {
                if r.read_bit() == 1 {
                    skip_h264_scaling_list(&mut r, if i < 6 { 16 } else { 64 });
                }
            }
        }
    }

    r.read_ue(); // log2_max_frame_num_minus4

    let pic_order_cnt_type = r.read_ue();
    if pic_order_cnt_type == 0 {
        r.read_ue(); // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        r.skip_bits(1); // delta_pic_order_always_zero_flag
        r.read_se(); // offset_for_non_ref_pic
        r.read_se(); // offset_for_top_to_bottom_field
        let num_ref_frames_in_cycle = r.read_ue();
        for _ in 0..num_ref_frames_in_cycle {
            r.read_se(); // offset_for_ref_frame
        }
    }

    r.read_ue(); // max_num_ref_frames
    r.skip_bits(1); // gaps_in_frame_num_value_allowed_flag
    r.read_ue(); // pic_width_in_mbs_minus1
    r.read_ue(); // pic_height_in_map_units_minus1

    let frame_mbs_only_flag = r.read_bit();
    if frame_mbs_only_flag == 0 {
        r.skip_bits(1); // mb_adaptive_frame_field_flag
    }

    r.skip_bits(1); // direct_8x8_inference_flag

    if r.read_bit() == 1 {
        // frame_cropping_flag
        r.read_ue();
        r.read_ue();
        r.read_ue();
        r.read_ue();
    }

    if r.read_bit() == 0 {
        // vui_parameters_present_flag
        return None;
    }

    // VUI prefix up to timing_info_present_flag (ITU-T H.264 §E.1.1).
    if r.read_bit() == 1 {
        // aspect_ratio_info_present_flag
        let aspect_ratio_idc = r.read_bits(8);
        if aspect_ratio_idc == 255 {
            // Extended_SAR
            r.skip_bits(16); // sar_width
            r.skip_bits(16); // sar_height
        }
    }

    if r.read_bit() == 1 {
        // overscan_info_present_flag
        r.skip_bits(1); // overscan_appropriate_flag
    }

    if r.read_bit() == 1 {
        // video_signal_type_present_flag
        r.skip_bits(3); // video_format
        r.skip_bits(1); // video_full_range_flag
        if r.read_bit() == 1 {
            // colour_description_present_flag
            r.skip_bits(24); // primaries + transfer + matrix
        }
    }

    if r.read_bit() == 1 {
        // chroma_loc_info_present_flag
        r.read_ue();
        r.read_ue();
    }

    if r.read_bit() == 0 {
        // timing_info_present_flag
        return None;
    }

    let num_units_in_tick = r.read_bits(32);
    let time_scale = r.read_bits(32);

    if num_units_in_tick == 0 || time_scale == 0 {
        return None;
    }

    Some(f64::from(time_scale) / (2.0 * f64::from(num_units_in_tick)))
}

fn skip_h264_scaling_list(r: &mut BitReader<'_>, size: u32) {
    let mut last_scale: i64 = 8;
    let mut next_scale: i64 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = i64::from(r.read_se());
            next_scale = (last_scale + delta_scale + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
}

/// Parse the frame rate from an H.265 SPS NAL unit (start code included).
///
/// `fps = vui_time_scale / vui_num_units_in_tick` (ITU-T H.265 §E.2.1).
/// Returns 25.0 on any failure.
pub fn parse_h265_fps(sps: &[u8]) -> f64 {
    let offset = start_code_len(sps);
    if offset == 0 || offset + 2 >= sps.len() {
        tracing::warn!("H.265 SPS has no start code, using default fps");
        return DEFAULT_FPS;
    }

    let rbsp = strip_emulation_prevention(&sps[offset..]);
    if rbsp.len() < 15 {
        tracing::warn!("H.265 SPS too short, using default fps");
        return DEFAULT_FPS;
    }

    // Skip the 2-byte NAL header.
    match h265_fps_from_rbsp(&rbsp[2..]) {
        Some(fps) => fps,
        None => {
            tracing::debug!("H.265 SPS carries no usable timing info, using default fps");
            DEFAULT_FPS
        }
    }
}

fn h265_fps_from_rbsp(rbsp: &[u8]) -> Option<f64> {
    let mut r = BitReader::new(rbsp);

    r.skip_bits(4); // sps_video_parameter_set_id
    let sps_max_sub_layers_minus1 = r.read_bits(3);
    r.skip_bits(1); // sps_temporal_id_nesting_flag

    // profile_tier_level (ITU-T H.265 §7.3.3)
    r.skip_bits(2); // general_profile_space
    r.skip_bits(1); // general_tier_flag
    r.skip_bits(5); // general_profile_idc
    r.skip_bits(32); // general_profile_compatibility_flag[32]
    r.skip_bits(1); // general_progressive_source_flag
    r.skip_bits(1); // general_interlaced_source_flag
    r.skip_bits(1); // general_non_packed_constraint_flag
    r.skip_bits(1); // general_frame_only_constraint_flag
    r.skip_bits(44); // general_reserved_zero_44bits
    r.skip_bits(8); // general_level_idc

    let mut sub_layer_profile_present = Vec::new();
    let mut sub_layer_level_present = Vec::new();
    for _ in 0..sps_max_sub_layers_minus1 {
        sub_layer_profile_present.push(r.read_bit() == 1);
        sub_layer_level_present.push(r.read_bit() == 1);
    }

    if sps_max_sub_layers_minus1 > 0 {
        for _ in sps_max_sub_layers_minus1..8 {
            r.skip_bits(2); // reserved_zero_2bits
        }
    }

    for i in 0..sps_max_sub_layers_minus1 as usize {
        if sub_layer_profile_present[i] {
            r.skip_bits(88); // sub_layer profile info
        }
        if sub_layer_level_present[i] {
            r.skip_bits(8); // sub_layer_level_idc
        }
    }

    r.read_ue(); // sps_seq_parameter_set_id

    let chroma_format_idc = r.read_ue();
    if chroma_format_idc == 3 {
        r.skip_bits(1); // separate_colour_plane_flag
    }

    r.read_ue(); // pic_width_in_luma_samples
    r.read_ue(); // pic_height_in_luma_samples

    if r.read_bit() == 1 {
        // conformance_window_flag
        r.read_ue();
        r.read_ue();
        r.read_ue();
        r.read_ue();
    }

    r.read_ue(); // bit_depth_luma_minus8
    r.read_ue(); // bit_depth_chroma_minus8
    r.read_ue(); // log2_max_pic_order_cnt_lsb_minus4

    let sub_layer_ordering_info_present = r.read_bit();
    let start = if sub_layer_ordering_info_present == 1 {
        0
    } else {
        sps_max_sub_layers_minus1
    };
    for _ in start..=sps_max_sub_layers_minus1 {
        r.read_ue(); // sps_max_dec_pic_buffering_minus1
        r.read_ue(); // sps_max_num_reorder_pics
        r.read_ue(); // sps_max_latency_increase_plus1
    }

    r.read_ue(); // log2_min_luma_coding_block_size_minus3
    r.read_ue(); // log2_diff_max_min_luma_coding_block_size
    r.read_ue(); // log2_min_luma_transform_block_size_minus2
    r.read_ue(); // log2_diff_max_min_luma_transform_block_size
    r.read_ue(); // max_transform_hierarchy_depth_inter
    r.read_ue(); // max_transform_hierarchy_depth_intra

    if r.read_bit() == 1 {
        // scaling_list_enabled_flag
        if r.read_bit() == 1 {
            // sps_scaling_list_data_present_flag
            skip_h265_scaling_list_data(&mut r);
        }
    }

    r.skip_bits(1); // amp_enabled_flag
    r.skip_bits(1); // sample_adaptive_offset_enabled_flag

    if r.read_bit() == 1 {
        // pcm_enabled_flag
        r.skip_bits(4); // pcm_sample_bit_depth_luma_minus1
        r.skip_bits(4); // pcm_sample_bit_depth_chroma_minus1
        r.read_ue(); // log2_min_pcm_luma_coding_block_size_minus3
        r.read_ue(); // log2_diff_max_min_pcm_luma_coding_block_size
        r.skip_bits(1); // pcm_loop_filter_disabled_flag
    }

    // Simplified short-term ref-pic-set descent: the inter-prediction
    // branch assumes a small num_delta_pocs (bounded loop). Misparses
    // fall through to the 25 fps default downstream.
    let num_short_term_ref_pic_sets = r.read_ue();
    for i in 0..num_short_term_ref_pic_sets {
        if i != 0 && r.read_bit() == 1 {
            // inter_ref_pic_set_prediction_flag
            if i == num_short_term_ref_pic_sets {
                r.read_ue(); // delta_idx_minus1
            }
            r.skip_bits(1); // delta_rps_sign
            r.read_ue(); // abs_delta_rps_minus1
            for _ in 0..16 {
                if r.read_bit() == 1 {
                    // used_by_curr_pic_flag
                    r.skip_bits(1);
                }
            }
        } else {
            let num_negative_pics = r.read_ue();
            let num_positive_pics = r.read_ue();
            for _ in 0..num_negative_pics {
                r.read_ue(); // delta_poc_s0_minus1
                r.skip_bits(1); // used_by_curr_pic_s0_flag
            }
            for _ in 0..num_positive_pics {
                r.read_ue(); // delta_poc_s1_minus1
                r.skip_bits(1); // used_by_curr_pic_s1_flag
            }
        }
    }

    if r.read_bit() == 1 {
        // long_term_ref_pics_present_flag
        let num_long_term_ref_pics_sps = r.read_ue();
        for _ in 0..num_long_term_ref_pics_sps {
            let lsb_bits = r.read_ue();
            r.skip_bits(lsb_bits + 4);
            r.skip_bits(1); // used_by_curr_pic_lt_sps_flag
        }
    }

    r.skip_bits(1); // sps_temporal_mvp_enabled_flag
    r.skip_bits(1); // strong_intra_smoothing_enabled_flag

    if r.read_bit() == 0 {
        // vui_parameters_present_flag
        return None;
    }

    // VUI prefix up to vui_timing_info_present_flag (ITU-T H.265 §E.2.1).
    if r.read_bit() == 1 {
        // aspect_ratio_info_present_flag
        let aspect_ratio_idc = r.read_bits(8);
        if aspect_ratio_idc == 255 {
            r.skip_bits(16); // sar_width
            r.skip_bits(16); // sar_height
        }
    }

    if r.read_bit() == 1 {
        // overscan_info_present_flag
        r.skip_bits(1);
    }

    if r.read_bit() == 1 {
        // video_signal_type_present_flag
        r.skip_bits(3); // video_format
        r.skip_bits(1); // video_full_range_flag
        if r.read_bit() == 1 {
            r.skip_bits(24); // primaries + transfer + matrix
        }
    }

    if r.read_bit() == 1 {
        // chroma_loc_info_present_flag
        r.read_ue();
        r.read_ue();
    }

    r.skip_bits(1); // neutral_chroma_indication_flag
    r.skip_bits(1); // field_seq_flag
    r.skip_bits(1); // frame_field_info_present_flag

    if r.read_bit() == 1 {
        // default_display_window_flag
        r.read_ue();
        r.read_ue();
        r.read_ue();
        r.read_ue();
    }

    if r.read_bit() == 0 {
        // vui_timing_info_present_flag
        return None;
    }

    let vui_num_units_in_tick = r.read_bits(32);
    let vui_time_scale = r.read_bits(32);

    if vui_num_units_in_tick == 0 || vui_time_scale == 0 {
        return None;
    }

    Some(f64::from(vui_time_scale) / f64::from(vui_num_units_in_tick))
}

fn skip_h265_scaling_list_data(r: &mut BitReader<'_>) {
    for size_id in 0..4u32 {
        let count = if size_id == 3 { 2 } else { 6 };
        for _ in 0..count {
            if r.read_bit() == 0 {
                // scaling_list_pred_mode_flag
                r.read_ue(); // scaling_list_pred_matrix_id_delta
            } else {
                let coef_num = (1u32 << (4 + (size_id << 1))).min(64);
                if size_id > 1 {
                    r.read_se(); // scaling_list_dc_coef_minus8
                }
                for _ in 0..coef_num {
                    r.read_se(); // scaling_list_delta_coef
                }
            }
        }
    }
}
