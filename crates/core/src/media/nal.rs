//! NAL unit segmentation and access-unit grouping for Annex B bitstreams.
//!
//! A raw H.264/H.265 elementary stream is a flat sequence of NAL units
//! delimited by start codes (`00 00 01` or `00 00 00 01`). Streaming works
//! in access units — the NALs making up one decoded picture plus the
//! parameter sets attached to it — so the loader segments the file once at
//! startup and groups the units by the boundary rules of
//! ITU-T H.264 §7.4.1.2.3 / H.265 §7.4.2.4.4 (AUD-delimited, or a new VCL
//! NAL while the current unit already holds one).

use std::path::Path;

use crate::error::{Result, StreamError};
use crate::media::{sps, Codec, DEFAULT_FPS};

/// H.264 NAL unit types used by the grouper (ITU-T H.264 Table 7-1).
const H264_NAL_SLICE: u8 = 1;
const H264_NAL_IDR: u8 = 5;
const H264_NAL_SPS: u8 = 7;
const H264_NAL_AUD: u8 = 9;

/// H.265 NAL unit types used by the grouper (ITU-T H.265 Table 7-1).
const H265_NAL_VCL_MAX: u8 = 31;
const H265_NAL_SPS: u8 = 33;
const H265_NAL_AUD: u8 = 35;

/// One NAL unit, start code included. Immutable after parse.
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub data: Vec<u8>,
}

impl NalUnit {
    /// Length of the leading start code (3 or 4), or 0 if absent.
    pub fn start_code_len(&self) -> usize {
        let d = &self.data;
        if d.len() >= 4 && d[0] == 0 && d[1] == 0 {
            if d[2] == 0 && d[3] == 1 {
                return 4;
            }
            if d[2] == 1 {
                return 3;
            }
        }
        0
    }

    /// NAL unit type, decoded from the byte after the start code.
    /// Returns `None` when the unit has no start code or is truncated.
    pub fn nal_type(&self, codec: Codec) -> Option<u8> {
        let offset = self.start_code_len();
        if offset == 0 || offset >= self.data.len() {
            return None;
        }
        let header = self.data[offset];
        Some(match codec {
            Codec::H264 => header & 0x1F,
            Codec::H265 => (header >> 1) & 0x3F,
        })
    }
}

/// An access unit: the ordered NAL units of a single picture plus any
/// parameter sets attached to it. Immutable after grouping.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub nal_units: Vec<NalUnit>,
}

impl AccessUnit {
    /// Concatenate all NAL units (start codes included) into the payload
    /// that goes on the wire.
    pub fn merged_payload(&self) -> Vec<u8> {
        let total: usize = self.nal_units.iter().map(|n| n.data.len()).sum();
        let mut payload = Vec::with_capacity(total);
        for nal in &self.nal_units {
            payload.extend_from_slice(&nal.data);
        }
        payload
    }
}

/// Scan a buffer for start codes and split it into NAL units.
///
/// Start codes stay inside the units, so concatenating the result
/// reproduces the input byte for byte. A 3-byte start code is only
/// recognized when it is not the tail of a 4-byte one.
pub fn segment_nal_units(buffer: &[u8]) -> Vec<NalUnit> {
    let mut nal_units = Vec::new();

    if buffer.len() < 4 {
        return nal_units;
    }

    let mut start = 0usize;
    let mut first_found = false;

    let mut i = 0usize;
    while i < buffer.len() - 3 {
        let is_4byte =
            buffer[i] == 0 && buffer[i + 1] == 0 && buffer[i + 2] == 0 && buffer[i + 3] == 1;
        let is_3byte =
            !is_4byte && i > 0 && buffer[i] == 0 && buffer[i + 1] == 0 && buffer[i + 2] == 1;

        if is_4byte || is_3byte {
            if first_found {
                nal_units.push(NalUnit {
                    data: buffer[start..i].to_vec(),
                });
            }
            start = i;
            first_found = true;
            i += if is_4byte { 4 } else { 3 };
        } else {
            i += 1;
        }
    }

    if first_found && start < buffer.len() {
        nal_units.push(NalUnit {
            data: buffer[start..].to_vec(),
        });
    }

    nal_units
}

fn is_vcl(nal_type: u8, codec: Codec) -> bool {
    match codec {
        Codec::H264 => nal_type == H264_NAL_SLICE || nal_type == H264_NAL_IDR,
        Codec::H265 => nal_type <= H265_NAL_VCL_MAX,
    }
}

/// Group NAL units into access units.
///
/// An AU boundary occurs immediately before an access-unit delimiter, or
/// before a VCL NAL when the unit under construction already contains one.
/// Non-VCL NALs (SPS, PPS, VPS, SEI) attach to the AU that starts after
/// them; the final AU is emitted at end of input.
pub fn group_access_units(nal_units: Vec<NalUnit>, codec: Codec) -> Vec<AccessUnit> {
    let aud_type = match codec {
        Codec::H264 => H264_NAL_AUD,
        Codec::H265 => H265_NAL_AUD,
    };

    let mut access_units = Vec::new();
    let mut current = AccessUnit {
        nal_units: Vec::new(),
    };

    for nal in nal_units {
        let nal_type = nal.nal_type(codec);

        let starts_new = match nal_type {
            Some(t) if t == aud_type => true,
            Some(t) if is_vcl(t, codec) => current
                .nal_units
                .iter()
                .any(|n| n.nal_type(codec).is_some_and(|t| is_vcl(t, codec))),
            _ => false,
        };

        if starts_new && !current.nal_units.is_empty() {
            access_units.push(std::mem::replace(
                &mut current,
                AccessUnit {
                    nal_units: Vec::new(),
                },
            ));
        }

        current.nal_units.push(nal);
    }

    if !current.nal_units.is_empty() {
        access_units.push(current);
    }

    access_units
}

/// A raw Annex B elementary stream, pre-grouped into access units.
pub struct RawStream {
    pub access_units: Vec<AccessUnit>,
    pub codec: Codec,
    pub fps: f64,
}

impl RawStream {
    /// Read and segment a raw bitstream file, extracting the frame rate
    /// from the first SPS encountered (25 fps when none is present).
    pub fn load(path: &Path, codec: Codec) -> Result<Self> {
        let buffer = std::fs::read(path).map_err(|e| StreamError::MediaLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let nal_units = segment_nal_units(&buffer);
        if nal_units.is_empty() {
            return Err(StreamError::MediaLoad {
                path: path.display().to_string(),
                reason: "no NAL units found (not an Annex B bitstream?)".into(),
            });
        }

        let sps_type = match codec {
            Codec::H264 => H264_NAL_SPS,
            Codec::H265 => H265_NAL_SPS,
        };

        let fps = nal_units
            .iter()
            .find(|nal| nal.nal_type(codec) == Some(sps_type))
            .map(|nal| match codec {
                Codec::H264 => sps::parse_h264_fps(&nal.data),
                Codec::H265 => sps::parse_h265_fps(&nal.data),
            })
            .unwrap_or(DEFAULT_FPS);

        let nal_count = nal_units.len();
        let access_units = group_access_units(nal_units, codec);

        tracing::info!(
            path = %path.display(),
            codec = codec.name(),
            nal_units = nal_count,
            access_units = access_units.len(),
            fps,
            bytes = buffer.len(),
            "loaded raw bitstream"
        );

        Ok(RawStream {
            access_units,
            codec,
            fps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn nal(bytes: &[u8]) -> Vec<u8> {
        let mut v = vec![0, 0, 0, 1];
        v.extend_from_slice(bytes);
        v
    }

    #[test]
    fn segment_single_unit() {
        let data = nal(&[0x65, 0xAA, 0xBB]);
        let units = segment_nal_units(&data);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].data, data);
    }

    #[test]
    fn segment_two_units_4byte() {
        let mut data = nal(&[0x67, 0x42]);
        data.extend_from_slice(&nal(&[0x68, 0xCE]));
        let units = segment_nal_units(&data);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].data, nal(&[0x67, 0x42]));
        assert_eq!(units[1].data, nal(&[0x68, 0xCE]));
    }

    #[test]
    fn segment_mixed_start_codes() {
        let mut data = nal(&[0x67, 0x42]);
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let units = segment_nal_units(&data);
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].data, vec![0, 0, 1, 0x68, 0xCE]);
    }

    #[test]
    fn segment_preserves_start_codes_on_concat() {
        let mut data = nal(&[0x67, 0x42, 0x80]);
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        data.extend_from_slice(&nal(&[0x65, 0x11, 0x22, 0x33]));
        let units = segment_nal_units(&data);
        let rejoined: Vec<u8> = units.iter().flat_map(|u| u.data.clone()).collect();
        assert_eq!(rejoined, data);
    }

    #[test]
    fn segment_empty_and_garbage() {
        assert!(segment_nal_units(&[]).is_empty());
        assert!(segment_nal_units(&[0xFF, 0xFE, 0xFD]).is_empty());
        assert!(segment_nal_units(&[0xFF; 64]).is_empty());
    }

    #[test]
    fn nal_type_h264() {
        let unit = NalUnit {
            data: nal(&[0x65, 0x00]),
        };
        assert_eq!(unit.nal_type(Codec::H264), Some(5));
        let unit = NalUnit {
            data: vec![0, 0, 1, 0x67],
        };
        assert_eq!(unit.nal_type(Codec::H264), Some(7));
    }

    #[test]
    fn nal_type_h265() {
        // SPS: type 33 -> header byte (33 << 1) = 0x42
        let unit = NalUnit {
            data: nal(&[0x42, 0x01]),
        };
        assert_eq!(unit.nal_type(Codec::H265), Some(33));
    }

    #[test]
    fn nal_type_missing_start_code() {
        let unit = NalUnit {
            data: vec![0x65, 0x00],
        };
        assert_eq!(unit.nal_type(Codec::H264), None);
    }

    fn units_h264(types: &[u8]) -> Vec<NalUnit> {
        types
            .iter()
            .map(|&t| NalUnit {
                data: nal(&[t, 0x00]),
            })
            .collect()
    }

    #[test]
    fn group_sps_pps_attach_to_following_idr() {
        // SPS PPS IDR | slice | slice
        let units = units_h264(&[7, 8, 5, 1, 1]);
        let aus = group_access_units(units, Codec::H264);
        assert_eq!(aus.len(), 3);
        assert_eq!(aus[0].nal_units.len(), 3);
        assert_eq!(aus[1].nal_units.len(), 1);
        assert_eq!(aus[2].nal_units.len(), 1);
    }

    #[test]
    fn group_aud_always_starts_new_au() {
        // AUD slice | AUD slice
        let units = units_h264(&[9, 1, 9, 1]);
        let aus = group_access_units(units, Codec::H264);
        assert_eq!(aus.len(), 2);
        assert_eq!(aus[0].nal_units.len(), 2);
        assert_eq!(aus[1].nal_units.len(), 2);
    }

    #[test]
    fn group_sei_between_frames_attaches_forward() {
        // slice | SEI slice -> SEI belongs to the second AU
        let units = units_h264(&[1, 6, 1]);
        let aus = group_access_units(units, Codec::H264);
        assert_eq!(aus.len(), 2);
        assert_eq!(aus[1].nal_units.len(), 2);
        assert_eq!(aus[1].nal_units[0].nal_type(Codec::H264), Some(6));
    }

    #[test]
    fn group_h265_vcl_boundary() {
        // VPS(32) SPS(33) PPS(34) IDR(19) | TRAIL_R(1)
        let types: Vec<u8> = vec![32, 33, 34, 19, 1];
        let units: Vec<NalUnit> = types
            .iter()
            .map(|&t| NalUnit {
                data: nal(&[t << 1, 0x01]),
            })
            .collect();
        let aus = group_access_units(units, Codec::H265);
        assert_eq!(aus.len(), 2);
        assert_eq!(aus[0].nal_units.len(), 4);
    }

    #[test]
    fn merged_payload_concatenates_in_order() {
        let units = units_h264(&[7, 8, 5]);
        let aus = group_access_units(units, Codec::H264);
        let payload = aus[0].merged_payload();
        let expected: Vec<u8> = [7u8, 8, 5]
            .iter()
            .flat_map(|&t| nal(&[t, 0x00]))
            .collect();
        assert_eq!(payload, expected);
    }

    proptest! {
        #[test]
        fn proptest_segmentation_roundtrip(
            payloads in proptest::collection::vec(
                // Payload bytes in 0x80..=0xFF can never form a start code.
                proptest::collection::vec(0x80u8..=0xFF, 1..24),
                1..16,
            ),
            four_byte in proptest::collection::vec(any::<bool>(), 16),
        ) {
            let mut data = Vec::new();
            for (i, p) in payloads.iter().enumerate() {
                // First start code must begin the buffer; the segmenter
                // recognizes 3-byte codes only at i > 0.
                if four_byte[i % four_byte.len()] || i == 0 {
                    data.extend_from_slice(&[0, 0, 0, 1]);
                } else {
                    data.extend_from_slice(&[0, 0, 1]);
                }
                data.extend_from_slice(p);
            }

            let units = segment_nal_units(&data);
            prop_assert_eq!(units.len(), payloads.len());
            let rejoined: Vec<u8> = units.iter().flat_map(|u| u.data.clone()).collect();
            prop_assert_eq!(rejoined, data);
        }
    }
}
