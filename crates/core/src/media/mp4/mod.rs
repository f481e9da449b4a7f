//! MP4 container demuxing.
//!
//! Extracts every video and audio sample up front, converts AVCC
//! length-prefixed video samples to Annex B, re-attaches parameter sets
//! from the decoder configuration record to each sync sample, and merges
//! both tracks into one packet list ordered by presentation time. The
//! result is what the streaming scheduler consumes; no container state
//! survives loading.

mod atoms;
mod reader;
mod sample_table;

pub use atoms::{Atom, AtomType, HandlerType, SampleCodec, TrackInfo};
pub use reader::Mp4Reader;
pub use sample_table::{SampleEntry, SampleTableBuilder};

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::{Result, StreamError};
use crate::media::{AudioInfo, Codec, MediaKind, MediaPacket, DEFAULT_FPS};

const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];

/// A fully demuxed MP4 file: interleaved packets in PTS order.
pub struct ContainerStream {
    pub packets: Vec<MediaPacket>,
    pub codec: Codec,
    pub fps: f64,
    pub audio: Option<AudioInfo>,
}

impl ContainerStream {
    /// Open and demux an MP4 file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = Mp4Reader::new(BufReader::new(file))?;

        let (video, audio) = reader.parse()?;
        let video =
            video.ok_or_else(|| StreamError::Mp4Parse("no H.264/H.265 video track".into()))?;

        let codec = match video.codec {
            Some(SampleCodec::Avc) => Codec::H264,
            Some(SampleCodec::Hevc) => Codec::H265,
            _ => return Err(StreamError::Mp4Parse("unsupported video codec".into())),
        };

        let config = video
            .codec_config
            .as_deref()
            .ok_or_else(|| StreamError::Mp4Parse("missing decoder configuration".into()))?;

        let (parameter_sets, length_size) = match codec {
            Codec::H264 => parse_avcc_config(config)?,
            Codec::H265 => parse_hvcc_config(config)?,
        };

        if video.timescale == 0 {
            return Err(StreamError::Mp4Parse("video timescale is zero".into()));
        }

        let fps = video
            .samples
            .average_delta()
            .map(|delta| f64::from(video.timescale) / delta)
            .unwrap_or(DEFAULT_FPS);

        let mut packets = Vec::new();

        for entry in video.samples.resolve() {
            let raw = reader.read_sample(entry.offset, entry.size)?;
            let mut data = if entry.is_sync {
                let mut d = parameter_sets.clone();
                d.reserve(raw.len() + 16);
                d
            } else {
                Vec::with_capacity(raw.len() + 16)
            };
            avcc_to_annex_b(&raw, length_size, &mut data);
            packets.push(MediaPacket {
                kind: MediaKind::Video,
                data,
                pts_ms: to_ms(entry.pts(), video.timescale),
            });
        }

        let audio_info = if let Some(track) = &audio {
            if track.timescale == 0 {
                return Err(StreamError::Mp4Parse("audio timescale is zero".into()));
            }
            for entry in track.samples.resolve() {
                let data = reader.read_sample(entry.offset, entry.size)?;
                packets.push(MediaPacket {
                    kind: MediaKind::Audio,
                    data,
                    pts_ms: to_ms(entry.pts(), track.timescale),
                });
            }
            Some(AudioInfo {
                codec_name: "aac".to_string(),
                sample_rate: track.sample_rate as i32,
                channels: i32::from(track.channels),
            })
        } else {
            None
        };

        if packets.is_empty() {
            return Err(StreamError::Mp4Parse("container has no samples".into()));
        }

        // Interleave tracks by presentation time. The sort is stable, so
        // video stays ahead of audio at equal timestamps.
        packets.sort_by_key(|p| p.pts_ms);

        Ok(ContainerStream {
            packets,
            codec,
            fps,
            audio: audio_info,
        })
    }
}

fn to_ms(pts: i64, timescale: u32) -> i64 {
    (pts as f64 * 1000.0 / f64::from(timescale)) as i64
}

/// Parse an avcC record: parameter sets as an Annex B prefix plus the
/// NAL length-prefix size (ISO/IEC 14496-15 §5.2.4.1).
fn parse_avcc_config(config: &[u8]) -> Result<(Vec<u8>, usize)> {
    if config.len() < 7 {
        return Err(StreamError::Mp4Parse("avcC record too short".into()));
    }

    let length_size = (config[4] & 0x03) as usize + 1;
    let mut out = Vec::new();
    let mut pos = 5usize;

    let num_sps = (config[pos] & 0x1F) as usize;
    pos += 1;
    pos = copy_param_sets(config, pos, num_sps, &mut out)?;

    if pos >= config.len() {
        return Err(StreamError::Mp4Parse("avcC record truncated".into()));
    }
    let num_pps = config[pos] as usize;
    pos += 1;
    copy_param_sets(config, pos, num_pps, &mut out)?;

    Ok((out, length_size))
}

/// Parse an hvcC record: VPS/SPS/PPS arrays plus the NAL length-prefix
/// size (ISO/IEC 14496-15 §8.3.3.1).
fn parse_hvcc_config(config: &[u8]) -> Result<(Vec<u8>, usize)> {
    if config.len() < 23 {
        return Err(StreamError::Mp4Parse("hvcC record too short".into()));
    }

    let length_size = (config[21] & 0x03) as usize + 1;
    let num_arrays = config[22] as usize;
    let mut out = Vec::new();
    let mut pos = 23usize;

    for _ in 0..num_arrays {
        if pos + 3 > config.len() {
            return Err(StreamError::Mp4Parse("hvcC record truncated".into()));
        }
        let num_nalus = u16::from_be_bytes([config[pos + 1], config[pos + 2]]) as usize;
        pos += 3;
        pos = copy_param_sets(config, pos, num_nalus, &mut out)?;
    }

    Ok((out, length_size))
}

/// Copy `count` length-prefixed parameter sets as Annex B units.
fn copy_param_sets(
    config: &[u8],
    mut pos: usize,
    count: usize,
    out: &mut Vec<u8>,
) -> Result<usize> {
    for _ in 0..count {
        if pos + 2 > config.len() {
            return Err(StreamError::Mp4Parse("parameter set truncated".into()));
        }
        let len = u16::from_be_bytes([config[pos], config[pos + 1]]) as usize;
        pos += 2;
        if pos + len > config.len() {
            return Err(StreamError::Mp4Parse("parameter set truncated".into()));
        }
        out.extend_from_slice(&ANNEX_B_START_CODE);
        out.extend_from_slice(&config[pos..pos + len]);
        pos += len;
    }
    Ok(pos)
}

/// Rewrite AVCC length prefixes as Annex B start codes.
///
/// Bounds faults in the length fields terminate the walk; whatever was
/// converted so far is kept (matching a lenient demuxer rather than
/// rejecting the whole sample).
fn avcc_to_annex_b(sample: &[u8], length_size: usize, out: &mut Vec<u8>) {
    let mut pos = 0usize;
    while pos + length_size <= sample.len() {
        let mut len = 0usize;
        for &b in &sample[pos..pos + length_size] {
            len = (len << 8) | b as usize;
        }
        pos += length_size;
        if len == 0 || pos + len > sample.len() {
            break;
        }
        out.extend_from_slice(&ANNEX_B_START_CODE);
        out.extend_from_slice(&sample[pos..pos + len]);
        pos += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avcc_conversion_single_nal() {
        let sample = [0, 0, 0, 3, 0x65, 0xAA, 0xBB];
        let mut out = Vec::new();
        avcc_to_annex_b(&sample, 4, &mut out);
        assert_eq!(out, vec![0, 0, 0, 1, 0x65, 0xAA, 0xBB]);
    }

    #[test]
    fn avcc_conversion_multiple_nals() {
        let sample = [0, 0, 0, 2, 0x67, 0x42, 0, 0, 0, 1, 0x68];
        let mut out = Vec::new();
        avcc_to_annex_b(&sample, 4, &mut out);
        assert_eq!(out, vec![0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68]);
    }

    #[test]
    fn avcc_conversion_two_byte_lengths() {
        let sample = [0, 3, 0x65, 0xAA, 0xBB];
        let mut out = Vec::new();
        avcc_to_annex_b(&sample, 2, &mut out);
        assert_eq!(out, vec![0, 0, 0, 1, 0x65, 0xAA, 0xBB]);
    }

    #[test]
    fn avcc_conversion_stops_on_bad_length() {
        let sample = [0, 0, 0, 200, 0x65];
        let mut out = Vec::new();
        avcc_to_annex_b(&sample, 4, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn avcc_config_extracts_sps_pps() {
        // version/profile/compat/level, lengthSizeMinusOne=3, 1 SPS, 1 PPS
        let config = [
            1, 66, 0, 30, 0xFF, 0xE1, // 1 SPS
            0, 3, 0x67, 0x42, 0x00, // SPS bytes
            1, // 1 PPS
            0, 2, 0x68, 0xCE, // PPS bytes
        ];
        let (sets, length_size) = parse_avcc_config(&config).unwrap();
        assert_eq!(length_size, 4);
        assert_eq!(
            sets,
            vec![0, 0, 0, 1, 0x67, 0x42, 0x00, 0, 0, 0, 1, 0x68, 0xCE]
        );
    }

    #[test]
    fn avcc_config_truncated_fails() {
        let config = [1, 66, 0, 30, 0xFF, 0xE1, 0, 10, 0x67];
        assert!(parse_avcc_config(&config).is_err());
    }

    #[test]
    fn hvcc_config_extracts_arrays() {
        let mut config = vec![0u8; 21];
        config[0] = 1;
        config.push(0x03); // lengthSizeMinusOne = 3
        config.push(2); // two arrays
        // VPS array: type 32, one NALU of 2 bytes
        config.extend_from_slice(&[0xA0, 0, 1, 0, 2, 0x40, 0x01]);
        // SPS array: type 33, one NALU of 2 bytes
        config.extend_from_slice(&[0xA1, 0, 1, 0, 2, 0x42, 0x01]);
        let (sets, length_size) = parse_hvcc_config(&config).unwrap();
        assert_eq!(length_size, 4);
        assert_eq!(
            sets,
            vec![0, 0, 0, 1, 0x40, 0x01, 0, 0, 0, 1, 0x42, 0x01]
        );
    }

    #[test]
    fn to_ms_scales_by_timescale() {
        assert_eq!(to_ms(90000, 90000), 1000);
        assert_eq!(to_ms(3600, 90000), 40);
        assert_eq!(to_ms(0, 90000), 0);
    }
}
