//! Frame encoding and fragmentation.
//!
//! The encoder is stateless: the caller supplies the monotonic `frame_id`
//! (wrapping at 2^16) that binds fragments of one payload together.
//! Payloads at or below [`FRAGMENT_THRESHOLD`] become a single frame;
//! larger payloads split into threshold-sized chunks, where only fragment
//! 0 carries the common and type-specific extension headers.

use super::{
    AudioCodec, MsgType, SampleRateCode, VideoCodec, VideoFrameType, COMMON_ABS_TIME,
    COMMON_EXT_SIZE, FIXED_HEADER_SIZE, FLAG_FRAGMENT, FLAG_HAS_COMMON, FRAGMENT_EXT_SIZE,
    FRAGMENT_THRESHOLD, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};

/// Type-specific extension header content.
#[derive(Debug, Clone, Copy)]
enum TypeExt {
    Video {
        codec: VideoCodec,
        frame_type: VideoFrameType,
    },
    Audio {
        codec: AudioCodec,
        sample_rate: SampleRateCode,
        channels: u8,
    },
}

impl TypeExt {
    fn size(&self) -> usize {
        match self {
            TypeExt::Video { .. } => super::VIDEO_EXT_SIZE,
            TypeExt::Audio { .. } => super::AUDIO_EXT_SIZE,
        }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        match *self {
            TypeExt::Video { codec, frame_type } => {
                buf.push(codec as u8);
                buf.push(frame_type as u8);
                // resolution: 0 = described in SPS
                buf.extend_from_slice(&0u16.to_be_bytes());
            }
            TypeExt::Audio {
                codec,
                sample_rate,
                channels,
            } => {
                buf.push(codec as u8);
                buf.push(sample_rate as u8);
                buf.push(channels);
                buf.push(0); // reserved
            }
        }
    }
}

/// Encode a video access unit into one or more wire frames.
pub fn encode_video_frame(
    payload: &[u8],
    codec: VideoCodec,
    frame_type: VideoFrameType,
    timestamp_ms: i64,
    abs_time_ms: i64,
    frame_id: u16,
) -> Vec<Vec<u8>> {
    encode(
        payload,
        MsgType::Video,
        TypeExt::Video { codec, frame_type },
        timestamp_ms,
        abs_time_ms,
        frame_id,
    )
}

/// Encode an audio packet into one or more wire frames.
///
/// Audio payloads never exceed the threshold in practice, but the
/// fragmentation contract is identical to video.
pub fn encode_audio_frame(
    payload: &[u8],
    codec: AudioCodec,
    sample_rate: SampleRateCode,
    channels: u8,
    timestamp_ms: i64,
    abs_time_ms: i64,
    frame_id: u16,
) -> Vec<Vec<u8>> {
    encode(
        payload,
        MsgType::Audio,
        TypeExt::Audio {
            codec,
            sample_rate,
            channels,
        },
        timestamp_ms,
        abs_time_ms,
        frame_id,
    )
}

fn encode(
    payload: &[u8],
    msg_type: MsgType,
    type_ext: TypeExt,
    timestamp_ms: i64,
    abs_time_ms: i64,
    frame_id: u16,
) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();

    if payload.len() <= FRAGMENT_THRESHOLD {
        let ext_length = COMMON_EXT_SIZE + type_ext.size();
        let mut frame = Vec::with_capacity(FIXED_HEADER_SIZE + ext_length + payload.len());

        write_fixed_header(
            &mut frame,
            msg_type,
            FLAG_HAS_COMMON,
            timestamp_ms,
            ext_length as u8,
            payload.len() as u32,
        );
        write_common_ext(&mut frame, abs_time_ms);
        type_ext.write(&mut frame);
        frame.extend_from_slice(payload);

        frames.push(frame);
        return frames;
    }

    let total_fragments = payload.len().div_ceil(FRAGMENT_THRESHOLD) as u16;

    for index in 0..total_fragments {
        let offset = usize::from(index) * FRAGMENT_THRESHOLD;
        let chunk = &payload[offset..(offset + FRAGMENT_THRESHOLD).min(payload.len())];

        let (flags, ext_length) = if index == 0 {
            (
                FLAG_FRAGMENT | FLAG_HAS_COMMON,
                FRAGMENT_EXT_SIZE + COMMON_EXT_SIZE + type_ext.size(),
            )
        } else {
            (FLAG_FRAGMENT, FRAGMENT_EXT_SIZE)
        };

        let mut frame = Vec::with_capacity(FIXED_HEADER_SIZE + ext_length + chunk.len());
        write_fixed_header(
            &mut frame,
            msg_type,
            flags,
            timestamp_ms,
            ext_length as u8,
            chunk.len() as u32,
        );
        write_fragment_ext(&mut frame, frame_id, index, total_fragments);
        if index == 0 {
            write_common_ext(&mut frame, abs_time_ms);
            type_ext.write(&mut frame);
        }
        frame.extend_from_slice(chunk);

        frames.push(frame);
    }

    frames
}

fn write_fixed_header(
    buf: &mut Vec<u8>,
    msg_type: MsgType,
    flags: u8,
    timestamp_ms: i64,
    ext_length: u8,
    payload_length: u32,
) {
    buf.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    buf.push(PROTOCOL_VERSION);
    buf.push(msg_type as u8);
    buf.push(flags);
    buf.extend_from_slice(&timestamp_ms.to_be_bytes());
    buf.push(ext_length);
    buf.extend_from_slice(&payload_length.to_be_bytes());
    buf.extend_from_slice(&[0, 0]); // reserved
}

fn write_common_ext(buf: &mut Vec<u8>, abs_time_ms: i64) {
    buf.push(COMMON_EXT_SIZE as u8); // inclusive length
    buf.push(COMMON_ABS_TIME);
    buf.extend_from_slice(&abs_time_ms.to_be_bytes());
}

fn write_fragment_ext(buf: &mut Vec<u8>, frame_id: u16, index: u16, total: u16) {
    buf.extend_from_slice(&frame_id.to_be_bytes());
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(&total.to_be_bytes());
}
