//! Application frame protocol: the length-delimited binary framing that
//! carries access units and audio packets over the WebSocket transport.
//!
//! ## Wire layout
//!
//! Every frame starts with a 20-byte fixed header (big-endian):
//!
//! ```text
//! | magic 0xEB01 (2) | version (1) | msg_type (1) | flags (1) |
//! | timestamp ms, signed (8) | ext_length (1) | payload_length (4) |
//! | reserved (2) |
//! ```
//!
//! Extension headers follow in fixed order, each present only when its
//! flag bit is set:
//!
//! 1. **Fragment ext** (6 B, `FLAG_FRAGMENT`):
//!    `frame_id u16 | fragment_index u16 | total_fragments u16`
//! 2. **Common ext** (variable, `FLAG_HAS_COMMON`): self-describing
//!    `common_length u8 (inclusive) | common_flags u8 | fields...` —
//!    fields appear in increasing flag-bit order; only `COMMON_ABS_TIME`
//!    (8-byte absolute ms timestamp) is defined today.
//! 3. **Type-specific ext**: video `codec(1) | frame_type(1) |
//!    resolution(2)`; audio `codec(1) | sample_rate_code(1) |
//!    channels(1) | reserved(1)`.
//!
//! Payloads above [`FRAGMENT_THRESHOLD`] are split into fragments sharing
//! one `frame_id`; only fragment 0 carries the common and type-specific
//! extensions. See [`encoder`] and [`decoder`].

pub mod decoder;
pub mod encoder;
pub mod negotiation;

/// Frame magic number.
pub const PROTOCOL_MAGIC: u16 = 0xEB01;

/// Protocol version emitted and accepted.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes.
pub const FIXED_HEADER_SIZE: usize = 20;

/// Maximum payload bytes per wire frame; larger payloads fragment.
pub const FRAGMENT_THRESHOLD: usize = 16384;

/// Fragment extension header size.
pub const FRAGMENT_EXT_SIZE: usize = 6;

/// Common extension header size as currently emitted
/// (length + flags + abs_time).
pub const COMMON_EXT_SIZE: usize = 10;

/// Video extension header size.
pub const VIDEO_EXT_SIZE: usize = 4;

/// Audio extension header size.
pub const AUDIO_EXT_SIZE: usize = 4;

/// Upper bound on fragments per frame accepted by the decoder.
pub const MAX_FRAGMENTS: u16 = 256;

/// Reassembly table capacity; the oldest entry is evicted beyond this.
pub const MAX_REASSEMBLY_ENTRIES: usize = 16;

/// Age after which an incomplete reassembly entry may be collected.
pub const FRAGMENT_TIMEOUT_MS: u64 = 500;

/// flags bit 0: frame is one fragment of a larger payload.
pub const FLAG_FRAGMENT: u8 = 0x01;
/// flags bit 1: payload is encrypted (reserved, never emitted).
pub const FLAG_ENCRYPTED: u8 = 0x02;
/// flags bit 2: payload is compressed (reserved, never emitted).
pub const FLAG_COMPRESSED: u8 = 0x04;
/// flags bit 3: common extension header present.
pub const FLAG_HAS_COMMON: u8 = 0x08;

/// common_flags bit 0: 8-byte absolute ms timestamp present.
pub const COMMON_ABS_TIME: u8 = 0x01;
/// common_flags bit 1: 4-byte watermark id (reserved, never emitted).
pub const COMMON_WATERMARK: u8 = 0x02;
/// common_flags bit 2: 4-byte sequence number (reserved, never emitted).
pub const COMMON_SEQ_NUMBER: u8 = 0x04;

/// Message type in the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Video = 1,
    Audio = 2,
    Image = 3,
    Metadata = 4,
    Control = 5,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => MsgType::Video,
            2 => MsgType::Audio,
            3 => MsgType::Image,
            4 => MsgType::Metadata,
            5 => MsgType::Control,
            _ => return None,
        })
    }
}

/// Video codec id in the video extension header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VideoCodec {
    H264 = 1,
    H265 = 2,
    Mjpeg = 3,
}

impl From<crate::media::Codec> for VideoCodec {
    fn from(codec: crate::media::Codec) -> Self {
        match codec {
            crate::media::Codec::H264 => VideoCodec::H264,
            crate::media::Codec::H265 => VideoCodec::H265,
        }
    }
}

/// Video frame type in the video extension header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VideoFrameType {
    Idr = 1,
    IFrame = 2,
    PFrame = 3,
    BFrame = 4,
    SpsPps = 5,
    Vps = 6,
}

/// Audio codec id in the audio extension header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AudioCodec {
    G711A = 1,
    G711U = 2,
    G726 = 3,
    Aac = 4,
}

impl AudioCodec {
    /// Map a container codec name ("pcm_alaw", "aac", ...) to its wire id.
    /// Unknown names fall back to AAC, the most common container codec.
    pub fn from_name(name: &str) -> Self {
        match name {
            "pcm_alaw" => AudioCodec::G711A,
            "pcm_mulaw" => AudioCodec::G711U,
            "g726" => AudioCodec::G726,
            _ => AudioCodec::Aac,
        }
    }
}

/// Sample-rate code in the audio extension header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SampleRateCode {
    Rate8000 = 1,
    Rate16000 = 2,
    Rate44100 = 3,
    Rate48000 = 4,
}

impl SampleRateCode {
    /// Encode a sample rate in Hz. Unlisted rates fall back to 8 kHz.
    pub fn from_rate(rate: i32) -> Self {
        match rate {
            16000 => SampleRateCode::Rate16000,
            44100 => SampleRateCode::Rate44100,
            48000 => SampleRateCode::Rate48000,
            _ => SampleRateCode::Rate8000,
        }
    }
}

/// Frame codec failures. Each one drops the offending frame; the
/// connection (and the reassembly table, unless stated) survive.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes than the fixed header.
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    /// First two bytes are not the protocol magic.
    #[error("bad magic: {0:#06x}")]
    BadMagic(u16),

    /// Frame shorter than its declared ext_length + payload_length.
    #[error("frame truncated: have {have} bytes, header declares {need}")]
    Truncated { have: usize, need: usize },

    /// total_fragments outside [1, 256].
    #[error("invalid fragment count: {0}")]
    BadFragmentCount(u16),
}
