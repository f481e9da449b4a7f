//! Frame parsing and fragment reassembly.
//!
//! The decoder validates in a fixed order — size, magic, version,
//! declared lengths — then parses extension headers strictly in
//! fragment / common / type-specific order. Unknown common-ext fields are
//! skipped via the self-describing `common_length`, and unknown
//! type-specific tail bytes are ignored, so frames from newer peers still
//! parse. A frame with an unknown *version* is skipped silently without
//! touching the reassembly table.
//!
//! Fragmented frames accumulate in a bounded table keyed by `frame_id`.
//! When the table is full the oldest entry (insertion order) is evicted
//! to make room. Metadata comes from fragment 0 whenever it arrives;
//! duplicates are idempotent; completion concatenates chunks in index
//! order and frees the entry.

use std::time::{Duration, Instant};

use super::{
    MsgType, ProtocolError, COMMON_ABS_TIME, FIXED_HEADER_SIZE, FLAG_FRAGMENT, FLAG_HAS_COMMON,
    FRAGMENT_EXT_SIZE, FRAGMENT_TIMEOUT_MS, MAX_FRAGMENTS, MAX_REASSEMBLY_ENTRIES, PROTOCOL_MAGIC,
    PROTOCOL_VERSION,
};

/// Codec/stream metadata from the type-specific extension header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMeta {
    /// Video codec id, 0 when absent.
    pub video_codec: u8,
    /// Video frame type id, 0 when absent.
    pub video_frame_type: u8,
    /// Encoded resolution, 0 = described in SPS.
    pub video_resolution: u16,
    /// Audio codec id, 0 when absent.
    pub audio_codec: u8,
    /// Audio sample-rate code, 0 when absent.
    pub audio_sample_rate: u8,
    /// Audio channel count, 0 when absent.
    pub audio_channels: u8,
}

/// A fully parsed (and, if fragmented, reassembled) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub msg_type: u8,
    /// Relative timestamp from the fixed header, milliseconds.
    pub timestamp: i64,
    /// Absolute wall-clock milliseconds from the common ext (0 if absent).
    pub abs_time: i64,
    pub meta: FrameMeta,
    pub payload: Vec<u8>,
}

/// Outcome of feeding one wire frame to the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A complete payload is available.
    Complete(ParsedFrame),
    /// The frame was a fragment; more are needed.
    FragmentPending,
    /// Unknown protocol version — frame dropped silently.
    Skip,
}

fn be32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn be64(data: &[u8], at: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    i64::from_be_bytes(bytes)
}

/// Fields lifted out of the extension headers.
#[derive(Debug, Default, Clone, Copy)]
struct ExtHeaders {
    frame_id: u16,
    fragment_index: u16,
    total_fragments: u16,
    abs_time: i64,
    meta: FrameMeta,
}

struct ReassemblyEntry {
    frame_id: u16,
    total_fragments: u16,
    received: u16,
    /// `chunks[i].is_some()` ⇔ fragment i has arrived.
    chunks: Vec<Option<Vec<u8>>>,
    /// Metadata adopted from fragment 0 (whenever it arrives).
    msg_type: u8,
    timestamp: i64,
    abs_time: i64,
    meta: FrameMeta,
    first_fragment_at: Instant,
}

/// Wire-frame parser with a bounded fragment reassembly table.
///
/// One decoder per stream; the table never crosses thread boundaries.
pub struct FrameDecoder {
    entries: Vec<ReassemblyEntry>,
    max_entries: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            max_entries: MAX_REASSEMBLY_ENTRIES,
        }
    }

    /// Number of live reassembly entries.
    pub fn pending_entries(&self) -> usize {
        self.entries.len()
    }

    /// Parse one wire frame.
    ///
    /// Validation order (each fatal): size ≥ fixed header, magic, version
    /// (unknown → [`ParseOutcome::Skip`], not an error), declared length.
    pub fn parse(&mut self, data: &[u8]) -> Result<ParseOutcome, ProtocolError> {
        if data.len() < FIXED_HEADER_SIZE {
            return Err(ProtocolError::TooShort(data.len()));
        }

        let magic = u16::from_be_bytes([data[0], data[1]]);
        if magic != PROTOCOL_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }

        if data[2] != PROTOCOL_VERSION {
            tracing::debug!(version = data[2], "skipping frame with unknown version");
            return Ok(ParseOutcome::Skip);
        }

        let msg_type = data[3];
        let flags = data[4];
        let timestamp = be64(data, 5);
        let ext_length = data[13] as usize;
        let payload_length = be32(data, 14) as usize;

        let need = FIXED_HEADER_SIZE + ext_length + payload_length;
        if data.len() < need {
            return Err(ProtocolError::Truncated {
                have: data.len(),
                need,
            });
        }

        let ext = parse_ext_headers(
            &data[FIXED_HEADER_SIZE..FIXED_HEADER_SIZE + ext_length],
            flags,
            msg_type,
        );
        let payload = &data[FIXED_HEADER_SIZE + ext_length..need];

        if flags & FLAG_FRAGMENT == 0 {
            return Ok(ParseOutcome::Complete(ParsedFrame {
                msg_type,
                timestamp,
                abs_time: ext.abs_time,
                meta: ext.meta,
                payload: payload.to_vec(),
            }));
        }

        if ext.total_fragments == 0 || ext.total_fragments > MAX_FRAGMENTS {
            return Err(ProtocolError::BadFragmentCount(ext.total_fragments));
        }

        self.accept_fragment(msg_type, timestamp, &ext, payload)
    }

    fn accept_fragment(
        &mut self,
        msg_type: u8,
        timestamp: i64,
        ext: &ExtHeaders,
        payload: &[u8],
    ) -> Result<ParseOutcome, ProtocolError> {
        let index = match self
            .entries
            .iter()
            .position(|e| e.frame_id == ext.frame_id)
        {
            Some(i) => i,
            None => {
                if self.entries.len() >= self.max_entries {
                    let evicted = self.entries.remove(0);
                    tracing::warn!(
                        frame_id = evicted.frame_id,
                        received = evicted.received,
                        total = evicted.total_fragments,
                        "reassembly table full, evicting oldest entry"
                    );
                }
                self.entries.push(ReassemblyEntry {
                    frame_id: ext.frame_id,
                    total_fragments: ext.total_fragments,
                    received: 0,
                    chunks: vec![None; usize::from(ext.total_fragments)],
                    msg_type: 0,
                    timestamp: 0,
                    abs_time: 0,
                    meta: FrameMeta::default(),
                    first_fragment_at: Instant::now(),
                });
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[index];

        // Fragment 0 defines the completed frame's metadata, whenever
        // it arrives.
        if ext.fragment_index == 0 {
            entry.msg_type = msg_type;
            entry.timestamp = timestamp;
            entry.abs_time = ext.abs_time;
            entry.meta = ext.meta;
        }

        let slot = usize::from(ext.fragment_index);
        if slot < entry.chunks.len() && entry.chunks[slot].is_none() {
            entry.chunks[slot] = Some(payload.to_vec());
            entry.received += 1;
        }

        if entry.received >= entry.total_fragments {
            let entry = self.entries.remove(index);
            let total: usize = entry
                .chunks
                .iter()
                .map(|c| c.as_ref().map_or(0, Vec::len))
                .sum();
            let mut payload = Vec::with_capacity(total);
            for chunk in entry.chunks.into_iter().flatten() {
                payload.extend_from_slice(&chunk);
            }
            return Ok(ParseOutcome::Complete(ParsedFrame {
                msg_type: entry.msg_type,
                timestamp: entry.timestamp,
                abs_time: entry.abs_time,
                meta: entry.meta,
                payload,
            }));
        }

        Ok(ParseOutcome::FragmentPending)
    }

    /// Drop incomplete entries older than [`FRAGMENT_TIMEOUT_MS`].
    ///
    /// Advisory: the evict-on-allocate rule alone keeps the table
    /// bounded; this only reclaims memory earlier on lossy inputs.
    pub fn gc_stale(&mut self) {
        let timeout = Duration::from_millis(FRAGMENT_TIMEOUT_MS);
        let now = Instant::now();
        self.entries.retain(|e| {
            let stale = now.duration_since(e.first_fragment_at) > timeout;
            if stale {
                tracing::debug!(
                    frame_id = e.frame_id,
                    received = e.received,
                    total = e.total_fragments,
                    "dropping stale reassembly entry"
                );
            }
            !stale
        });
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the layered extension headers in their fixed order:
/// fragment, then common (self-describing length), then type-specific.
fn parse_ext_headers(ext: &[u8], flags: u8, msg_type: u8) -> ExtHeaders {
    let mut out = ExtHeaders::default();
    let mut offset = 0usize;

    if flags & FLAG_FRAGMENT != 0 && offset + FRAGMENT_EXT_SIZE <= ext.len() {
        out.frame_id = u16::from_be_bytes([ext[offset], ext[offset + 1]]);
        out.fragment_index = u16::from_be_bytes([ext[offset + 2], ext[offset + 3]]);
        out.total_fragments = u16::from_be_bytes([ext[offset + 4], ext[offset + 5]]);
        offset += FRAGMENT_EXT_SIZE;
    }

    if flags & FLAG_HAS_COMMON != 0 && offset + 2 <= ext.len() {
        let common_length = ext[offset] as usize;
        let common_flags = ext[offset + 1];
        let field_offset = 2usize; // past common_length and common_flags

        if common_flags & COMMON_ABS_TIME != 0
            && field_offset + 8 <= common_length
            && offset + field_offset + 8 <= ext.len()
        {
            out.abs_time = be64(ext, offset + field_offset);
        }

        // Consume by the declared length: future common fields are
        // skipped without breaking the type-specific header position.
        offset += common_length;
    }

    if msg_type == MsgType::Video as u8 && offset + 4 <= ext.len() {
        out.meta.video_codec = ext[offset];
        out.meta.video_frame_type = ext[offset + 1];
        out.meta.video_resolution = u16::from_be_bytes([ext[offset + 2], ext[offset + 3]]);
    } else if msg_type == MsgType::Audio as u8 && offset + 4 <= ext.len() {
        out.meta.audio_codec = ext[offset];
        out.meta.audio_sample_rate = ext[offset + 1];
        out.meta.audio_channels = ext[offset + 2];
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encoder::{encode_audio_frame, encode_video_frame};
    use crate::protocol::{
        AudioCodec, SampleRateCode, VideoCodec, VideoFrameType, FRAGMENT_THRESHOLD,
    };
    use proptest::prelude::*;

    fn encode_one(payload: &[u8], frame_id: u16) -> Vec<Vec<u8>> {
        encode_video_frame(
            payload,
            VideoCodec::H264,
            VideoFrameType::Idr,
            1234,
            9999,
            frame_id,
        )
    }

    #[test]
    fn single_frame_roundtrip() {
        let mut dec = FrameDecoder::new();
        let frames = encode_one(&[1, 2, 3, 4], 0);
        match dec.parse(&frames[0]).unwrap() {
            ParseOutcome::Complete(frame) => {
                assert_eq!(frame.msg_type, MsgType::Video as u8);
                assert_eq!(frame.timestamp, 1234);
                assert_eq!(frame.abs_time, 9999);
                assert_eq!(frame.meta.video_codec, VideoCodec::H264 as u8);
                assert_eq!(frame.meta.video_frame_type, VideoFrameType::Idr as u8);
                assert_eq!(frame.meta.video_resolution, 0);
                assert_eq!(frame.payload, vec![1, 2, 3, 4]);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn audio_frame_roundtrip() {
        let mut dec = FrameDecoder::new();
        let frames = encode_audio_frame(
            &[7, 8, 9],
            AudioCodec::G711U,
            SampleRateCode::Rate16000,
            1,
            55,
            66,
            0,
        );
        match dec.parse(&frames[0]).unwrap() {
            ParseOutcome::Complete(frame) => {
                assert_eq!(frame.msg_type, MsgType::Audio as u8);
                assert_eq!(frame.meta.audio_codec, AudioCodec::G711U as u8);
                assert_eq!(frame.meta.audio_sample_rate, SampleRateCode::Rate16000 as u8);
                assert_eq!(frame.meta.audio_channels, 1);
                assert_eq!(frame.payload, vec![7, 8, 9]);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn too_short_is_error() {
        let mut dec = FrameDecoder::new();
        assert_eq!(
            dec.parse(&[0xEB, 0x01, 1]),
            Err(ProtocolError::TooShort(3))
        );
    }

    #[test]
    fn bad_magic_is_error() {
        let mut dec = FrameDecoder::new();
        let mut frame = encode_one(&[1], 0).remove(0);
        frame[0] = 0xDE;
        frame[1] = 0xAD;
        assert_eq!(dec.parse(&frame), Err(ProtocolError::BadMagic(0xDEAD)));
    }

    #[test]
    fn unknown_version_skips_without_touching_table() {
        let mut dec = FrameDecoder::new();

        // Seed a pending fragment.
        let frames = encode_one(&vec![0u8; FRAGMENT_THRESHOLD + 1], 3);
        assert_eq!(dec.parse(&frames[0]).unwrap(), ParseOutcome::FragmentPending);
        assert_eq!(dec.pending_entries(), 1);

        let mut alien = encode_one(&[1], 4).remove(0);
        alien[2] = 2; // future version
        assert_eq!(dec.parse(&alien).unwrap(), ParseOutcome::Skip);
        assert_eq!(dec.pending_entries(), 1);
    }

    #[test]
    fn truncated_declared_length_is_error() {
        let mut dec = FrameDecoder::new();
        let frame = encode_one(&[1, 2, 3, 4], 0).remove(0);
        let cut = &frame[..frame.len() - 2];
        assert!(matches!(
            dec.parse(cut),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn fragments_in_order_complete() {
        let mut dec = FrameDecoder::new();
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 241) as u8).collect();
        let frames = encode_one(&payload, 7);
        assert_eq!(frames.len(), 3);

        assert_eq!(dec.parse(&frames[0]).unwrap(), ParseOutcome::FragmentPending);
        assert_eq!(dec.parse(&frames[1]).unwrap(), ParseOutcome::FragmentPending);
        match dec.parse(&frames[2]).unwrap() {
            ParseOutcome::Complete(frame) => {
                assert_eq!(frame.payload, payload);
                assert_eq!(frame.timestamp, 1234);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
        assert_eq!(dec.pending_entries(), 0);
    }

    #[test]
    fn fragments_out_of_order_complete_with_frag0_meta() {
        let mut dec = FrameDecoder::new();
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 199) as u8).collect();
        let frames = encode_one(&payload, 7);

        // Deliver 2, 0, 1 — completion happens on the third call and the
        // metadata comes from fragment 0 even though it arrived second.
        assert_eq!(dec.parse(&frames[2]).unwrap(), ParseOutcome::FragmentPending);
        assert_eq!(dec.parse(&frames[0]).unwrap(), ParseOutcome::FragmentPending);
        match dec.parse(&frames[1]).unwrap() {
            ParseOutcome::Complete(frame) => {
                assert_eq!(frame.payload, payload);
                assert_eq!(frame.meta.video_codec, VideoCodec::H264 as u8);
                assert_eq!(frame.abs_time, 9999);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_fragments_are_idempotent() {
        let mut dec = FrameDecoder::new();
        let payload = vec![0xAB; 40_000];
        let frames = encode_one(&payload, 11);

        assert_eq!(dec.parse(&frames[0]).unwrap(), ParseOutcome::FragmentPending);
        assert_eq!(dec.parse(&frames[0]).unwrap(), ParseOutcome::FragmentPending);
        assert_eq!(dec.parse(&frames[1]).unwrap(), ParseOutcome::FragmentPending);
        assert_eq!(dec.parse(&frames[1]).unwrap(), ParseOutcome::FragmentPending);
        match dec.parse(&frames[2]).unwrap() {
            ParseOutcome::Complete(frame) => assert_eq!(frame.payload, payload),
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn zero_total_fragments_is_error() {
        let mut dec = FrameDecoder::new();
        let mut frame = encode_one(&vec![0u8; FRAGMENT_THRESHOLD + 1], 1).remove(0);
        // total_fragments lives at ext offset 4..6.
        frame[FIXED_HEADER_SIZE + 4] = 0;
        frame[FIXED_HEADER_SIZE + 5] = 0;
        assert_eq!(dec.parse(&frame), Err(ProtocolError::BadFragmentCount(0)));
    }

    #[test]
    fn excessive_total_fragments_is_error() {
        let mut dec = FrameDecoder::new();
        let mut frame = encode_one(&vec![0u8; FRAGMENT_THRESHOLD + 1], 1).remove(0);
        let bad = (MAX_FRAGMENTS + 1).to_be_bytes();
        frame[FIXED_HEADER_SIZE + 4] = bad[0];
        frame[FIXED_HEADER_SIZE + 5] = bad[1];
        assert_eq!(
            dec.parse(&frame),
            Err(ProtocolError::BadFragmentCount(MAX_FRAGMENTS + 1))
        );
    }

    #[test]
    fn table_evicts_oldest_when_full() {
        let mut dec = FrameDecoder::new();
        let payload = vec![0u8; FRAGMENT_THRESHOLD + 1];

        // Fill the table with one pending fragment per frame id.
        for id in 0..MAX_REASSEMBLY_ENTRIES as u16 {
            let frames = encode_one(&payload, id);
            assert_eq!(dec.parse(&frames[0]).unwrap(), ParseOutcome::FragmentPending);
        }
        assert_eq!(dec.pending_entries(), MAX_REASSEMBLY_ENTRIES);

        // One more distinct id evicts the oldest (id 0).
        let frames = encode_one(&payload, 999);
        assert_eq!(dec.parse(&frames[0]).unwrap(), ParseOutcome::FragmentPending);
        assert_eq!(dec.pending_entries(), MAX_REASSEMBLY_ENTRIES);

        // Completing frame 0 is impossible now: its second fragment
        // starts a fresh entry instead of completing the old one.
        let frames0 = encode_one(&payload, 0);
        assert_eq!(dec.parse(&frames0[1]).unwrap(), ParseOutcome::FragmentPending);
    }

    #[test]
    fn forward_compatible_common_ext() {
        // A frame whose common ext carries 4 extra unknown bytes: the
        // decoder must still find the video ext by common_length.
        let payload = [0xCCu8; 5];
        let common_len = 14u8; // 2 + 8 (abs_time) + 4 unknown
        let ext_length = common_len + 4;

        let mut frame = Vec::new();
        frame.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        frame.push(PROTOCOL_VERSION);
        frame.push(MsgType::Video as u8);
        frame.push(FLAG_HAS_COMMON);
        frame.extend_from_slice(&77i64.to_be_bytes());
        frame.push(ext_length);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        // common ext with an unknown trailing field
        frame.push(common_len);
        frame.push(COMMON_ABS_TIME | 0x08); // unknown flag bit set
        frame.extend_from_slice(&4242i64.to_be_bytes());
        frame.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        // video ext
        frame.extend_from_slice(&[VideoCodec::H265 as u8, VideoFrameType::PFrame as u8, 0, 0]);
        frame.extend_from_slice(&payload);

        let mut dec = FrameDecoder::new();
        match dec.parse(&frame).unwrap() {
            ParseOutcome::Complete(f) => {
                assert_eq!(f.abs_time, 4242);
                assert_eq!(f.meta.video_codec, VideoCodec::H265 as u8);
                assert_eq!(f.payload, payload);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn proptest_fragmentation_roundtrip(
            len in 1usize..80_000,
            frame_id in any::<u16>(),
            seed in any::<u8>(),
        ) {
            let payload: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_add(seed)).collect();
            let frames = encode_video_frame(
                &payload,
                VideoCodec::H264,
                VideoFrameType::PFrame,
                0,
                0,
                frame_id,
            );
            prop_assert_eq!(frames.len(), len.div_ceil(FRAGMENT_THRESHOLD));

            let mut dec = FrameDecoder::new();
            let mut completed = None;
            for (i, f) in frames.iter().enumerate() {
                match dec.parse(f).unwrap() {
                    ParseOutcome::Complete(parsed) => {
                        prop_assert_eq!(i, frames.len() - 1);
                        completed = Some(parsed);
                    }
                    ParseOutcome::FragmentPending => {
                        prop_assert!(i < frames.len() - 1 || frames.len() == 1);
                    }
                    ParseOutcome::Skip => prop_assert!(false, "unexpected Skip"),
                }
            }
            prop_assert_eq!(completed.unwrap().payload, payload);
        }

        #[test]
        fn proptest_reversed_delivery_roundtrip(len in 16_385usize..80_000) {
            let payload: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
            let frames = encode_video_frame(
                &payload,
                VideoCodec::H264,
                VideoFrameType::PFrame,
                0,
                0,
                1,
            );

            let mut dec = FrameDecoder::new();
            let mut complete_count = 0usize;
            for (i, f) in frames.iter().rev().enumerate() {
                match dec.parse(f).unwrap() {
                    ParseOutcome::Complete(parsed) => {
                        complete_count += 1;
                        prop_assert_eq!(i, frames.len() - 1);
                        prop_assert_eq!(parsed.payload.clone(), payload.clone());
                    }
                    ParseOutcome::FragmentPending => {}
                    ParseOutcome::Skip => prop_assert!(false, "unexpected Skip"),
                }
            }
            prop_assert_eq!(complete_count, 1);
        }
    }
}
