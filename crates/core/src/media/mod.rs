//! Media sources: raw H.264/H.265 elementary streams and MP4 containers.
//!
//! A server streams exactly one [`MediaSource`], loaded once at startup and
//! shared read-only by every connection. Raw bitstreams are segmented into
//! access units ([`nal`]); MP4 files are demuxed into timestamped packets
//! ([`mp4`]). Frame rate comes from the sequence parameter set ([`sps`]),
//! defaulting to 25 fps when the bitstream does not carry timing info.

pub mod mp4;
pub mod nal;
pub mod sps;

use std::path::Path;

use crate::error::{Result, StreamError};
use nal::{AccessUnit, RawStream};

/// Default frame rate when the SPS carries no usable timing information.
pub const DEFAULT_FPS: f64 = 25.0;

/// Video codec of the streamed elementary bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
}

impl Codec {
    /// Codec name as advertised in the media offer.
    pub fn name(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
        }
    }
}

/// Track a media packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// A single demuxed media packet.
///
/// Video packets are Annex B formatted access units; audio packets are
/// raw codec frames. PTS is monotonically increasing within a track, but
/// packets of different tracks are interleaved by PTS.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub kind: MediaKind,
    pub data: Vec<u8>,
    pub pts_ms: i64,
}

/// Audio track metadata from the container.
#[derive(Debug, Clone)]
pub struct AudioInfo {
    /// Codec name: "aac", "pcm_alaw", "pcm_mulaw" or "g726".
    pub codec_name: String,
    pub sample_rate: i32,
    pub channels: i32,
}

/// The media a server loops over, loaded once at startup.
pub enum MediaSource {
    /// Raw Annex B elementary stream, pre-grouped into access units.
    Raw(RawStream),
    /// Demuxed MP4 container: interleaved packets in PTS order.
    Container(mp4::ContainerStream),
}

impl MediaSource {
    /// Load a media file. `.mp4` files go through the container demuxer;
    /// anything else is treated as a raw Annex B bitstream of `codec`.
    pub fn load(path: &Path, codec: Codec) -> Result<Self> {
        let is_mp4 = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mp4"));

        if is_mp4 {
            let stream = mp4::ContainerStream::load(path).map_err(|e| match e {
                StreamError::Mp4Parse(reason) => StreamError::MediaLoad {
                    path: path.display().to_string(),
                    reason,
                },
                other => other,
            })?;
            tracing::info!(
                path = %path.display(),
                packets = stream.packets.len(),
                fps = stream.fps,
                audio = stream.audio.is_some(),
                "loaded MP4 container"
            );
            Ok(MediaSource::Container(stream))
        } else {
            let stream = RawStream::load(path, codec)?;
            Ok(MediaSource::Raw(stream))
        }
    }

    /// Detected video frame rate.
    pub fn fps(&self) -> f64 {
        match self {
            MediaSource::Raw(s) => s.fps,
            MediaSource::Container(s) => s.fps,
        }
    }

    /// Video codec of the stream.
    pub fn codec(&self) -> Codec {
        match self {
            MediaSource::Raw(s) => s.codec,
            MediaSource::Container(s) => s.codec,
        }
    }

    /// Audio track metadata, if the source carries one.
    pub fn audio(&self) -> Option<&AudioInfo> {
        match self {
            MediaSource::Raw(_) => None,
            MediaSource::Container(s) => s.audio.as_ref(),
        }
    }

    /// Pacing timer interval: one frame interval for raw streams, a fixed
    /// 10 ms base tick for containers.
    pub fn tick_interval_ms(&self) -> u64 {
        match self {
            MediaSource::Raw(s) => {
                let interval = (1000.0 / s.fps) as u64;
                interval.max(1)
            }
            MediaSource::Container(_) => 10,
        }
    }

    /// Access units of a raw stream (empty for containers).
    pub fn access_units(&self) -> &[AccessUnit] {
        match self {
            MediaSource::Raw(s) => &s.access_units,
            MediaSource::Container(_) => &[],
        }
    }

    /// Demuxed packets of a container (empty for raw streams).
    pub fn packets(&self) -> &[MediaPacket] {
        match self {
            MediaSource::Raw(_) => &[],
            MediaSource::Container(s) => &s.packets,
        }
    }
}
