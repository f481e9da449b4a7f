//! MP4 atom definitions.

/// Four-character atom type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomType(pub [u8; 4]);

impl AtomType {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const MOOV: Self = Self(*b"moov");
    pub const MDAT: Self = Self(*b"mdat");
    pub const MVHD: Self = Self(*b"mvhd");
    pub const TRAK: Self = Self(*b"trak");
    pub const MDIA: Self = Self(*b"mdia");
    pub const MDHD: Self = Self(*b"mdhd");
    pub const HDLR: Self = Self(*b"hdlr");
    pub const MINF: Self = Self(*b"minf");
    pub const STBL: Self = Self(*b"stbl");
    pub const STSD: Self = Self(*b"stsd");
    pub const STTS: Self = Self(*b"stts");
    pub const STSS: Self = Self(*b"stss");
    pub const STSC: Self = Self(*b"stsc");
    pub const STSZ: Self = Self(*b"stsz");
    pub const STCO: Self = Self(*b"stco");
    pub const CO64: Self = Self(*b"co64");
    pub const CTTS: Self = Self(*b"ctts");

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl std::fmt::Display for AtomType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed atom header.
#[derive(Debug, Clone)]
pub struct Atom {
    pub atom_type: AtomType,
    /// Atom size including header.
    pub size: u64,
    /// File offset where atom data starts (after header).
    pub data_offset: u64,
    /// Size of the header (8 or 16 bytes for 64-bit sizes).
    pub header_size: u8,
}

impl Atom {
    pub fn data_size(&self) -> u64 {
        self.size.saturating_sub(u64::from(self.header_size))
    }

    /// Whether this atom holds child atoms.
    pub fn is_container(&self) -> bool {
        matches!(
            self.atom_type,
            AtomType::MOOV | AtomType::TRAK | AtomType::MDIA | AtomType::MINF | AtomType::STBL
        )
    }
}

/// Track handler type from the hdlr atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerType {
    Video,
    Audio,
    Other,
}

impl HandlerType {
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        match &bytes {
            b"vide" => Self::Video,
            b"soun" => Self::Audio,
            _ => Self::Other,
        }
    }
}

/// Codec recorded in the stsd sample description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleCodec {
    Avc,
    Hevc,
    Aac,
    Unknown,
}

/// Per-track information extracted from a trak atom.
#[derive(Debug, Clone, Default)]
pub struct TrackInfo {
    pub handler: Option<HandlerType>,
    /// Media timescale (ticks per second).
    pub timescale: u32,
    /// Track duration in media timescale units.
    pub duration: u64,
    pub codec: Option<SampleCodec>,
    /// Raw decoder configuration (avcC or hvcC payload).
    pub codec_config: Option<Vec<u8>>,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: super::sample_table::SampleTableBuilder,
}
