//! MP4 box walk: moov → trak → mdia → minf → stbl.

use std::io::{Read, Seek, SeekFrom};

use crate::error::{Result, StreamError};

use super::atoms::{Atom, AtomType, HandlerType, SampleCodec, TrackInfo};

/// Cap on atom payloads read into memory, against malformed size fields.
const MAX_ATOM_DATA_SIZE: u64 = 64 * 1024 * 1024;

fn be16(d: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([d[at], d[at + 1]])
}

fn be32(d: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([d[at], d[at + 1], d[at + 2], d[at + 3]])
}

fn be64(d: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&d[at..at + 8]);
    u64::from_be_bytes(bytes)
}

/// Streaming MP4 structure reader.
pub struct Mp4Reader<R> {
    reader: R,
    file_size: u64,
}

impl<R: Read + Seek> Mp4Reader<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(Self { reader, file_size })
    }

    /// Walk the file and extract video/audio track info with resolved
    /// sample tables left in builder form.
    pub fn parse(&mut self) -> Result<(Option<TrackInfo>, Option<TrackInfo>)> {
        let mut video = None;
        let mut audio = None;

        let top = self.read_atoms(0, self.file_size)?;
        let moov = top
            .iter()
            .find(|a| a.atom_type == AtomType::MOOV)
            .ok_or_else(|| StreamError::Mp4Parse("no moov atom".into()))?;

        for child in self.read_atoms(moov.data_offset, moov.data_offset + moov.data_size())? {
            if child.atom_type != AtomType::TRAK {
                continue;
            }
            let track = self.parse_trak(&child)?;
            match (track.handler, track.codec) {
                (Some(HandlerType::Video), Some(SampleCodec::Avc | SampleCodec::Hevc))
                    if video.is_none() =>
                {
                    video = Some(track)
                }
                (Some(HandlerType::Audio), Some(SampleCodec::Aac)) if audio.is_none() => {
                    audio = Some(track)
                }
                _ => {
                    tracing::debug!(handler = ?track.handler, codec = ?track.codec, "skipping track");
                }
            }
        }

        Ok((video, audio))
    }

    /// Read sample data at an absolute file offset.
    pub fn read_sample(&mut self, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size as usize];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_atoms(&mut self, start: u64, end: u64) -> Result<Vec<Atom>> {
        let mut atoms = Vec::new();
        let mut pos = start;

        while pos + 8 <= end {
            self.reader.seek(SeekFrom::Start(pos))?;

            let mut header = [0u8; 8];
            if self.reader.read_exact(&mut header).is_err() {
                break;
            }

            let size32 = be32(&header, 0) as u64;
            let atom_type = AtomType::from_bytes([header[4], header[5], header[6], header[7]]);

            let (size, header_size) = if size32 == 1 {
                let mut ext = [0u8; 8];
                self.reader.read_exact(&mut ext)?;
                (u64::from_be_bytes(ext), 16u8)
            } else if size32 == 0 {
                // Atom extends to end of file.
                (end - pos, 8u8)
            } else {
                (size32, 8u8)
            };

            if size < u64::from(header_size) {
                return Err(StreamError::Mp4Parse(format!(
                    "atom {} has impossible size {}",
                    atom_type, size
                )));
            }

            atoms.push(Atom {
                atom_type,
                size,
                data_offset: pos + u64::from(header_size),
                header_size,
            });

            pos += size;
        }

        Ok(atoms)
    }

    fn read_atom_data(&mut self, atom: &Atom) -> Result<Vec<u8>> {
        let size = atom.data_size();
        if size > MAX_ATOM_DATA_SIZE {
            return Err(StreamError::Mp4Parse(format!(
                "atom {} too large ({} bytes)",
                atom.atom_type, size
            )));
        }
        self.reader.seek(SeekFrom::Start(atom.data_offset))?;
        let mut buf = vec![0u8; size as usize];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn parse_trak(&mut self, trak: &Atom) -> Result<TrackInfo> {
        let mut track = TrackInfo::default();
        self.walk_trak(trak, &mut track)?;
        Ok(track)
    }

    fn walk_trak(&mut self, parent: &Atom, track: &mut TrackInfo) -> Result<()> {
        for atom in self.read_atoms(parent.data_offset, parent.data_offset + parent.data_size())? {
            if atom.is_container() {
                self.walk_trak(&atom, track)?;
                continue;
            }
            match atom.atom_type {
                AtomType::MDHD => self.parse_mdhd(&atom, track)?,
                AtomType::HDLR => self.parse_hdlr(&atom, track)?,
                AtomType::STSD => self.parse_stsd(&atom, track)?,
                AtomType::STTS => self.parse_stts(&atom, track)?,
                AtomType::CTTS => self.parse_ctts(&atom, track)?,
                AtomType::STSC => self.parse_stsc(&atom, track)?,
                AtomType::STSZ => self.parse_stsz(&atom, track)?,
                AtomType::STCO => self.parse_stco(&atom, track, false)?,
                AtomType::CO64 => self.parse_stco(&atom, track, true)?,
                AtomType::STSS => self.parse_stss(&atom, track)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_mdhd(&mut self, atom: &Atom, track: &mut TrackInfo) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        if data.is_empty() {
            return Err(StreamError::Mp4Parse("empty mdhd".into()));
        }
        let version = data[0];
        if version == 1 {
            if data.len() < 32 {
                return Err(StreamError::Mp4Parse("short mdhd v1".into()));
            }
            track.timescale = be32(&data, 20);
            track.duration = be64(&data, 24);
        } else {
            if data.len() < 24 {
                return Err(StreamError::Mp4Parse("short mdhd v0".into()));
            }
            track.timescale = be32(&data, 12);
            track.duration = u64::from(be32(&data, 16));
        }
        Ok(())
    }

    fn parse_hdlr(&mut self, atom: &Atom, track: &mut TrackInfo) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        if data.len() < 12 {
            return Err(StreamError::Mp4Parse("short hdlr".into()));
        }
        track.handler = Some(HandlerType::from_bytes([
            data[8], data[9], data[10], data[11],
        ]));
        Ok(())
    }

    fn parse_stsd(&mut self, atom: &Atom, track: &mut TrackInfo) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        if data.len() < 16 {
            return Err(StreamError::Mp4Parse("short stsd".into()));
        }

        // First sample description entry: size(4) + format(4) at offset 8.
        let entry = &data[8..];
        let format = [entry[4], entry[5], entry[6], entry[7]];

        match &format {
            b"avc1" | b"avc3" => {
                track.codec = Some(SampleCodec::Avc);
                track.codec_config = find_config_box(&entry[8..], b"avcC");
            }
            b"hvc1" | b"hev1" => {
                track.codec = Some(SampleCodec::Hevc);
                track.codec_config = find_config_box(&entry[8..], b"hvcC");
            }
            b"mp4a" => {
                track.codec = Some(SampleCodec::Aac);
                // AudioSampleEntry: 8 (format hdr) + 8 reserved, then
                // channelcount(2), samplesize(2), predefined(2),
                // reserved(2), samplerate (16.16 fixed).
                if entry.len() >= 36 {
                    track.channels = be16(entry, 24);
                    track.sample_rate = be32(entry, 32) >> 16;
                }
            }
            _ => {
                track.codec = Some(SampleCodec::Unknown);
                tracing::debug!(
                    format = %String::from_utf8_lossy(&format),
                    "unsupported sample description"
                );
            }
        }

        Ok(())
    }

    fn parse_stts(&mut self, atom: &Atom, track: &mut TrackInfo) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        let count = table_count(&data, 8)?;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = 8 + i * 8;
            entries.push((be32(&data, at), be32(&data, at + 4)));
        }
        track.samples.stts = entries;
        Ok(())
    }

    fn parse_ctts(&mut self, atom: &Atom, track: &mut TrackInfo) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        let version = data.first().copied().unwrap_or(0);
        let count = table_count(&data, 8)?;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = 8 + i * 8;
            let sample_count = be32(&data, at);
            // Version 1 offsets are signed; version 0 are unsigned.
            let offset = if version == 1 {
                i64::from(be32(&data, at + 4) as i32)
            } else {
                i64::from(be32(&data, at + 4))
            };
            entries.push((sample_count, offset));
        }
        track.samples.ctts = entries;
        Ok(())
    }

    fn parse_stsc(&mut self, atom: &Atom, track: &mut TrackInfo) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        let count = table_count(&data, 12)?;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = 8 + i * 12;
            entries.push((be32(&data, at), be32(&data, at + 4)));
        }
        track.samples.stsc = entries;
        Ok(())
    }

    fn parse_stsz(&mut self, atom: &Atom, track: &mut TrackInfo) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        if data.len() < 12 {
            return Err(StreamError::Mp4Parse("short stsz".into()));
        }
        let uniform = be32(&data, 4);
        track.samples.uniform_size = uniform;
        if uniform == 0 {
            let count = be32(&data, 8) as usize;
            if data.len() < 12 + count * 4 {
                return Err(StreamError::Mp4Parse("stsz table truncated".into()));
            }
            let mut sizes = Vec::with_capacity(count);
            for i in 0..count {
                sizes.push(be32(&data, 12 + i * 4));
            }
            track.samples.sizes = sizes;
        }
        Ok(())
    }

    fn parse_stco(&mut self, atom: &Atom, track: &mut TrackInfo, wide: bool) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        let entry_size = if wide { 8 } else { 4 };
        let count = table_count(&data, entry_size)?;
        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            let at = 8 + i * entry_size;
            offsets.push(if wide {
                be64(&data, at)
            } else {
                u64::from(be32(&data, at))
            });
        }
        track.samples.chunk_offsets = offsets;
        Ok(())
    }

    fn parse_stss(&mut self, atom: &Atom, track: &mut TrackInfo) -> Result<()> {
        let data = self.read_atom_data(atom)?;
        let count = table_count(&data, 4)?;
        let mut syncs = Vec::with_capacity(count);
        for i in 0..count {
            syncs.push(be32(&data, 8 + i * 4));
        }
        track.samples.sync_samples = syncs;
        Ok(())
    }
}

/// Validate a full-box table header and return its entry count.
fn table_count(data: &[u8], entry_size: usize) -> std::result::Result<usize, StreamError> {
    if data.len() < 8 {
        return Err(StreamError::Mp4Parse("short table atom".into()));
    }
    let count = be32(data, 4) as usize;
    if data.len() < 8 + count * entry_size {
        return Err(StreamError::Mp4Parse("table atom truncated".into()));
    }
    Ok(count)
}

/// Scan the tail of a sample entry for a configuration child box
/// (avcC/hvcC) and return its payload.
fn find_config_box(data: &[u8], fourcc: &[u8; 4]) -> Option<Vec<u8>> {
    // Sample entries put fixed fields before child boxes; rather than
    // hardcoding each entry layout, scan for the box header.
    let mut i = 0usize;
    while i + 8 <= data.len() {
        if &data[i + 4..i + 8] == fourcc {
            let size = be32(data, i) as usize;
            if size >= 8 && i + size <= data.len() {
                return Some(data[i + 8..i + size].to_vec());
            }
            return None;
        }
        i += 1;
    }
    None
}
