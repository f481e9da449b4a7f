//! MP4 sample table resolution.
//!
//! The stbl child atoms describe samples indirectly:
//! stts (decode durations), ctts (composition offsets), stsc
//! (sample-to-chunk), stsz (sizes), stco/co64 (chunk offsets), stss
//! (sync samples). [`SampleTableBuilder::resolve`] flattens them into one
//! entry per sample with an absolute file offset and timestamps.

/// A resolved sample: everything needed to read it from the file and
/// stamp its presentation time.
#[derive(Debug, Clone, Copy)]
pub struct SampleEntry {
    /// File offset where the sample data starts.
    pub offset: u64,
    /// Sample size in bytes.
    pub size: u32,
    /// Decode timestamp in media timescale units.
    pub dts: u64,
    /// Composition time offset for PTS calculation.
    pub cts_offset: i64,
    /// Whether this sample is a sync sample (keyframe).
    pub is_sync: bool,
}

impl SampleEntry {
    /// Presentation timestamp in media timescale units.
    pub fn pts(&self) -> i64 {
        self.dts as i64 + self.cts_offset
    }
}

/// Accumulates raw sample-table atom contents for one track.
#[derive(Debug, Clone, Default)]
pub struct SampleTableBuilder {
    /// stts entries: (sample_count, sample_delta).
    pub stts: Vec<(u32, u32)>,
    /// ctts entries: (sample_count, composition_offset).
    pub ctts: Vec<(u32, i64)>,
    /// stsc entries: (first_chunk, samples_per_chunk).
    pub stsc: Vec<(u32, u32)>,
    /// Uniform sample size from stsz, or 0 when sizes vary.
    pub uniform_size: u32,
    /// Per-sample sizes (empty when uniform_size != 0).
    pub sizes: Vec<u32>,
    /// Chunk offsets from stco/co64.
    pub chunk_offsets: Vec<u64>,
    /// 1-based sync sample numbers from stss (empty = all sync).
    pub sync_samples: Vec<u32>,
}

impl SampleTableBuilder {
    fn sample_count(&self) -> usize {
        if self.uniform_size != 0 {
            self.stts.iter().map(|&(count, _)| count as usize).sum()
        } else {
            self.sizes.len()
        }
    }

    fn size_of(&self, index: usize) -> u32 {
        if self.uniform_size != 0 {
            self.uniform_size
        } else {
            self.sizes.get(index).copied().unwrap_or(0)
        }
    }

    /// Flatten the accumulated tables into per-sample entries.
    ///
    /// Chunk runs past the last stsc entry reuse its samples-per-chunk
    /// value, as the stsc run-length encoding specifies (ISO/IEC
    /// 14496-12 §8.7.4).
    pub fn resolve(&self) -> Vec<SampleEntry> {
        let count = self.sample_count();
        let mut entries = Vec::with_capacity(count);

        // Expand stts into per-sample DTS.
        let mut dts_values = Vec::with_capacity(count);
        let mut dts = 0u64;
        for &(sample_count, delta) in &self.stts {
            for _ in 0..sample_count {
                if dts_values.len() >= count {
                    break;
                }
                dts_values.push(dts);
                dts += u64::from(delta);
            }
        }
        dts_values.resize(count, dts);

        // Expand ctts into per-sample composition offsets.
        let mut cts_values = Vec::with_capacity(count);
        for &(sample_count, offset) in &self.ctts {
            for _ in 0..sample_count {
                if cts_values.len() >= count {
                    break;
                }
                cts_values.push(offset);
            }
        }
        cts_values.resize(count, 0);

        // Walk chunks, assigning offsets within each.
        let mut sample_index = 0usize;
        for (chunk_index, &chunk_offset) in self.chunk_offsets.iter().enumerate() {
            let chunk_number = chunk_index as u32 + 1;
            let samples_in_chunk = self
                .stsc
                .iter()
                .rev()
                .find(|&&(first, _)| first <= chunk_number)
                .map(|&(_, per_chunk)| per_chunk)
                .unwrap_or(1);

            let mut offset = chunk_offset;
            for _ in 0..samples_in_chunk {
                if sample_index >= count {
                    break;
                }
                let size = self.size_of(sample_index);
                entries.push(SampleEntry {
                    offset,
                    size,
                    dts: dts_values[sample_index],
                    cts_offset: cts_values[sample_index],
                    is_sync: self.sync_samples.is_empty()
                        || self.sync_samples.contains(&(sample_index as u32 + 1)),
                });
                offset += u64::from(size);
                sample_index += 1;
            }
        }

        entries
    }

    /// Average sample delta in timescale units from stts, or `None` when
    /// the table is empty or degenerate.
    pub fn average_delta(&self) -> Option<f64> {
        let total_samples: u64 = self.stts.iter().map(|&(c, _)| u64::from(c)).sum();
        let total_duration: u64 = self
            .stts
            .iter()
            .map(|&(c, d)| u64::from(c) * u64::from(d))
            .sum();
        if total_samples == 0 || total_duration == 0 {
            return None;
        }
        Some(total_duration as f64 / total_samples as f64)
    }
}
