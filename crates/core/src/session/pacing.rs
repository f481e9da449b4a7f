//! Per-connection playback pacing.
//!
//! Each streaming connection owns a [`Pacer`] tracking its position in the
//! shared media source. The server drives one [`Pacer::poll`] per timer
//! tick; the pacer answers with the items due for transmission.
//!
//! - **Raw streams** tick at the frame interval (⌊1000/fps⌋ ms) and emit
//!   exactly one access unit per tick, looping forever. The relative
//!   timestamp keeps growing across loops.
//! - **Containers** tick every 10 ms. A playback clock advances 10 ms per
//!   tick and every packet whose effective PTS has been reached is
//!   drained, in PTS order. Looping maps each replay onto the clock by
//!   adding the stream duration per completed loop.

use crate::media::MediaSource;

/// An item the pacer wants transmitted on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueItem {
    /// Raw mode: access unit by index with its relative timestamp.
    AccessUnit { index: usize, timestamp_ms: i64 },
    /// Container mode: packet by index (the packet carries its own PTS).
    Packet { index: usize },
}

/// Playback position of one connection.
#[derive(Debug)]
pub enum Pacer {
    Raw {
        /// Monotonic access-unit counter; wraps modulo the AU count for
        /// indexing but keeps growing for timestamps.
        au_counter: u64,
    },
    Container {
        /// Monotonic packet counter across loops.
        packet_counter: u64,
        /// Playback clock in ms, advanced 10 per tick.
        playback_time_ms: f64,
    },
}

impl Pacer {
    pub fn for_source(media: &MediaSource) -> Self {
        match media {
            MediaSource::Raw(_) => Pacer::Raw { au_counter: 0 },
            MediaSource::Container(_) => Pacer::Container {
                packet_counter: 0,
                playback_time_ms: 0.0,
            },
        }
    }

    /// Advance one tick and return the items now due.
    pub fn poll(&mut self, media: &MediaSource) -> Vec<DueItem> {
        match self {
            Pacer::Raw { au_counter } => {
                let units = media.access_units();
                if units.is_empty() {
                    return Vec::new();
                }

                let index = (*au_counter % units.len() as u64) as usize;
                let frame_interval_ms = 1000.0 / media.fps();
                let timestamp_ms = (*au_counter as f64 * frame_interval_ms) as i64;
                *au_counter += 1;

                vec![DueItem::AccessUnit {
                    index,
                    timestamp_ms,
                }]
            }
            Pacer::Container {
                packet_counter,
                playback_time_ms,
            } => {
                let packets = media.packets();
                if packets.is_empty() {
                    return Vec::new();
                }

                let first_pts = packets[0].pts_ms;
                let last_pts = packets[packets.len() - 1].pts_ms;
                let total_duration_ms = (last_pts - first_pts).max(1);

                let mut due = Vec::new();
                loop {
                    let index = (*packet_counter % packets.len() as u64) as usize;
                    let loop_count = (*packet_counter / packets.len() as u64) as i64;
                    let effective_pts_ms = (packets[index].pts_ms - first_pts
                        + loop_count * total_duration_ms)
                        as f64;

                    if effective_pts_ms > *playback_time_ms {
                        break;
                    }

                    due.push(DueItem::Packet { index });
                    *packet_counter += 1;
                }

                *playback_time_ms += 10.0;
                due
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mp4::ContainerStream;
    use crate::media::nal::{AccessUnit, NalUnit, RawStream};
    use crate::media::{Codec, MediaKind, MediaPacket};

    fn raw_source(au_count: usize, fps: f64) -> MediaSource {
        let access_units = (0..au_count)
            .map(|i| AccessUnit {
                nal_units: vec![NalUnit {
                    data: vec![0, 0, 0, 1, 0x65, i as u8],
                }],
            })
            .collect();
        MediaSource::Raw(RawStream {
            access_units,
            codec: Codec::H264,
            fps,
        })
    }

    fn container_source(pts: &[i64]) -> MediaSource {
        let packets = pts
            .iter()
            .map(|&pts_ms| MediaPacket {
                kind: MediaKind::Video,
                data: vec![0, 0, 0, 1, 0x65],
                pts_ms,
            })
            .collect();
        MediaSource::Container(ContainerStream {
            packets,
            codec: Codec::H264,
            fps: 25.0,
            audio: None,
        })
    }

    #[test]
    fn raw_emits_one_au_per_tick_with_wraparound() {
        let media = raw_source(3, 25.0);
        let mut pacer = Pacer::for_source(&media);

        let indices: Vec<usize> = (0..7)
            .flat_map(|_| pacer.poll(&media))
            .map(|item| match item {
                DueItem::AccessUnit { index, .. } => index,
                other => panic!("unexpected item {:?}", other),
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn raw_timestamp_grows_across_loops() {
        let media = raw_source(2, 25.0);
        let mut pacer = Pacer::for_source(&media);

        let timestamps: Vec<i64> = (0..4)
            .flat_map(|_| pacer.poll(&media))
            .map(|item| match item {
                DueItem::AccessUnit { timestamp_ms, .. } => timestamp_ms,
                other => panic!("unexpected item {:?}", other),
            })
            .collect();
        // 40 ms frame interval at 25 fps, not resetting at the wrap.
        assert_eq!(timestamps, vec![0, 40, 80, 120]);
    }

    #[test]
    fn raw_empty_source_emits_nothing() {
        let media = raw_source(0, 25.0);
        let mut pacer = Pacer::for_source(&media);
        assert!(pacer.poll(&media).is_empty());
    }

    #[test]
    fn container_drains_packets_as_clock_reaches_pts() {
        let media = container_source(&[0, 40, 80, 120]);
        let mut pacer = Pacer::for_source(&media);

        let mut emitted_per_tick = Vec::new();
        for _ in 0..12 {
            emitted_per_tick.push(pacer.poll(&media).len());
        }

        // Packet 0 at tick 1 (clock 0), packet 1 at tick 5 (clock 40),
        // packet 2 at tick 9 (clock 80); clock reaches only 110 by
        // tick 12, so packet 3 (PTS 120) is not yet due.
        assert_eq!(emitted_per_tick.iter().sum::<usize>(), 3);
        assert_eq!(emitted_per_tick[0], 1);
        assert_eq!(emitted_per_tick[4], 1);
        assert_eq!(emitted_per_tick[8], 1);
    }

    #[test]
    fn container_wraps_with_duration_offset() {
        let media = container_source(&[0, 40, 80, 120]);
        let mut pacer = Pacer::for_source(&media);

        let mut emitted = Vec::new();
        for _ in 0..13 {
            emitted.extend(pacer.poll(&media));
        }

        // Tick 13 (clock 120) drains packet 3 and, with the 120 ms
        // stream duration, the second loop's packet 0 lands at the same
        // effective PTS and drains with it.
        let indices: Vec<usize> = emitted
            .iter()
            .map(|item| match item {
                DueItem::Packet { index } => *index,
                other => panic!("unexpected item {:?}", other),
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 0]);
    }

    #[test]
    fn container_second_loop_continues_cadence() {
        let media = container_source(&[0, 40, 80, 120]);
        let mut pacer = Pacer::for_source(&media);

        let mut count = 0usize;
        for _ in 0..25 {
            count += pacer.poll(&media).len();
        }
        // Clock 240 by tick 25: loops drain at eff. PTS
        // 0,40,80,120,120,160,200,240,240 — nine packets in total.
        assert_eq!(count, 9);
    }

    #[test]
    fn container_audio_video_interleaved_in_pts_order() {
        let mut packets = vec![
            MediaPacket {
                kind: MediaKind::Video,
                data: vec![1],
                pts_ms: 0,
            },
            MediaPacket {
                kind: MediaKind::Audio,
                data: vec![2],
                pts_ms: 20,
            },
            MediaPacket {
                kind: MediaKind::Video,
                data: vec![3],
                pts_ms: 40,
            },
        ];
        packets.sort_by_key(|p| p.pts_ms);
        let media = MediaSource::Container(ContainerStream {
            packets,
            codec: Codec::H264,
            fps: 25.0,
            audio: None,
        });
        let mut pacer = Pacer::for_source(&media);

        let mut kinds = Vec::new();
        for _ in 0..5 {
            for item in pacer.poll(&media) {
                if let DueItem::Packet { index } = item {
                    kinds.push(media.packets()[index].kind);
                }
            }
        }
        assert_eq!(
            kinds,
            vec![MediaKind::Video, MediaKind::Audio, MediaKind::Video]
        );
    }

    #[test]
    fn container_single_packet_duration_floor() {
        // A single packet has zero duration; the 1 ms floor keeps the
        // loop arithmetic from emitting unboundedly in one tick.
        let media = container_source(&[0]);
        let mut pacer = Pacer::for_source(&media);
        let first = pacer.poll(&media);
        // Clock 0: loop 0 at eff. 0 drains, loop 1 at eff. 1 does not.
        assert_eq!(first.len(), 1);
    }
}
