//! Per-connection session state machine.
//!
//! Every client walks the same path:
//!
//! ```text
//! accept
//!   ↓
//! HandshakingTls ── TLS complete ──→ HandshakingWs ── HTTP 101 ──→ Negotiating
//!                                                                      │
//!                                          media-answer accepted ──────┤
//!                                                                      ↓
//!                                                                  Streaming
//!                                                                      │
//!                                             close / error / timeout ─┴→ Closing
//! ```
//!
//! The [`Session`] is the plaintext half of the connection: it consumes
//! decrypted bytes, speaks the WebSocket and negotiation protocols, and
//! paces media frames. The TLS layer wraps it behind the same
//! [`ConnectionHandler`] capability, so the event loop only ever moves
//! bytes between sockets and handlers.

pub mod pacing;

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::media::{Codec, MediaKind, MediaSource};
use crate::protocol::encoder::{encode_audio_frame, encode_video_frame};
use crate::protocol::negotiation::{MediaAnswer, MediaOffer};
use crate::protocol::{AudioCodec, SampleRateCode, VideoFrameType};
use crate::websocket::{self, Opcode};
use pacing::{DueItem, Pacer};

static CONNECTION_COUNTER: AtomicU32 = AtomicU32::new(0);

/// How long a client may take to answer the media offer.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket close code: normal closure.
const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code: policy violation (negotiation timeout).
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    HandshakingTls,
    HandshakingWs,
    Negotiating,
    Streaming,
    Closing,
}

/// Transfer counters logged when the connection ends.
#[derive(Debug)]
pub struct ConnStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub connected_at: Instant,
}

/// Bytes a handler wants written to its transport, plus an optional
/// close request. The event loop drains this after every handler call.
#[derive(Default)]
pub struct Outbox {
    data: Vec<u8>,
    close: bool,
}

impl Outbox {
    pub fn send(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Ask the owner to close the connection once the outbox drains.
    pub fn request_close(&mut self) {
        self.close = true;
    }

    pub fn close_requested(&self) -> bool {
        self.close
    }

    pub fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// The connection capability: a handler receives its peer's bytes and a
/// close notification, nothing else. The TLS wrapper implements it at
/// the ciphertext layer and forwards plaintext to the inner [`Session`].
pub trait ConnectionHandler {
    fn on_bytes(&mut self, data: &[u8], out: &mut Outbox);
    fn on_close(&mut self);
}

/// Plaintext session: WebSocket upgrade, negotiation, streaming.
pub struct Session {
    id: u32,
    peer: String,
    state: ConnState,
    recv_buf: Vec<u8>,
    media: Arc<MediaSource>,
    frame_id: Arc<AtomicU16>,
    pacer: Pacer,
    negotiate_deadline: Option<Instant>,
    stats: ConnStats,
}

impl Session {
    pub fn new(peer: String, media: Arc<MediaSource>, frame_id: Arc<AtomicU16>) -> Self {
        let id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst) + 1;
        let pacer = Pacer::for_source(&media);
        tracing::info!(connection = id, %peer, "client connected");
        Session {
            id,
            peer,
            state: ConnState::HandshakingTls,
            recv_buf: Vec::new(),
            media,
            frame_id,
            pacer,
            negotiate_deadline: None,
            stats: ConnStats {
                messages_sent: 0,
                bytes_sent: 0,
                connected_at: Instant::now(),
            },
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    /// The transport finished its TLS handshake; expect the HTTP upgrade
    /// next. Until this point the client does not count as connected to
    /// the application layer.
    pub fn on_established(&mut self, _out: &mut Outbox) {
        if self.state == ConnState::HandshakingTls {
            tracing::debug!(connection = self.id, "TLS handshake complete");
            self.state = ConnState::HandshakingWs;
        }
    }

    /// One timer tick: negotiation timeout enforcement and frame pacing.
    pub fn on_tick(&mut self, now: Instant, out: &mut Outbox) {
        match self.state {
            ConnState::Negotiating => {
                if self
                    .negotiate_deadline
                    .is_some_and(|deadline| now >= deadline)
                {
                    tracing::info!(connection = self.id, "negotiation timeout");
                    out.send(&websocket::close_frame(
                        CLOSE_POLICY_VIOLATION,
                        "Negotiation timeout",
                    ));
                    self.state = ConnState::Closing;
                    out.request_close();
                }
            }
            ConnState::Streaming => {
                let due = self.pacer.poll(&self.media);
                let media = Arc::clone(&self.media);
                for item in due {
                    match item {
                        DueItem::AccessUnit {
                            index,
                            timestamp_ms,
                        } => {
                            let payload = media.access_units()[index].merged_payload();
                            self.send_video(&payload, timestamp_ms, out);
                        }
                        DueItem::Packet { index } => {
                            let packet = &media.packets()[index];
                            match packet.kind {
                                MediaKind::Video => {
                                    self.send_video(&packet.data, packet.pts_ms, out)
                                }
                                MediaKind::Audio => {
                                    self.send_audio(&packet.data, packet.pts_ms, out)
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn send_video(&mut self, payload: &[u8], timestamp_ms: i64, out: &mut Outbox) {
        let codec = self.media.codec();
        let frame_type = detect_frame_type(payload, codec);
        let frame_id = self.frame_id.fetch_add(1, Ordering::Relaxed);

        let frames = encode_video_frame(
            payload,
            codec.into(),
            frame_type,
            timestamp_ms,
            wall_clock_ms(),
            frame_id,
        );
        self.send_binary_frames(frames, out);
    }

    fn send_audio(&mut self, payload: &[u8], timestamp_ms: i64, out: &mut Outbox) {
        let Some(audio) = self.media.audio() else {
            tracing::warn!(connection = self.id, "audio packet without audio track info");
            return;
        };
        let frame_id = self.frame_id.fetch_add(1, Ordering::Relaxed);

        let frames = encode_audio_frame(
            payload,
            AudioCodec::from_name(&audio.codec_name),
            SampleRateCode::from_rate(audio.sample_rate),
            audio.channels as u8,
            timestamp_ms,
            wall_clock_ms(),
            frame_id,
        );
        self.send_binary_frames(frames, out);
    }

    fn send_binary_frames(&mut self, frames: Vec<Vec<u8>>, out: &mut Outbox) {
        for frame in &frames {
            out.send(&websocket::encode_frame(Opcode::Binary, frame));
            self.stats.messages_sent += 1;
            self.stats.bytes_sent += frame.len() as u64;
        }
    }

    fn handle_upgrade(&mut self, out: &mut Outbox) {
        // Wait for the complete header block.
        if !self
            .recv_buf
            .windows(4)
            .any(|window| window == b"\r\n\r\n")
        {
            return;
        }

        if !websocket::is_http_request(&self.recv_buf) {
            tracing::warn!(connection = self.id, "expected HTTP upgrade request");
            self.state = ConnState::Closing;
            out.request_close();
            return;
        }

        let request = String::from_utf8_lossy(&self.recv_buf).into_owned();
        let Some(response) = websocket::handshake_response(&request) else {
            tracing::warn!(connection = self.id, "WebSocket handshake failed");
            self.state = ConnState::Closing;
            out.request_close();
            return;
        };
        out.send(response.as_bytes());
        self.recv_buf.clear();

        tracing::info!(connection = self.id, peer = %self.peer, "WebSocket handshake completed");

        // Offer immediately; the client has NEGOTIATION_TIMEOUT to answer.
        let offer = MediaOffer::new(
            self.media.codec(),
            self.media.fps(),
            self.media.audio(),
        )
        .to_json();
        out.send(&websocket::encode_frame(Opcode::Text, offer.as_bytes()));
        self.state = ConnState::Negotiating;
        self.negotiate_deadline = Some(Instant::now() + NEGOTIATION_TIMEOUT);
        tracing::debug!(connection = self.id, offer, "sent media-offer");
    }

    fn handle_ws_frames(&mut self, out: &mut Outbox) {
        loop {
            let Some((frame, consumed)) = websocket::parse_frame(&self.recv_buf) else {
                return; // need more data
            };
            self.recv_buf.drain(..consumed);

            match frame.opcode {
                Opcode::Text => {
                    let text = String::from_utf8_lossy(&frame.payload).into_owned();
                    if self.state == ConnState::Negotiating {
                        self.handle_answer(&text, out);
                    } else {
                        tracing::debug!(connection = self.id, text, "text frame ignored");
                    }
                }
                Opcode::Binary => {
                    tracing::debug!(
                        connection = self.id,
                        bytes = frame.payload.len(),
                        "binary frame from client ignored"
                    );
                }
                Opcode::Ping => {
                    out.send(&websocket::pong_frame(&frame.payload));
                }
                Opcode::Close => {
                    tracing::info!(connection = self.id, "client sent close frame");
                    self.state = ConnState::Closing;
                    out.request_close();
                    return;
                }
                Opcode::Pong | Opcode::Continuation => {}
            }
        }
    }

    fn handle_answer(&mut self, text: &str, out: &mut Outbox) {
        let Some(answer) = MediaAnswer::parse(text) else {
            tracing::warn!(connection = self.id, text, "unexpected message while negotiating");
            return;
        };

        if answer.accepted() {
            tracing::info!(connection = self.id, "negotiation accepted, streaming");
            self.state = ConnState::Streaming;
            self.negotiate_deadline = None;
        } else {
            tracing::info!(
                connection = self.id,
                reason = answer.reason().unwrap_or(""),
                "negotiation rejected"
            );
            out.send(&websocket::close_frame(CLOSE_NORMAL, "Negotiation rejected"));
            self.state = ConnState::Closing;
            out.request_close();
        }
    }

    #[cfg(test)]
    fn force_negotiate_deadline(&mut self, deadline: Instant) {
        self.negotiate_deadline = Some(deadline);
    }
}

impl ConnectionHandler for Session {
    fn on_bytes(&mut self, data: &[u8], out: &mut Outbox) {
        match self.state {
            ConnState::HandshakingTls => {
                // The TLS layer delivers plaintext only after promoting
                // the session; anything earlier is a layering bug.
                tracing::warn!(connection = self.id, "plaintext before TLS completion, dropped");
            }
            ConnState::HandshakingWs => {
                self.recv_buf.extend_from_slice(data);
                self.handle_upgrade(out);
            }
            ConnState::Negotiating | ConnState::Streaming => {
                self.recv_buf.extend_from_slice(data);
                self.handle_ws_frames(out);
            }
            ConnState::Closing => {}
        }
    }

    fn on_close(&mut self) {
        let duration = self.stats.connected_at.elapsed();
        tracing::info!(
            connection = self.id,
            peer = %self.peer,
            duration_secs = duration.as_secs(),
            messages_sent = self.stats.messages_sent,
            mb_sent = format_args!("{:.2}", self.stats.bytes_sent as f64 / 1024.0 / 1024.0),
            "client disconnected"
        );
        self.state = ConnState::Closing;
    }
}

/// Milliseconds since the Unix epoch, stamped into the common ext at
/// send time.
fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn classify_nal(nal_type: u8, codec: Codec) -> Option<VideoFrameType> {
    match codec {
        Codec::H264 => match nal_type {
            7 | 8 => Some(VideoFrameType::SpsPps),
            5 => Some(VideoFrameType::Idr),
            1 => Some(VideoFrameType::PFrame),
            _ => None,
        },
        Codec::H265 => match nal_type {
            32 => Some(VideoFrameType::Vps),
            33 | 34 => Some(VideoFrameType::SpsPps),
            19 | 20 => Some(VideoFrameType::Idr),
            16..=23 => Some(VideoFrameType::IFrame),
            0..=15 => Some(VideoFrameType::PFrame),
            _ => None,
        },
    }
}

/// Classify a video payload by its NAL units.
///
/// Annex B payloads are scanned start code by start code until a unit
/// classifies. A payload with no leading start code is assumed to be
/// AVCC with a 4-byte length prefix. Unclassifiable input is treated as
/// a P frame.
pub(crate) fn detect_frame_type(payload: &[u8], codec: Codec) -> VideoFrameType {
    if payload.len() < 5 {
        return VideoFrameType::PFrame;
    }

    let header_type = |byte: u8| match codec {
        Codec::H264 => byte & 0x1F,
        Codec::H265 => (byte >> 1) & 0x3F,
    };

    if payload[0] == 0 && payload[1] == 0 && (payload[2] == 1 || (payload[2] == 0 && payload[3] == 1))
    {
        // Annex B: scan NAL units in order.
        let mut i = 0usize;
        while i + 3 < payload.len() {
            let is_4byte = payload[i] == 0
                && payload[i + 1] == 0
                && payload[i + 2] == 0
                && payload[i + 3] == 1;
            let is_3byte =
                !is_4byte && payload[i] == 0 && payload[i + 1] == 0 && payload[i + 2] == 1;

            if is_4byte || is_3byte {
                let header_at = i + if is_4byte { 4 } else { 3 };
                if header_at < payload.len() {
                    if let Some(frame_type) = classify_nal(header_type(payload[header_at]), codec)
                    {
                        return frame_type;
                    }
                }
                i = header_at;
            } else {
                i += 1;
            }
        }
        return VideoFrameType::PFrame;
    }

    // AVCC length-prefixed: the first NAL header sits after a 4-byte
    // length field.
    classify_nal(header_type(payload[4]), codec).unwrap_or(VideoFrameType::PFrame)
}
