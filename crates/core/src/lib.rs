//! # wsstream — secure WebSocket media streaming server
//!
//! Streams a pre-recorded H.264/H.265 elementary stream or MP4 file to
//! browser clients over TLS WebSockets, using a length-delimited binary
//! framing protocol with fragmentation and client-side reassembly.
//!
//! ## Protocol references
//!
//! | Spec | Topic | How this crate uses it |
//! |------|-------|------------------------|
//! | [RFC 6455](https://tools.ietf.org/html/rfc6455) | WebSocket | Upgrade handshake, frame codec, close semantics |
//! | [ITU-T H.264](https://www.itu.int/rec/T-REC-H.264) | AVC | NAL segmentation, AU grouping, SPS/VUI frame-rate parsing |
//! | [ITU-T H.265](https://www.itu.int/rec/T-REC-H.265) | HEVC | NAL segmentation, AU grouping, SPS/VUI frame-rate parsing |
//! | [ISO/IEC 14496-12](https://www.iso.org/standard/68960.html) | MP4 | Container demuxing for `.mp4` inputs |
//! | [RFC 8446](https://tools.ietf.org/html/rfc8446) | TLS | Transport security (via rustls) |
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  CLI (wsstream-server)                    │
//! ├───────────────────────────────────────────┤
//! │  Server      — orchestrator, config       │
//! │  Transport   — poll loop, TLS layer       │
//! ├───────────────────────────────────────────┤
//! │  Session     — state machine, pacing      │
//! │  Protocol    — frame codec, negotiation   │
//! │  WebSocket   — handshake, frame codec     │
//! ├───────────────────────────────────────────┤
//! │  Media       — NAL/AU, SPS, MP4 demux     │
//! │  Bitstream   — bit + Exp-Golomb reader    │
//! └───────────────────────────────────────────┘
//! ```
//!
//! Everything runs on one thread: a single readiness multiplexer drives
//! the listener, every client socket, and the pacing timer. Per-connection
//! state never crosses a thread boundary.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use wsstream::{Codec, Server, ServerConfig};
//!
//! let config = ServerConfig::new("video.h264", Codec::H264);
//! let mut server = Server::new(config).unwrap();
//!
//! let running = Arc::new(AtomicBool::new(true));
//! server.run(&running).unwrap();
//! ```
//!
//! ## Crate layout
//!
//! - [`server`] — high-level [`Server`] orchestrator and [`ServerConfig`].
//! - [`transport`] — single-threaded poll loop and the TLS connection layer.
//! - [`session`] — per-connection state machine and playback pacing.
//! - [`protocol`] — binary frame encoder/decoder and media negotiation.
//! - [`websocket`] — RFC 6455 handshake and frame codec subset.
//! - [`media`] — NAL segmentation, SPS parsing, MP4 demuxing.
//! - [`bitstream`] — bit-level reader with Exp-Golomb primitives.
//! - [`error`] — [`StreamError`] enum and [`Result`] alias.

pub mod bitstream;
pub mod error;
pub mod media;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;
pub mod websocket;

pub use error::{Result, StreamError};
pub use media::{Codec, MediaSource};
pub use protocol::decoder::{FrameDecoder, ParseOutcome, ParsedFrame};
pub use server::{Server, ServerConfig, DEFAULT_PORT};
pub use session::{ConnState, Session};
