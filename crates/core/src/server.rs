//! High-level server orchestrator.
//!
//! Owns the loaded media source and the transport event loop. Setup is
//! fail-fast: media loading, certificate setup, and the socket bind all
//! happen in [`Server::new`] so a broken configuration never reaches the
//! serving loop (the CLI exits 1 on any of these).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::Result;
use crate::media::{Codec, MediaSource};
use crate::session::Session;
use crate::transport::{tls, EventLoop, SessionFactory};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 6061;

/// Server configuration, usually filled in from the CLI.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TLS WebSocket listen port.
    pub port: u16,
    /// Codec of raw bitstream inputs (MP4 inputs carry their own).
    pub codec: Codec,
    /// Media file to stream: `.h264`/`.h265` Annex B, or `.mp4`.
    pub media_path: PathBuf,
    /// PEM certificate chain; paired with `key_path`. When both are
    /// absent a self-signed certificate is generated.
    pub cert_path: Option<PathBuf>,
    /// PEM private key; paired with `cert_path`.
    pub key_path: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(media_path: impl Into<PathBuf>, codec: Codec) -> Self {
        ServerConfig {
            port: DEFAULT_PORT,
            codec,
            media_path: media_path.into(),
            cert_path: None,
            key_path: None,
        }
    }
}

/// The streaming server: media source plus transport loop.
pub struct Server {
    event_loop: EventLoop,
    media: Arc<MediaSource>,
}

impl Server {
    /// Load media, set up TLS, and bind the listener.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let media = Arc::new(MediaSource::load(&config.media_path, config.codec)?);
        let tls_config =
            tls::build_tls_config(config.cert_path.as_deref(), config.key_path.as_deref())?;

        // Like an RTP sequence number, the frame id counter starts at a
        // random point; only deltas matter to the receiver.
        let frame_id = Arc::new(AtomicU16::new(rand::rng().random::<u16>()));

        let tick_interval = Duration::from_millis(media.tick_interval_ms());
        let session_media = Arc::clone(&media);
        let make_session: SessionFactory = Box::new(move |peer| {
            Session::new(
                peer.to_string(),
                Arc::clone(&session_media),
                Arc::clone(&frame_id),
            )
        });

        let event_loop = EventLoop::bind(config.port, tls_config, make_session, tick_interval)?;

        tracing::info!(
            codec = media.codec().name(),
            fps = media.fps(),
            audio = media.audio().is_some(),
            tick_ms = tick_interval.as_millis() as u64,
            "server initialized"
        );

        Ok(Server { event_loop, media })
    }

    /// The media this server loops over.
    pub fn media(&self) -> &MediaSource {
        &self.media
    }

    /// Open connections (any state).
    pub fn connection_count(&self) -> usize {
        self.event_loop.connection_count()
    }

    /// Serve until `running` clears, then close every client with a
    /// going-away frame and tear down.
    pub fn run(&mut self, running: &AtomicBool) -> Result<()> {
        self.event_loop.run(running)
    }
}
