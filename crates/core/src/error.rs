//! Error types for the wsstream server library.

use crate::protocol::ProtocolError;

/// Errors that can occur in the wsstream server library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Transport**: [`Io`](Self::Io) — socket/network failures,
///   [`Tls`](Self::Tls) — TLS configuration or record-layer failures.
/// - **Startup**: [`Certificate`](Self::Certificate),
///   [`MediaLoad`](Self::MediaLoad) — both fatal; the process exits 1.
/// - **Media**: [`Mp4Parse`](Self::Mp4Parse) — malformed container input.
/// - **Wire**: [`Protocol`](Self::Protocol) — frame codec faults; the
///   connection survives, the frame is dropped.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration or protocol error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate material could not be loaded or generated.
    #[error("certificate setup failed: {0}")]
    Certificate(String),

    /// A media file could not be opened or understood.
    #[error("failed to load media file {path}: {reason}")]
    MediaLoad { path: String, reason: String },

    /// Malformed MP4 container structure.
    #[error("MP4 parse error: {0}")]
    Mp4Parse(String),

    /// Wire-protocol frame codec failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
