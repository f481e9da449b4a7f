//! TLS server configuration and the per-connection TLS layer.
//!
//! Certificates come from PEM files when the operator supplies them, or
//! from a freshly generated self-signed certificate otherwise (browsers
//! will prompt, which is fine for a streaming demo endpoint).
//!
//! [`TlsSession`] is the ciphertext half of a connection: it implements
//! the same [`ConnectionHandler`] capability as the inner [`Session`],
//! feeding received bytes through rustls and turning the session's
//! plaintext output into TLS records for the socket.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection};

use crate::error::{Result, StreamError};
use crate::session::{ConnectionHandler, Outbox, Session};

/// Build the rustls server config from PEM files, or from a generated
/// self-signed certificate when no paths are given.
pub fn build_tls_config(
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
) -> Result<Arc<ServerConfig>> {
    let (certs, key) = match (cert_path, key_path) {
        (Some(cert), Some(key)) => load_pem_pair(cert, key)?,
        (None, None) => generate_self_signed()?,
        _ => {
            return Err(StreamError::Certificate(
                "cert and key must be supplied together".into(),
            ))
        }
    };

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

fn load_pem_pair(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| {
            StreamError::Certificate(format!("{}: {}", cert_path.display(), e))
        })?;
    if certs.is_empty() {
        return Err(StreamError::Certificate(format!(
            "{}: no certificates found",
            cert_path.display()
        )));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| StreamError::Certificate(format!("{}: {}", key_path.display(), e)))?
        .ok_or_else(|| {
            StreamError::Certificate(format!("{}: no private key found", key_path.display()))
        })?;

    tracing::info!(cert = %cert_path.display(), key = %key_path.display(), "loaded TLS certificate");
    Ok((certs, key))
}

fn generate_self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| StreamError::Certificate(e.to_string()))?;

    let key = PrivateKeyDer::try_from(cert.signing_key.serialize_der())
        .map_err(|e| StreamError::Certificate(e.to_string()))?;
    let cert_der = CertificateDer::from(cert.cert);

    tracing::info!("generated self-signed TLS certificate for localhost");
    Ok((vec![cert_der], key))
}

/// TLS layer of one connection, wrapping the plaintext [`Session`].
pub struct TlsSession {
    tls: ServerConnection,
    session: Session,
    established: bool,
}

impl TlsSession {
    pub fn new(config: Arc<ServerConfig>, session: Session) -> Result<Self> {
        let mut tls = ServerConnection::new(config)?;
        // Media bursts (a whole access unit per tick) go through the
        // plaintext writer in one call; let rustls buffer them all.
        tls.set_buffer_limit(None);
        Ok(TlsSession {
            tls,
            session,
            established: false,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Drive the inner session's timer tick, encrypting its output.
    pub fn on_tick(&mut self, now: Instant, out: &mut Outbox) {
        let mut inner = Outbox::default();
        self.session.on_tick(now, &mut inner);
        self.forward_inner(inner, out);
    }

    /// Queue plaintext (e.g. a shutdown close frame) for the peer.
    pub fn queue_plaintext(&mut self, data: &[u8], out: &mut Outbox) {
        let mut inner = Outbox::default();
        inner.send(data);
        self.forward_inner(inner, out);
    }

    /// Encrypt the inner session's output and collect pending TLS records.
    fn forward_inner(&mut self, mut inner: Outbox, out: &mut Outbox) {
        let data = inner.take_data();
        if !data.is_empty() {
            if let Err(e) = self.tls.writer().write_all(&data) {
                tracing::warn!(connection = self.session.id(), error = %e, "TLS write failed");
                out.request_close();
            }
        }

        if inner.close_requested() {
            self.tls.send_close_notify();
            out.request_close();
        }

        self.drain_tls(out);
    }

    fn drain_tls(&mut self, out: &mut Outbox) {
        let mut records = Vec::new();
        while self.tls.wants_write() {
            if self.tls.write_tls(&mut records).is_err() {
                out.request_close();
                break;
            }
        }
        if !records.is_empty() {
            out.send(&records);
        }
    }
}

impl ConnectionHandler for TlsSession {
    fn on_bytes(&mut self, data: &[u8], out: &mut Outbox) {
        let mut slice = data;
        let mut inner = Outbox::default();

        while !slice.is_empty() {
            match self.tls.read_tls(&mut slice) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(connection = self.session.id(), error = %e, "TLS read failed");
                    out.request_close();
                    break;
                }
            }

            match self.tls.process_new_packets() {
                Ok(io_state) => {
                    if !self.established && !self.tls.is_handshaking() {
                        self.established = true;
                        self.session.on_established(&mut inner);
                    }

                    let plaintext_len = io_state.plaintext_bytes_to_read();
                    if plaintext_len > 0 {
                        let mut plaintext = vec![0u8; plaintext_len];
                        if std::io::Read::read_exact(&mut self.tls.reader(), &mut plaintext)
                            .is_ok()
                        {
                            self.session.on_bytes(&plaintext, &mut inner);
                        }
                    }

                    if io_state.peer_has_closed() {
                        out.request_close();
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        connection = self.session.id(),
                        error = %e,
                        "TLS handshake or record failure"
                    );
                    // Flush the alert rustls queued, then drop the
                    // connection.
                    out.request_close();
                    break;
                }
            }
        }

        self.forward_inner(inner, out);
    }

    fn on_close(&mut self) {
        self.session.on_close();
    }
}
