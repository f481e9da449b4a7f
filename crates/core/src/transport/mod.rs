//! Single-threaded transport: one readiness multiplexer drives every
//! socket and the pacing timer.
//!
//! The loop owns all per-connection state, so nothing here needs a lock.
//! Each cycle: poll for readiness (bounded by the time to the next pacing
//! tick, at most one second), drain ready sockets through their
//! [`ConnectionHandler`]s, then fire the tick for every connection when
//! it is due. Outbound bytes queue in a per-connection pending buffer;
//! when the socket would block, WRITABLE interest is re-armed and the
//! remainder is flushed on the next readiness event — no busy-looping on
//! full sockets. Connections to drop are collected during iteration and
//! closed afterwards.

pub mod tls;

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};

use crate::error::Result;
use crate::session::{ConnectionHandler, Outbox, Session};
use crate::websocket;
use tls::TlsSession;

const LISTENER: Token = Token(0);

/// Upper bound on a single poll wait; the loop re-checks the stop flag
/// at least this often.
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);

/// Creates the plaintext session for a newly accepted connection.
pub type SessionFactory = Box<dyn Fn(SocketAddr) -> Session>;

struct Connection {
    stream: TcpStream,
    handler: TlsSession,
    /// Ciphertext waiting for the socket to accept it.
    pending: Vec<u8>,
    interest: Interest,
    /// Close once `pending` has drained.
    closing: bool,
}

/// The server's readiness loop: listener, sockets, timer.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    make_session: SessionFactory,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    tick_interval: Duration,
}

impl EventLoop {
    /// Bind the listening socket and set up the poller.
    pub fn bind(
        port: u16,
        tls_config: Arc<rustls::ServerConfig>,
        make_session: SessionFactory,
        tick_interval: Duration,
    ) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let mut listener = TcpListener::bind(addr)?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        tracing::info!(port, tick_ms = tick_interval.as_millis() as u64, "server listening");

        Ok(EventLoop {
            poll,
            events: Events::with_capacity(256),
            listener,
            tls_config,
            make_session,
            connections: HashMap::new(),
            next_token: 1,
            tick_interval,
        })
    }

    /// Number of open connections (any state).
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drive the loop until the stop flag clears, then notify clients
    /// and tear down.
    pub fn run(&mut self, running: &AtomicBool) -> Result<()> {
        let mut next_tick = Instant::now() + self.tick_interval;

        while running.load(Ordering::SeqCst) {
            let now = Instant::now();
            let timeout = next_tick.saturating_duration_since(now).min(MAX_POLL_WAIT);

            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|event| (event.token(), event.is_readable(), event.is_writable()))
                .collect();

            for (token, readable, writable) in ready {
                if token == LISTENER {
                    self.accept_ready();
                } else {
                    self.connection_ready(token, readable, writable);
                }
            }

            let now = Instant::now();
            if now >= next_tick {
                self.tick_all(now);
                // No catch-up for missed ticks; playback slows rather
                // than bursting after a stall.
                next_tick = now + self.tick_interval;
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Drain the accept queue.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let session = (self.make_session)(peer);
                    let handler = match TlsSession::new(Arc::clone(&self.tls_config), session) {
                        Ok(handler) => handler,
                        Err(e) => {
                            tracing::warn!(%peer, error = %e, "TLS setup failed, dropping client");
                            continue;
                        }
                    };

                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        tracing::warn!(%peer, error = %e, "failed to register client socket");
                        continue;
                    }

                    self.connections.insert(
                        token,
                        Connection {
                            stream,
                            handler,
                            pending: Vec::new(),
                            interest: Interest::READABLE,
                            closing: false,
                        },
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept error");
                    break;
                }
            }
        }
    }

    fn connection_ready(&mut self, token: Token, readable: bool, writable: bool) {
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        let mut drop_conn = false;
        let mut out = Outbox::default();

        if readable {
            let mut buf = [0u8; 4096];
            loop {
                match conn.stream.read(&mut buf) {
                    Ok(0) => {
                        drop_conn = true;
                        break;
                    }
                    Ok(n) => conn.handler.on_bytes(&buf[..n], &mut out),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!(error = %e, "read error");
                        drop_conn = true;
                        break;
                    }
                }
            }
        }

        conn.pending.extend_from_slice(out.data());
        if out.close_requested() {
            conn.closing = true;
        }

        if !drop_conn && (writable || !conn.pending.is_empty()) {
            if let Err(e) = flush(conn, registry, token) {
                tracing::debug!(error = %e, "write error");
                drop_conn = true;
            }
        }

        if conn.closing && conn.pending.is_empty() {
            drop_conn = true;
        }

        if drop_conn {
            self.close_connection(token);
        }
    }

    /// Fire the pacing tick for every connection, closing the timed-out
    /// ones after the sweep.
    fn tick_all(&mut self, now: Instant) {
        let registry = self.poll.registry();
        let mut to_close = Vec::new();

        for (&token, conn) in self.connections.iter_mut() {
            let mut out = Outbox::default();
            conn.handler.on_tick(now, &mut out);

            conn.pending.extend_from_slice(out.data());
            if out.close_requested() {
                conn.closing = true;
            }

            if let Err(e) = flush(conn, registry, token) {
                tracing::debug!(error = %e, "write error during tick");
                to_close.push(token);
            } else if conn.closing && conn.pending.is_empty() {
                to_close.push(token);
            }
        }

        for token in to_close {
            self.close_connection(token);
        }
    }

    fn close_connection(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            conn.handler.on_close();
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }

    /// Best-effort goodbye to every client, then teardown.
    fn shutdown(&mut self) {
        tracing::info!(
            connections = self.connections.len(),
            "server stopping, notifying clients"
        );

        let close = websocket::close_frame(1000, "Server is shutting down");
        let registry = self.poll.registry();

        for (&token, conn) in self.connections.iter_mut() {
            let mut out = Outbox::default();
            conn.handler.queue_plaintext(&close, &mut out);
            conn.pending.extend_from_slice(out.data());
            let _ = flush(conn, registry, token);
        }

        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close_connection(token);
        }
    }
}

/// Write as much pending ciphertext as the socket accepts, re-arming
/// WRITABLE interest when it blocks.
fn flush(conn: &mut Connection, registry: &Registry, token: Token) -> io::Result<()> {
    while !conn.pending.is_empty() {
        match conn.stream.write(&conn.pending) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                conn.pending.drain(..n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let desired = if conn.pending.is_empty() {
        Interest::READABLE
    } else {
        Interest::READABLE | Interest::WRITABLE
    };
    if desired != conn.interest {
        registry.reregister(&mut conn.stream, token, desired)?;
        conn.interest = desired;
    }

    Ok(())
}
