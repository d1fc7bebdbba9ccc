//! Socket session: one TCP connection, optionally wrapped in TLS, driven by
//! a reader worker and a writer worker.
//!
//! Callers never touch the socket. Inbound chunks arrive through an
//! unbounded queue consumed by [`Session::read`]; outbound chunks are pushed
//! by [`Session::write`] and written, in order and in full, by the writer
//! worker. The reader sleeps on a [`mio::Poll`] between arrivals; a
//! [`mio::Waker`] registered on the same poller is the interrupt used by
//! [`Session::close`] to get it out of that wait.
//!
//! # Shutdown order
//!
//! `close` marks the session closed, wakes the writer (poison value on the
//! outbound queue), wakes the reader (the waker), waits for both workers,
//! and only then touches the inbound queue and the socket.

use std::io;
use std::net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::{Result, TransportError};
use crate::io::{Connection, HandshakeError};
use crate::tls::{describe_handshake_error, TlsConfig};
use crate::worker::Worker;
use crate::{with_lock, Settings};

/// Size of a single non-blocking read.
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound on one wait for writability before the writer re-checks the
/// session state.
const WRITE_RETRY_WAIT: Duration = Duration::from_millis(100);

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

/// Connection state of a [`Session`] or [`crate::Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
}

enum Inbound {
    Data(Bytes),
    EndOfStream,
}

enum Outbound {
    Data(Bytes),
    /// Poison value: wake up and re-check the state.
    Wake,
}

/// State shared between the session handle and its workers.
struct Shared {
    open: AtomicBool,
    peer_closed: AtomicBool,
    inbound_tx: Sender<Inbound>,
    inbound_rx: Receiver<Inbound>,
    outbound_tx: Sender<Outbound>,
    outbound_rx: Receiver<Outbound>,
    fault: Mutex<Option<String>>,
}

impl Shared {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Keeps the first fault; later ones are usually consequences of it.
    fn record_fault(&self, fault: String) {
        with_lock("Shared.fault", &self.fault, |mut slot| {
            if slot.is_none() {
                *slot = Some(fault);
            }
        });
    }

    fn release_readers(&self) {
        let _ = self.inbound_tx.send(Inbound::EndOfStream);
    }
}

struct Running {
    connection: Arc<Mutex<Connection>>,
    waker: Waker,
    reader: Worker,
    writer: Worker,
}

/// A TCP connection with integrated read and write loops.
///
/// Data arriving asynchronously on the socket is queued so that synchronous
/// callers can consume it with [`Session::read`]; [`Session::write`] only
/// enqueues and never blocks.
pub struct Session {
    hostname: String,
    port: u16,
    tls: Option<TlsConfig>,
    settings: Settings,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Creates a closed session for `hostname:port`.
    ///
    /// When `tls` is given the TCP connection is wrapped in a TLS session
    /// during [`Session::connect`].
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        tls: Option<TlsConfig>,
        settings: Settings,
    ) -> Result<Self> {
        let hostname = hostname.into();
        if port == 0 {
            return Err(TransportError::connection(
                &hostname,
                port,
                io::Error::new(io::ErrorKind::InvalidInput, "port must be non-zero"),
            ));
        }

        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
        let shared = Shared {
            open: AtomicBool::new(false),
            peer_closed: AtomicBool::new(false),
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
            fault: Mutex::new(None),
        };

        Ok(Self {
            hostname,
            port,
            tls,
            settings,
            shared: Arc::new(shared),
            running: Mutex::new(None),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> State {
        if self.shared.is_open() {
            State::Open
        } else {
            State::Closed
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    /// True once the peer has closed its side of the stream.
    pub fn peer_closed(&self) -> bool {
        self.shared.peer_closed.load(Ordering::SeqCst)
    }

    /// First failure observed by a background worker, if any.
    pub fn fault(&self) -> Option<String> {
        with_lock("Shared.fault", &self.shared.fault, |slot| slot.clone())
    }

    /// Establishes the connection and starts the workers.
    ///
    /// Does nothing if the session is already open. `timeout` bounds the TCP
    /// connect and, separately, the TLS handshake; `Duration::ZERO` means no
    /// deadline.
    pub fn connect(&self, timeout: Duration) -> Result<()> {
        self.settings.in_scope(|| {
            let span = tracing::debug_span!("connect", hostname = %self.hostname, port = self.port);
            let _guard = span.enter();

            with_lock("Session.running", &self.running, |mut running| {
                if running.is_some() {
                    return Ok(());
                }

                let result = self.establish(timeout);
                match result {
                    Ok(started) => {
                        *running = Some(started);
                        tracing::debug!("session open");
                        Ok(())
                    }
                    Err(error) => {
                        tracing::error!(
                            hostname = %self.hostname,
                            port = self.port,
                            error = %error,
                            "could not connect"
                        );
                        Err(error)
                    }
                }
            })
        })
    }

    fn establish(&self, timeout: Duration) -> Result<Running> {
        let addresses = self.resolve()?;
        let started = Instant::now();
        let stream = self.connect_tcp(&addresses, timeout)?;

        let setup = |e: io::Error| TransportError::connection(&self.hostname, self.port, e);
        stream.set_nodelay(true).map_err(setup)?;
        stream.set_nonblocking(true).map_err(setup)?;
        let mut socket = TcpStream::from_std(stream);

        let mut poll = Poll::new().map_err(setup)?;
        poll.registry()
            .register(&mut socket, SOCKET, Interest::READABLE | Interest::WRITABLE)
            .map_err(setup)?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(setup)?;

        let mut connection = match &self.tls {
            None => Connection::Plain(socket),
            Some(tls) => {
                let session = tls
                    .session(&self.hostname)
                    .map_err(|reason| TransportError::tls(&self.hostname, self.port, reason))?;
                Connection::tls(socket, session)
            }
        };

        // the handshake gets the same deadline discipline as the TCP connect
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        if let Err(e) = connection.complete_handshake(&mut poll, deadline) {
            // the partially formed connection is dropped (and closed) here
            drop(connection);
            return Err(self.handshake_failure(e, timeout));
        }
        tracing::debug!(elapsed = ?started.elapsed(), tls = self.tls.is_some(), "connected");

        // leftovers from a previous connection
        self.shared.inbound_rx.try_iter().for_each(drop);
        self.shared.outbound_rx.try_iter().for_each(drop);
        self.shared.peer_closed.store(false, Ordering::SeqCst);
        with_lock("Shared.fault", &self.shared.fault, |mut slot| *slot = None);

        let connection = Arc::new(Mutex::new(connection));
        let (writable_tx, writable_rx) = crossbeam_channel::bounded(1);

        self.shared.open.store(true, Ordering::SeqCst);

        let reader = {
            let shared = Arc::clone(&self.shared);
            let connection = Arc::clone(&connection);
            Worker::spawn("reader", &self.settings, move || {
                read_loop(shared, connection, poll, writable_tx)
            })
        };
        let writer = {
            let shared = Arc::clone(&self.shared);
            let connection = Arc::clone(&connection);
            Worker::spawn("writer", &self.settings, move || {
                write_loop(shared, connection, writable_rx)
            })
        };

        match (reader, writer) {
            (Ok(reader), Ok(writer)) => Ok(Running {
                connection,
                waker,
                reader,
                writer,
            }),
            (reader, writer) => {
                // tear down whichever worker did start
                self.shared.open.store(false, Ordering::SeqCst);
                let _ = self.shared.outbound_tx.send(Outbound::Wake);
                let _ = waker.wake();
                let mut failure = None;
                for worker in [reader, writer] {
                    match worker {
                        Ok(worker) => {
                            worker.stop(self.settings.close_timeout);
                        }
                        Err(e) => failure = Some(e),
                    }
                }
                let error = failure.unwrap_or_else(|| io::Error::other("spawning worker"));
                Err(TransportError::connection(&self.hostname, self.port, error))
            }
        }
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let resolution = |reason: String| TransportError::Resolution {
            hostname: self.hostname.clone(),
            reason,
        };
        let addresses: Vec<SocketAddr> = (self.hostname.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| resolution(e.to_string()))?
            .collect();
        if addresses.is_empty() {
            return Err(resolution("no addresses returned".to_string()));
        }
        tracing::trace!(?addresses, "resolved hostname");
        Ok(addresses)
    }

    /// Tries each address in turn against one shared deadline.
    fn connect_tcp(&self, addresses: &[SocketAddr], timeout: Duration) -> Result<StdTcpStream> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let timed_out = || TransportError::Timeout {
            hostname: self.hostname.clone(),
            port: self.port,
            seconds: timeout.as_secs_f64(),
        };

        let mut last_error = None;
        for address in addresses {
            let attempt = match deadline {
                None => StdTcpStream::connect(address),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(timed_out());
                    }
                    StdTcpStream::connect_timeout(address, remaining)
                }
            };

            match attempt {
                Ok(stream) => return Ok(stream),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(timed_out()),
                Err(e) => {
                    tracing::debug!(%address, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address to connect to"));
        Err(TransportError::connection(&self.hostname, self.port, error))
    }

    fn handshake_failure(&self, error: HandshakeError, timeout: Duration) -> TransportError {
        match error {
            HandshakeError::Timeout => TransportError::Timeout {
                hostname: self.hostname.clone(),
                port: self.port,
                seconds: timeout.as_secs_f64(),
            },
            HandshakeError::Tls(e) => TransportError::tls(
                &self.hostname,
                self.port,
                describe_handshake_error(&self.hostname, &e),
            ),
            HandshakeError::Io(e) => {
                TransportError::tls(&self.hostname, self.port, format!("handshake failed: {e}"))
            }
        }
    }

    /// Blocks until data arrives.
    ///
    /// Returns `None` (end of stream) once the session is closed or the peer
    /// has closed the connection. Arrival order is preserved, message
    /// boundaries are not.
    pub fn read(&self) -> Option<Bytes> {
        if !self.shared.is_open() {
            return match self.shared.inbound_rx.try_recv() {
                Ok(Inbound::Data(data)) => Some(data),
                _ => {
                    self.shared.release_readers();
                    None
                }
            };
        }

        match self.shared.inbound_rx.recv() {
            Ok(Inbound::Data(data)) => Some(data),
            Ok(Inbound::EndOfStream) | Err(_) => {
                // put the sentinel back for anyone else blocked here
                self.shared.release_readers();
                None
            }
        }
    }

    /// Queues `data` for the writer worker. Never blocks.
    pub fn write(&self, data: impl Into<Bytes>) {
        let data = data.into();
        if !self.shared.is_open() {
            tracing::debug!(bytes = data.len(), "dropping write on a closed session");
            return;
        }
        let _ = self.shared.outbound_tx.send(Outbound::Data(data));
    }

    /// Closes the connection and stops the workers. Idempotent.
    pub fn close(&self) {
        self.settings.in_scope(|| {
            with_lock("Session.running", &self.running, |mut running| {
                let Some(Running {
                    connection,
                    waker,
                    reader,
                    writer,
                }) = running.take()
                else {
                    return;
                };
                tracing::debug!(hostname = %self.hostname, port = self.port, "closing session");

                self.shared.open.store(false, Ordering::SeqCst);
                let _ = self.shared.outbound_tx.send(Outbound::Wake);
                if let Err(e) = waker.wake() {
                    tracing::warn!(error = %e, "waking reader worker");
                }

                for worker in [reader, writer] {
                    if let Some(fault) = worker.stop(self.settings.close_timeout) {
                        self.shared.record_fault(fault);
                    }
                }

                // unread data belongs to the dead connection
                self.shared.inbound_rx.try_iter().for_each(drop);
                self.shared.release_readers();

                with_lock("Session.connection", &connection, |mut connection| {
                    connection.shutdown()
                });
                self.shared.outbound_rx.try_iter().for_each(drop);
            })
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(
    shared: Arc<Shared>,
    connection: Arc<Mutex<Connection>>,
    poll: Poll,
    writable: Sender<()>,
) {
    if let Err(e) = run_reader(&shared, &connection, poll, &writable) {
        tracing::warn!(error = %e, "error in read loop");
        shared.record_fault(format!("read loop: {e}"));
        shared.release_readers();
    }
    tracing::trace!("reader worker exiting");
}

fn run_reader(
    shared: &Shared,
    connection: &Mutex<Connection>,
    mut poll: Poll,
    writable: &Sender<()>,
) -> io::Result<()> {
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    let mut events = Events::with_capacity(16);

    loop {
        if !shared.is_open() {
            return Ok(());
        }

        let read = with_lock("Session.connection", connection, |mut connection| {
            connection.read_chunk(&mut buffer)
        });
        match read {
            Ok(0) => {
                tracing::debug!("peer closed the connection");
                shared.peer_closed.store(true, Ordering::SeqCst);
                shared.release_readers();
                return Ok(());
            }
            Ok(n) => {
                tracing::trace!(bytes = n, "received");
                let _ = shared
                    .inbound_tx
                    .send(Inbound::Data(Bytes::copy_from_slice(&buffer[..n])));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // sleep until the socket or the waker fires
                match poll.poll(&mut events, None) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
                for event in events.iter() {
                    if event.token() == SOCKET && event.is_writable() {
                        let _ = writable.try_send(());
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

fn write_loop(shared: Arc<Shared>, connection: Arc<Mutex<Connection>>, writable: Receiver<()>) {
    if let Err(e) = run_writer(&shared, &connection, &writable) {
        tracing::warn!(error = %e, "error in write loop");
        shared.record_fault(format!("write loop: {e}"));
    }
    tracing::trace!("writer worker exiting");
}

fn run_writer(
    shared: &Shared,
    connection: &Mutex<Connection>,
    writable: &Receiver<()>,
) -> io::Result<()> {
    loop {
        if !shared.is_open() {
            return Ok(());
        }

        match shared.outbound_rx.recv() {
            Ok(Outbound::Data(data)) => write_fully(shared, connection, writable, &data)?,
            Ok(Outbound::Wake) => {}
            Err(_) => return Ok(()),
        }
    }
}

/// Writes `data` completely, waiting for writability whenever the socket
/// pushes back. Gives up only when the session is closed underneath it.
fn write_fully(
    shared: &Shared,
    connection: &Mutex<Connection>,
    writable: &Receiver<()>,
    data: &[u8],
) -> io::Result<()> {
    let mut remaining = data;

    loop {
        let result = with_lock("Session.connection", connection, |mut connection| {
            if remaining.is_empty() {
                connection.flush_pending().map(|()| 0)
            } else {
                connection.write_some(remaining)
            }
        });

        match result {
            Ok(_) if remaining.is_empty() => {
                tracing::trace!(bytes = data.len(), "sent");
                return Ok(());
            }
            Ok(n) => remaining = &remaining[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                match writable.recv_timeout(WRITE_RETRY_WAIT) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    // reader is gone, nobody will forward readiness any more
                    Err(RecvTimeoutError::Disconnected) => thread::sleep(WRITE_RETRY_WAIT),
                }
                if !shared.is_open() {
                    tracing::warn!(
                        unsent = remaining.len(),
                        "session closed before the write completed"
                    );
                    return Ok(());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}
