//! The byte stream underneath a session: plain TCP or TLS over TCP.
//!
//! Every operation here is non-blocking. `WouldBlock` is returned to the
//! caller, which decides how to wait (the reader worker sleeps on the
//! poller, the writer worker waits for a writability notification, the
//! handshake waits with a deadline).

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::time::Instant;

use mio::net::TcpStream;
use mio::{Events, Poll};
use rustls::ClientConnection;

/// Why a TLS handshake did not complete.
#[derive(Debug)]
pub(crate) enum HandshakeError {
    Timeout,
    Tls(rustls::Error),
    Io(io::Error),
}

pub(crate) enum Connection {
    Plain(TcpStream),
    Tls {
        socket: TcpStream,
        session: Box<ClientConnection>,
    },
}

impl Connection {
    pub(crate) fn tls(socket: TcpStream, session: ClientConnection) -> Self {
        Self::Tls {
            socket,
            session: Box::new(session),
        }
    }

    /// Reads whatever is available into `buf`.
    ///
    /// `Ok(0)` means the peer closed the stream. `WouldBlock` is only
    /// returned once the socket itself has been drained, which is what an
    /// edge-triggered poller needs before it can sleep.
    pub(crate) fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(socket) => socket.read(buf),
            Connection::Tls { socket, session } => loop {
                match session.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }

                if session.read_tls(socket)? == 0 {
                    return Ok(0);
                }
                session
                    .process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                // alerts and key updates generated by the records just read
                match flush_tls(session, socket) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            },
        }
    }

    /// Hands as much of `data` as possible to the connection and returns how
    /// many bytes were taken.
    ///
    /// For TLS, accepted bytes may still sit in the session's record buffer;
    /// [`Connection::flush_pending`] pushes them out.
    pub(crate) fn write_some(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(socket) => match socket.write(data)? {
                0 => Err(io::ErrorKind::WriteZero.into()),
                n => Ok(n),
            },
            Connection::Tls { socket, session } => {
                let mut accepted = session.writer().write(data)?;
                if accepted == 0 {
                    // plaintext buffer is full
                    flush_tls(session, socket)?;
                    accepted = session.writer().write(data)?;
                    if accepted == 0 {
                        return Err(io::ErrorKind::WriteZero.into());
                    }
                }
                match flush_tls(session, socket) {
                    Ok(()) => Ok(accepted),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(accepted),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Writes out anything buffered inside the connection.
    pub(crate) fn flush_pending(&mut self) -> io::Result<()> {
        match self {
            Connection::Plain(_) => Ok(()),
            Connection::Tls { socket, session } => flush_tls(session, socket),
        }
    }

    /// Drives the TLS handshake to completion on a non-blocking socket.
    ///
    /// Waits on `poll` between steps; `deadline == None` waits indefinitely.
    /// A plain connection has nothing to do.
    pub(crate) fn complete_handshake(
        &mut self,
        poll: &mut Poll,
        deadline: Option<Instant>,
    ) -> Result<(), HandshakeError> {
        let Connection::Tls { socket, session } = self else {
            return Ok(());
        };
        let mut events = Events::with_capacity(8);

        while session.is_handshaking() {
            match flush_tls(session, socket) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(HandshakeError::Io(e)),
            }

            if session.wants_read() {
                match session.read_tls(socket) {
                    Ok(0) => {
                        return Err(HandshakeError::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed the connection during the TLS handshake",
                        )))
                    }
                    Ok(_) => {
                        if let Err(e) = session.process_new_packets() {
                            // best effort: tell the peer why we are leaving
                            let _ = flush_tls(session, socket);
                            return Err(HandshakeError::Tls(e));
                        }
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(HandshakeError::Io(e)),
                }
            }

            wait(poll, &mut events, deadline)?;
        }

        // the client's final flight may still be buffered
        loop {
            match flush_tls(session, socket) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait(poll, &mut events, deadline)?
                }
                Err(e) => return Err(HandshakeError::Io(e)),
            }
        }
    }

    /// Best-effort orderly shutdown: TLS close_notify, then TCP shutdown.
    pub(crate) fn shutdown(&mut self) {
        let socket = match self {
            Connection::Plain(socket) => socket,
            Connection::Tls { socket, session } => {
                session.send_close_notify();
                if let Err(e) = flush_tls(session, socket) {
                    tracing::trace!(error = %e, "sending close_notify");
                }
                socket
            }
        };
        if let Err(e) = socket.shutdown(Shutdown::Both) {
            tracing::trace!(error = %e, "shutting down socket");
        }
    }
}

fn flush_tls(session: &mut ClientConnection, socket: &mut TcpStream) -> io::Result<()> {
    while session.wants_write() {
        if session.write_tls(socket)? == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
    }
    Ok(())
}

fn wait(
    poll: &mut Poll,
    events: &mut Events,
    deadline: Option<Instant>,
) -> Result<(), HandshakeError> {
    let timeout = match deadline {
        None => None,
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HandshakeError::Timeout);
            }
            Some(remaining)
        }
    };
    match poll.poll(events, timeout) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
        Err(e) => Err(HandshakeError::Io(e)),
    }
}
