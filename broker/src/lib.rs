//! Stub PCP broker for tests
//!
//! Listens on a random loopback port and serves each connection on its own
//! thread, optionally over TLS. Depending on the [`Mode`] it echoes raw
//! bytes, hangs up after a greeting, or speaks WebSocket and answers text
//! messages through a [`Responder`].
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use eyre::WrapErr;
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use tungstenite::Message;

pub mod pki;

/// Produces the replies to one received text message.
pub type Responder = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// How the broker treats each connection.
#[derive(Clone)]
pub enum Mode {
    /// Writes every received byte straight back.
    Echo,
    /// Writes the greeting, then closes the connection.
    Hangup(Vec<u8>),
    /// Accepts a WebSocket upgrade and answers text messages.
    WebSocket(Responder),
}

impl Mode {
    /// WebSocket mode that echoes every text message.
    pub fn websocket_echo() -> Self {
        Mode::WebSocket(Arc::new(|message: &str| vec![message.to_string()]))
    }
}

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const HANGUP_DRAIN: Duration = Duration::from_millis(200);

pub struct Broker {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
    exit: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Broker {
    /// Starts a plain TCP broker.
    pub fn start(mode: Mode) -> eyre::Result<Self> {
        Self::start_with(mode, None)
    }

    /// Starts a broker, terminating TLS with `tls` when given.
    pub fn start_with(mode: Mode, tls: Option<Arc<ServerConfig>>) -> eyre::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").wrap_err("binding broker")?;
        listener
            .set_nonblocking(true)
            .wrap_err("setting listener non-blocking")?;
        let addr = listener.local_addr().wrap_err("broker address")?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let (exit, exit_rx) = oneshot::channel();

        let handle = {
            let received = Arc::clone(&received);
            thread::Builder::new()
                .name("test-broker".to_string())
                .spawn(move || accept_loop(listener, exit_rx, mode, tls, received))
                .wrap_err("spawning broker")?
        };
        tracing::debug!(%addr, "broker listening");

        Ok(Self {
            addr,
            received,
            exit: Some(exit),
            handle: Some(handle),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Text messages received over WebSocket so far, in arrival order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if let Some(exit) = self.exit.take() {
            let _ = exit.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    exit: oneshot::Receiver<()>,
    mode: Mode,
    tls: Option<Arc<ServerConfig>>,
    received: Arc<Mutex<Vec<String>>>,
) {
    loop {
        match exit.try_recv() {
            Err(oneshot::TryRecvError::Empty) => {}
            _ => break,
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "broker accepted connection");
                let mode = mode.clone();
                let tls = tls.clone();
                let received = Arc::clone(&received);
                // connection threads are detached; they end with their socket
                thread::spawn(move || {
                    if let Err(e) = serve(stream, mode, tls, received) {
                        tracing::debug!(error = %e, "broker connection ended");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::warn!(%e, "broker accept failed");
                break;
            }
        }
    }
}

fn serve(
    stream: TcpStream,
    mode: Mode,
    tls: Option<Arc<ServerConfig>>,
    received: Arc<Mutex<Vec<String>>>,
) -> eyre::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    if matches!(mode, Mode::Hangup(_)) {
        stream.set_read_timeout(Some(HANGUP_DRAIN))?;
    }
    match tls {
        None => serve_stream(stream, mode, received),
        Some(config) => {
            let connection = ServerConnection::new(config).wrap_err("TLS session")?;
            let mut stream = StreamOwned::new(connection, stream);
            while stream.conn.is_handshaking() {
                stream
                    .conn
                    .complete_io(&mut stream.sock)
                    .wrap_err("TLS handshake")?;
            }
            serve_stream(stream, mode, received)
        }
    }
}

fn serve_stream<S: Read + Write>(
    mut stream: S,
    mode: Mode,
    received: Arc<Mutex<Vec<String>>>,
) -> eyre::Result<()> {
    match mode {
        Mode::Echo => {
            let mut buffer = [0u8; 4096];
            loop {
                let n = stream.read(&mut buffer)?;
                if n == 0 {
                    return Ok(());
                }
                stream.write_all(&buffer[..n])?;
                stream.flush()?;
            }
        }
        Mode::Hangup(greeting) => {
            stream.write_all(&greeting)?;
            stream.flush()?;
            // closing with unread input would reset the connection
            let mut buffer = [0u8; 4096];
            while let Ok(n) = stream.read(&mut buffer) {
                if n == 0 {
                    break;
                }
            }
            Ok(())
        }
        Mode::WebSocket(responder) => {
            let mut socket = tungstenite::accept(stream)
                .map_err(|e| eyre::eyre!("websocket upgrade: {e}"))?;
            loop {
                match socket.read() {
                    Ok(Message::Text(text)) => {
                        if let Ok(mut received) = received.lock() {
                            received.push(text.clone());
                        }
                        for reply in responder(&text) {
                            socket.send(Message::Text(reply))?;
                        }
                    }
                    Ok(Message::Close(_)) => {}
                    Ok(_) => {}
                    Err(
                        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                    ) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}
