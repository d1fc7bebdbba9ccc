//! WebSocket framing using tungstenite's sans-IO style handshake and codec.
//!
//! tungstenite wants a `Read + Write` stream. [`Pipe`] is that stream: reads
//! come from bytes the channel has fed in and report `WouldBlock` when they
//! run out, writes go straight to the sink.

use std::io::{self, Read, Write};
use std::mem;

use bytes::{Buf, Bytes, BytesMut};
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::client::ClientHandshake;
use tungstenite::handshake::{HandshakeError, MidHandshake};
use tungstenite::{Message, WebSocket};

use super::{FramingEngine, MessageHandler, Sink};
use crate::{Result, TransportError};

struct Pipe {
    incoming: BytesMut,
    sink: Sink,
}

impl Pipe {
    fn new(sink: Sink) -> Self {
        Self {
            incoming: BytesMut::new(),
            sink,
        }
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.incoming.len());
        buf[..n].copy_from_slice(&self.incoming[..n]);
        self.incoming.advance(n);
        Ok(n)
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (self.sink)(Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Phase {
    Idle,
    Handshaking(MidHandshake<ClientHandshake<Pipe>>),
    Open(WebSocket<Pipe>),
    Closed,
}

enum Drained {
    Pending,
    PeerClosed,
    Failed(tungstenite::Error),
}

/// Client-mode WebSocket engine.
pub struct WebSocketEngine {
    url: String,
    sink: Sink,
    phase: Phase,
    pending: Vec<String>,
    handler: Option<MessageHandler>,
}

fn framing(e: impl std::fmt::Display) -> TransportError {
    TransportError::Framing(e.to_string())
}

impl WebSocketEngine {
    /// Creates an idle engine that will upgrade `url` once started.
    pub fn client(sink: Sink, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sink,
            phase: Phase::Idle,
            pending: Vec::new(),
            handler: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn advance_handshake(&mut self, handshake: MidHandshake<ClientHandshake<Pipe>>) -> Result<()> {
        match handshake.handshake() {
            Ok((mut socket, response)) => {
                tracing::debug!(url = %self.url, status = %response.status(), "websocket open");
                for message in mem::take(&mut self.pending) {
                    if let Err(e) = socket.send(Message::Text(message)) {
                        self.phase = Phase::Closed;
                        return Err(framing(e));
                    }
                }
                self.phase = Phase::Open(socket);
                // the server may have pipelined frames behind its response
                self.read_messages()
            }
            Err(HandshakeError::Interrupted(handshake)) => {
                self.phase = Phase::Handshaking(handshake);
                Ok(())
            }
            Err(HandshakeError::Failure(e)) => {
                self.phase = Phase::Closed;
                self.pending.clear();
                Err(framing(format!("websocket handshake with {} failed: {e}", self.url)))
            }
        }
    }

    fn read_messages(&mut self) -> Result<()> {
        let Phase::Open(socket) = &mut self.phase else {
            return Ok(());
        };

        let drained = loop {
            match socket.read() {
                Ok(Message::Text(text)) => {
                    if let Some(handler) = self.handler.as_mut() {
                        handler(text);
                    }
                }
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => {
                        if let Some(handler) = self.handler.as_mut() {
                            handler(text);
                        }
                    }
                    Err(_) => tracing::warn!("ignoring binary frame that is not UTF-8"),
                },
                Ok(Message::Close(frame)) => {
                    // tungstenite queues the reply; the next read flushes it
                    tracing::debug!(?frame, "peer started the closing handshake");
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    break Drained::Pending
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    break Drained::PeerClosed
                }
                Err(e) => break Drained::Failed(e),
            }
        };

        match drained {
            Drained::Pending => Ok(()),
            Drained::PeerClosed => {
                self.phase = Phase::Closed;
                Ok(())
            }
            Drained::Failed(e) => {
                self.phase = Phase::Closed;
                Err(framing(e))
            }
        }
    }
}

impl FramingEngine for WebSocketEngine {
    fn on_message(&mut self, handler: MessageHandler) {
        self.handler = Some(handler);
    }

    fn start(&mut self) -> Result<()> {
        if !matches!(self.phase, Phase::Idle) {
            return Ok(());
        }
        let request = self.url.as_str().into_client_request().map_err(framing)?;
        let handshake =
            ClientHandshake::start(Pipe::new(self.sink.clone()), request, None).map_err(framing)?;
        self.advance_handshake(handshake)
    }

    fn parse(&mut self, data: &[u8]) -> Result<()> {
        match mem::replace(&mut self.phase, Phase::Closed) {
            Phase::Handshaking(mut handshake) => {
                handshake.get_mut().get_mut().incoming.extend_from_slice(data);
                self.advance_handshake(handshake)
            }
            Phase::Open(mut socket) => {
                socket.get_mut().incoming.extend_from_slice(data);
                self.phase = Phase::Open(socket);
                self.read_messages()
            }
            phase => {
                tracing::trace!(bytes = data.len(), "ignoring bytes outside an open websocket");
                self.phase = phase;
                Ok(())
            }
        }
    }

    fn text(&mut self, message: &str) -> Result<()> {
        match &mut self.phase {
            Phase::Open(socket) => socket.send(Message::Text(message.to_string())).map_err(framing),
            Phase::Idle | Phase::Handshaking(_) => {
                self.pending.push(message.to_string());
                Ok(())
            }
            Phase::Closed => Err(TransportError::Closed),
        }
    }

    fn close(&mut self) {
        if let Phase::Open(socket) = &mut self.phase {
            if let Err(e) = socket.close(None).and_then(|()| socket.flush()) {
                tracing::trace!(error = %e, "sending websocket close frame");
            }
        }
        self.phase = Phase::Closed;
        self.pending.clear();
    }

    fn is_open(&self) -> bool {
        matches!(self.phase, Phase::Open(_))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tungstenite::handshake::derive_accept_key;
    use tungstenite::protocol::Role;

    use super::*;

    #[derive(Clone, Default)]
    struct Wire(Arc<Mutex<Vec<u8>>>);

    impl Wire {
        fn sink(&self) -> Sink {
            let wire = self.clone();
            Arc::new(move |bytes: Bytes| wire.0.lock().unwrap().extend_from_slice(&bytes))
        }

        fn take(&self) -> Vec<u8> {
            mem::take(&mut *self.0.lock().unwrap())
        }
    }

    /// Server side of the conversation, fed by hand.
    struct Loopback {
        incoming: Vec<u8>,
        outgoing: Vec<u8>,
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.incoming.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.incoming.len());
            buf[..n].copy_from_slice(&self.incoming[..n]);
            self.incoming.drain(..n);
            Ok(n)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outgoing.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn upgrade_response(request: &[u8]) -> Vec<u8> {
        let request = String::from_utf8_lossy(request);
        let key = request
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .or_else(|| {
                request
                    .lines()
                    .find_map(|line| line.strip_prefix("sec-websocket-key: "))
            })
            .expect("upgrade request carries a key");
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            derive_accept_key(key.trim().as_bytes())
        )
        .into_bytes()
    }

    fn open_engine() -> (WebSocketEngine, Wire, Arc<Mutex<Vec<String>>>) {
        let wire = Wire::default();
        let received = Arc::new(Mutex::new(Vec::new()));
        let mut engine = WebSocketEngine::client(wire.sink(), "ws://broker.example:8142/pcp/");
        let sink = Arc::clone(&received);
        engine.on_message(Box::new(move |message| sink.lock().unwrap().push(message)));
        engine.start().unwrap();
        let request = wire.take();
        engine.parse(&upgrade_response(&request)).unwrap();
        assert!(engine.is_open());
        (engine, wire, received)
    }

    fn server() -> WebSocket<Loopback> {
        WebSocket::from_raw_socket(
            Loopback {
                incoming: Vec::new(),
                outgoing: Vec::new(),
            },
            Role::Server,
            None,
        )
    }

    #[test]
    fn start_writes_an_upgrade_request() {
        let wire = Wire::default();
        let mut engine = WebSocketEngine::client(wire.sink(), "ws://broker.example:8142/pcp/");
        engine.start().unwrap();

        let request = String::from_utf8(wire.take()).unwrap();
        assert!(request.starts_with("GET /pcp/ HTTP/1.1\r\n"), "{request}");
        assert!(!engine.is_open());
    }

    #[test]
    fn text_before_open_is_flushed_in_order() {
        let wire = Wire::default();
        let mut engine = WebSocketEngine::client(wire.sink(), "ws://broker.example:8142/pcp/");
        engine.start().unwrap();
        engine.text("first").unwrap();
        engine.text("second").unwrap();
        let request = wire.take();

        engine.parse(&upgrade_response(&request)).unwrap();

        let mut server = server();
        server.get_mut().incoming = wire.take();
        assert_eq!(server.read().unwrap(), Message::Text("first".into()));
        assert_eq!(server.read().unwrap(), Message::Text("second".into()));
    }

    #[test]
    fn frames_split_across_chunks_are_reassembled() {
        let (mut engine, _wire, received) = open_engine();

        let mut server = server();
        server.send(Message::Text("hello".into())).unwrap();
        server.send(Message::Text("world".into())).unwrap();
        let frames = mem::take(&mut server.get_mut().outgoing);

        for byte in frames.chunks(1) {
            engine.parse(byte).unwrap();
        }
        assert_eq!(*received.lock().unwrap(), vec!["hello", "world"]);
    }

    #[test]
    fn text_after_close_is_rejected() {
        let (mut engine, _wire, _received) = open_engine();
        engine.close();
        assert!(!engine.is_open());
        assert!(matches!(engine.text("late"), Err(TransportError::Closed)));
    }

    #[test]
    fn rejected_upgrade_is_a_framing_error() {
        let wire = Wire::default();
        let mut engine = WebSocketEngine::client(wire.sink(), "ws://broker.example:8142/pcp/");
        engine.start().unwrap();

        let result = engine.parse(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        assert!(matches!(result, Err(TransportError::Framing(_))));
        assert!(!engine.is_open());
    }
}
