//! Message framing on top of a byte stream.
//!
//! A framing engine never touches a socket. The [`crate::Channel`] feeds it
//! whatever bytes the session read, and the engine hands bytes it wants sent
//! to the [`Sink`] it was built with. Complete messages are delivered to the
//! handler registered with [`FramingEngine::on_message`].

use std::sync::Arc;

use bytes::Bytes;

use crate::Result;

pub mod websocket;

/// Write path handed to an engine; usually [`crate::Session::write`].
pub type Sink = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Receives every complete text message an engine decodes.
pub type MessageHandler = Box<dyn FnMut(String) + Send>;

/// Builds a client-mode engine for a target URL.
pub type EngineFactory =
    Arc<dyn Fn(Sink, &str) -> Result<Box<dyn FramingEngine>> + Send + Sync>;

/// A client-side message protocol driven by raw bytes.
pub trait FramingEngine: Send {
    /// Registers the handler for decoded messages, replacing any previous one.
    fn on_message(&mut self, handler: MessageHandler);

    /// Begins the protocol's opening handshake.
    fn start(&mut self) -> Result<()>;

    /// Consumes bytes read from the stream. May emit messages and may write.
    fn parse(&mut self, data: &[u8]) -> Result<()>;

    /// Sends a text message. Messages sent before the opening handshake
    /// completes are queued and flushed, in order, once it does.
    fn text(&mut self, message: &str) -> Result<()>;

    /// Starts the protocol's closing handshake. Best effort.
    fn close(&mut self);

    /// Whether the opening handshake has completed and the engine can carry
    /// messages.
    fn is_open(&self) -> bool;
}

/// The default factory: WebSocket engines.
pub fn websocket() -> EngineFactory {
    Arc::new(|sink, url| {
        let engine: Box<dyn FramingEngine> = Box::new(websocket::WebSocketEngine::client(sink, url));
        Ok(engine)
    })
}
