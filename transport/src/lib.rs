//! PCP transport
//!
//! A threaded TCP/TLS [`Session`] with non-blocking reads and writes, and a
//! [`Channel`] that runs a message framing protocol (WebSocket by default)
//! on top of it. Nothing here understands PCP itself; see the `pcp` crate.
use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod bindings;
mod channel;
mod error;
pub mod framing;
mod io;
mod session;
mod settings;
mod tls;
mod worker;

pub use channel::{Channel, Subscriber};
pub use error::{Result, TransportError};
pub use framing::{websocket::WebSocketEngine, FramingEngine};
pub use session::{Session, State, READ_CHUNK_SIZE};
pub use settings::{Settings, DEFAULT_CLOSE_TIMEOUT, DEFAULT_CONNECT_TIMEOUT};
pub use tls::{TlsConfig, TlsConfigBuilder};

/// The default port a PCP broker listens on
pub const DEFAULT_PCP_PORT: u16 = 8142;

pub(crate) fn with_lock<T, F, R>(name: &str, lock: &Mutex<T>, f: F) -> R
where
    F: FnOnce(MutexGuard<'_, T>) -> R,
{
    tracing::trace!(%name, "taking lock");
    // a panicking worker must not wedge close()
    let inner = lock.lock().unwrap_or_else(PoisonError::into_inner);
    let res = f(inner);
    tracing::trace!(%name, "releasing lock");
    res
}
