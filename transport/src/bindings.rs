//! Helpers for tests and tools that need a local port.

use std::net::TcpListener;

use eyre::Result;

/// Finds a loopback TCP port that nothing is listening on.
///
/// The port is released before returning, so connecting to it is refused
/// until somebody binds it again.
pub fn get_random_tcp_port() -> Result<u16> {
    for _ in 0..50 {
        match TcpListener::bind("127.0.0.1:0").and_then(|listener| listener.local_addr()) {
            Ok(addr) => return Ok(addr.port()),
            Err(e) => {
                tracing::warn!(%e, "binding");
            }
        }
    }

    eyre::bail!("could not get free port");
}
