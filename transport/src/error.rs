//! Error types for the transport layer.

use std::io;

/// Errors raised synchronously by [`crate::Session`] and [`crate::Channel`].
///
/// Every variant is logged once, at error level, by the code that detects it
/// before it is returned. None of them is retried internally.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The hostname could not be resolved to any address.
    #[error("could not resolve the hostname \"{hostname}\" to an IP address: {reason}")]
    Resolution {
        /// The hostname that failed to resolve.
        hostname: String,
        /// The resolver's explanation.
        reason: String,
    },

    /// The TCP connection was refused, reset or failed in some other way.
    #[error("connecting to \"{hostname}:{port}\" failed: {source}")]
    Connection {
        /// Target hostname.
        hostname: String,
        /// Target port.
        port: u16,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// The TCP connect or the TLS handshake exceeded its deadline.
    #[error("connection attempt to \"{hostname}:{port}\" timed out after {seconds} seconds")]
    Timeout {
        /// Target hostname.
        hostname: String,
        /// Target port.
        port: u16,
        /// The deadline that was exceeded, in (possibly fractional) seconds.
        seconds: f64,
    },

    /// TLS handshake failure: untrusted CA, revoked certificate, hostname
    /// mismatch or a peer that does not speak TLS.
    #[error("TLS error while connecting to \"{hostname}:{port}\": {reason}")]
    Tls {
        /// Target hostname.
        hostname: String,
        /// Target port.
        port: u16,
        /// What went wrong during the handshake.
        reason: String,
    },

    /// The TLS configuration could not be built from the supplied material.
    #[error("invalid TLS configuration: {0}")]
    TlsConfig(String),

    /// The framing engine rejected the stream (bad WebSocket handshake,
    /// protocol violation).
    #[error("framing error: {0}")]
    Framing(String),

    /// The operation needs an open connection.
    #[error("connection is closed")]
    Closed,
}

impl TransportError {
    pub(crate) fn connection(hostname: &str, port: u16, source: io::Error) -> Self {
        Self::Connection {
            hostname: hostname.to_string(),
            port,
            source,
        }
    }

    pub(crate) fn tls(hostname: &str, port: u16, reason: impl Into<String>) -> Self {
        Self::Tls {
            hostname: hostname.to_string(),
            port,
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = TransportError> = std::result::Result<T, E>;
