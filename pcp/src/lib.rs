//! PCP client
//!
//! Builds and sends PCP envelopes over a WebSocket [`transport::Channel`]
//! and queues inbound envelopes for a blocking [`Client::receive`].
mod client;
pub mod envelope;
mod error;
pub mod identity;

pub use client::{Client, ClientOptions, DEFAULT_CLIENT_TYPE};
pub use envelope::{Envelope, EnvelopeOptions};
pub use error::{ClientError, Result};
pub use transport::{Settings, TlsConfig, DEFAULT_PCP_PORT};
