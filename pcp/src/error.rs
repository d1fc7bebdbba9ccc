use transport::TransportError;

/// Errors returned by [`crate::Client`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An inbound payload is not a valid envelope.
    #[error("could not decode envelope: {0}")]
    Decode(String),

    #[error("could not encode envelope: {0}")]
    Encode(String),

    /// The client certificate has no usable subject common name.
    #[error("could not derive the client identity: {0}")]
    Identity(String),

    /// The connection ended and no more messages will arrive.
    #[error("connection to the broker is closed")]
    Closed,
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
