//! Error types for `moqx-quic`.

use thiserror::Error;

// ---

use moqx_domain::TransportError;

#[derive(Debug, Error)]
pub enum QuicError {
    // ---
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("QUIC connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("QUIC config error: {0}")]
    Config(String),

    #[error("QUIC endpoint error: {0}")]
    Endpoint(#[from] std::io::Error),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("{0}")]
    Unsupported(&'static str),
}

// ---------------------------------------------------------------------------
// Bridge to moqx_domain::TransportError
// ---------------------------------------------------------------------------

impl From<QuicError> for TransportError {
    // ---
    fn from(e: QuicError) -> Self {
        TransportError::Engine(e.to_string())
    }
}
