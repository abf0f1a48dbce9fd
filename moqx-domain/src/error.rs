use thiserror::Error;

// ---

use super::ids::{ConnId, FlowId};

// ---

/// Errors returned from application-facing entry points.
///
/// Errors raised while servicing an engine callback never leave the
/// network thread; they are logged and counted there instead.
#[derive(Debug, Error)]
pub enum TransportError {
    // ---
    #[error("unknown connection {0}")]
    InvalidConnection(ConnId),

    #[error("unknown flow {flow_id} on connection {conn_id}")]
    InvalidFlow { conn_id: ConnId, flow_id: FlowId },

    #[error("runner queue full")]
    QueueFull,

    #[error("notifier queue full")]
    NotifierQueueFull,

    #[error("zero length object rejected")]
    ZeroLengthObject,

    #[error("engine could not allocate a send buffer")]
    EngineBufferAllocationFailed,

    #[error("connection {0} closed during operation")]
    ConnectionClosedDuringOperation(ConnId),

    #[error("priority {0} out of range (0..=127)")]
    InvalidPriority(u8),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("transport not running")]
    NotRunning,

    #[error("engine error: {0}")]
    Engine(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

pub type Result<T> = std::result::Result<T, TransportError>;
