use std::net::SocketAddr;

// ---

use bytes::Bytes;

// ---

use moqx_domain::StreamId;

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// Unit carried by the simulated link, one crossbeam message each.
///
/// Stream ids are the QUIC ids chosen by the opening side and mean the same
/// on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    // ---
    /// Client ──► server: open the connection.
    Hello { addr: SocketAddr },

    /// Server ──► client: connection accepted.
    HelloAck { addr: SocketAddr },

    StreamData { stream: StreamId, data: Bytes },

    Fin { stream: StreamId },

    Reset { stream: StreamId, code: u64 },

    Datagram(Bytes),

    Close { code: u64 },

    /// Local only: ends a blocking wait early.
    Wake,
}
