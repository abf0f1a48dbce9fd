//! Application callback surface.
//!
//! Every method is invoked on the transport's notifier thread, never on the
//! network thread, so a slow implementation delays other notifications but
//! never packet processing. All methods default to no-ops.

use std::net::SocketAddr;
use std::sync::Arc;

// ---

use serde::Serialize;

// ---

use super::ids::{ConnId, FlowId, StreamId};
use super::metrics::{ConnectionMetrics, FlowMetrics};

// ---------------------------------------------------------------------------
// TransportStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a transport or of one of its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransportStatus {
    // ---
    Connecting,
    Ready,

    /// Peer closed the connection.
    RemoteRequestClose,

    /// Closed locally, by idle timeout, or by error.
    Disconnected,

    /// Transport stopped; no further callbacks follow.
    Shutdown,
}

/// Why a connection left the `Ready` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DisconnectReason {
    // ---
    IdleTimeout,
    RemoteClose,
    LocalShutdown,
    Unreachable,
    Error,
}

// ---------------------------------------------------------------------------
// StreamCloseReason
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StreamCloseReason {
    Fin,
    Reset,
}

// ---------------------------------------------------------------------------
// TransportDelegate
// ---------------------------------------------------------------------------

/// Implemented once per application.
pub trait TransportDelegate: Send + Sync {
    // ---
    /// `reason` is set for every status other than `Connecting` and `Ready`.
    fn on_connection_status(
        &self,
        conn: ConnId,
        status: TransportStatus,
        reason: Option<DisconnectReason>,
    ) {
        let _ = (conn, status, reason);
    }

    fn on_new_connection(&self, conn: ConnId, peer: SocketAddr) {
        let _ = (conn, peer);
    }

    /// A peer-initiated bidirectional stream produced a new flow.
    fn on_new_flow(&self, conn: ConnId, flow: FlowId) {
        let _ = (conn, flow);
    }

    /// Bytes are available. `stream` is `None` for datagrams; drain with
    /// `dequeue_datagram` or the stream's receive buffer.
    fn on_recv_ready(&self, conn: ConnId, stream: Option<StreamId>, flow: Option<FlowId>) {
        let _ = (conn, stream, flow);
    }

    fn on_stream_closed(&self, conn: ConnId, stream: StreamId, reason: StreamCloseReason) {
        let _ = (conn, stream, reason);
    }

    fn on_connection_metrics(&self, conn: ConnId, metrics: &ConnectionMetrics) {
        let _ = (conn, metrics);
    }

    fn on_flow_metrics(&self, conn: ConnId, flow: FlowId, metrics: &FlowMetrics) {
        let _ = (conn, flow, metrics);
    }
}

pub type TransportDelegatePtr = Arc<dyn TransportDelegate>;
