//! [`ChannelDelegate`]: hands transport notifications to the agent task.
//!
//! Callbacks arrive on the transport's notifier thread. They are forwarded
//! over an unbounded tokio channel so the agent can act on them (and call
//! back into the transport) from its own task. Metrics snapshots are only
//! logged.

use std::net::SocketAddr;

// ---

use tokio::sync::mpsc;

// ---

use moqx_domain::{
    // ---
    ConnId,
    ConnectionMetrics,
    DisconnectReason,
    FlowId,
    FlowMetrics,
    StreamCloseReason,
    StreamId,
    TransportDelegate,
    TransportStatus,
};

// ---------------------------------------------------------------------------
// AgentEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    // ---
    Status {
        conn: ConnId,
        status: TransportStatus,
        reason: Option<DisconnectReason>,
    },

    NewConnection {
        conn: ConnId,
        peer: SocketAddr,
    },

    NewFlow {
        conn: ConnId,
        flow: FlowId,
    },

    Recv {
        conn: ConnId,
        stream: Option<StreamId>,
        flow: Option<FlowId>,
    },

    StreamClosed {
        conn: ConnId,
        stream: StreamId,
        reason: StreamCloseReason,
    },
}

pub type AgentEventRx = mpsc::UnboundedReceiver<AgentEvent>;

// ---------------------------------------------------------------------------
// ChannelDelegate
// ---------------------------------------------------------------------------

pub struct ChannelDelegate {
    // ---
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelDelegate {
    // ---
    pub fn new() -> (Self, AgentEventRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: AgentEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("agent gone, notification dropped");
        }
    }
}

impl TransportDelegate for ChannelDelegate {
    // ---
    fn on_connection_status(&self, conn: ConnId, status: TransportStatus, reason: Option<DisconnectReason>) {
        self.forward(AgentEvent::Status { conn, status, reason });
    }

    fn on_new_connection(&self, conn: ConnId, peer: SocketAddr) {
        self.forward(AgentEvent::NewConnection { conn, peer });
    }

    fn on_new_flow(&self, conn: ConnId, flow: FlowId) {
        self.forward(AgentEvent::NewFlow { conn, flow });
    }

    fn on_recv_ready(&self, conn: ConnId, stream: Option<StreamId>, flow: Option<FlowId>) {
        self.forward(AgentEvent::Recv { conn, stream, flow });
    }

    fn on_stream_closed(&self, conn: ConnId, stream: StreamId, reason: StreamCloseReason) {
        self.forward(AgentEvent::StreamClosed { conn, stream, reason });
    }

    fn on_connection_metrics(&self, conn: ConnId, metrics: &ConnectionMetrics) {
        // ---
        match serde_json::to_string(metrics) {
            Ok(json) => tracing::debug!(conn_id = %conn, metrics = %json, "connection metrics"),
            Err(e) => tracing::warn!(conn_id = %conn, "metrics not serializable: {e}"),
        }
    }

    fn on_flow_metrics(&self, conn: ConnId, flow: FlowId, metrics: &FlowMetrics) {
        // ---
        match serde_json::to_string(metrics) {
            Ok(json) => tracing::debug!(conn_id = %conn, flow_id = %flow, metrics = %json, "flow metrics"),
            Err(e) => tracing::warn!(conn_id = %conn, flow_id = %flow, "metrics not serializable: {e}"),
        }
    }
}
