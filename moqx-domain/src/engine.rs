//! Contract between the transport core and a QUIC protocol engine.
//!
//! ```text
//!              ┌──────────────── network thread ────────────────┐
//!              │                                                 │
//!   app ──► runner queue ──► core ──(EngineControl)──► engine    │
//!              │              ▲                          │       │
//!              │              └──────(EngineEvents)──────┘       │
//!              └─────────────────────────────────────────────────┘
//! ```
//!
//! The engine is owned by the network thread and is never touched from
//! anywhere else. Inbound callbacks receive a `&mut dyn EngineControl` so
//! the core can issue outbound calls (mark active, reset, FIN...) from
//! inside a callback without holding a second reference to the engine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// ---

use bytes::Bytes;
use serde::Serialize;

// ---

use super::error::Result;
use super::ids::{ConnId, Role, StreamId};

// ---------------------------------------------------------------------------
// Engine-side value types
// ---------------------------------------------------------------------------

/// Wakes the network thread out of a blocking [`QuicEngine::poll`].
pub type EngineWaker = Arc<dyn Fn() + Send + Sync>;

/// Path statistics sampled by the congestion monitor.
///
/// Counters (`retransmits`, `lost_packets`, ...) are cumulative for the
/// connection; the core computes deltas itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PathQuality {
    // ---
    pub rtt_us: u64,
    pub srtt_us: u64,
    pub cwin_bytes: u64,
    pub bytes_in_transit: u64,
    pub retransmits: u64,
    pub lost_packets: u64,
    pub timer_losses: u64,
    pub spurious_losses: u64,
    pub tx_rate_bps: u64,
    pub rx_rate_bps: u64,
}

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    // ---
    IdleTimeout,

    /// Peer closed with an application or transport code.
    RemoteClose { code: u64 },

    /// Closed from this side (application close or transport shutdown).
    LocalClose { code: u64 },

    /// Handshake never completed.
    Unreachable,

    Error(String),
}

/// Delivery feedback for one sent datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramStatus {
    Acked,
    Lost,
    /// Declared lost, later acknowledged.
    Spurious,
}

// ---------------------------------------------------------------------------
// SendBuffer
// ---------------------------------------------------------------------------

/// Destination the engine offers for one stream or datagram write.
pub trait SendBuffer {
    // ---
    /// Most bytes the engine will accept in this call.
    fn max_len(&self) -> usize;

    /// Claim `len` bytes (`len <= max_len`) and report whether the caller
    /// wants to be called again.
    ///
    /// `len == 0` is allowed and only updates the active flag. Returns
    /// `None` if the engine cannot allocate the buffer.
    fn provide(&mut self, len: usize, still_active: bool) -> Option<&mut [u8]>;
}

/// Heap-backed [`SendBuffer`] used by the bundled engines and tests.
#[derive(Debug, Clone)]
pub struct VecSendBuffer {
    // ---
    max_len: usize,
    data: Vec<u8>,
    still_active: bool,
    provided: bool,
    fail_alloc: bool,
}

impl VecSendBuffer {
    // ---
    pub fn new(max_len: usize) -> Self {
        // ---
        Self {
            max_len,
            data: Vec::new(),
            still_active: false,
            provided: false,
            fail_alloc: false,
        }
    }

    /// A buffer whose every non-empty `provide` fails.
    pub fn failing(max_len: usize) -> Self {
        Self {
            fail_alloc: true,
            ..Self::new(max_len)
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.data)
    }

    pub fn still_active(&self) -> bool {
        self.still_active
    }

    /// `true` once `provide` has been called, even with zero length.
    pub fn was_provided(&self) -> bool {
        self.provided
    }
}

impl SendBuffer for VecSendBuffer {
    // ---
    fn max_len(&self) -> usize {
        self.max_len
    }

    fn provide(&mut self, len: usize, still_active: bool) -> Option<&mut [u8]> {
        // ---
        if len > self.max_len || (len > 0 && self.fail_alloc) {
            return None;
        }
        self.provided = true;
        self.still_active = still_active;
        self.data = vec![0; len];
        Some(&mut self.data)
    }
}

// ---------------------------------------------------------------------------
// EngineControl
// ---------------------------------------------------------------------------

/// Outbound calls from the core into the engine.
pub trait EngineControl {
    // ---
    /// Tell the engine whether `stream` has data to send. Opens the stream
    /// on the engine side if it does not exist yet.
    fn mark_stream_active(&mut self, conn: ConnId, stream: StreamId, active: bool);

    fn mark_datagram_ready(&mut self, conn: ConnId, ready: bool);

    /// `priority` is the engine value (see `Priority::engine_value`).
    fn set_stream_priority(&mut self, conn: ConnId, stream: StreamId, priority: u8);

    fn reset_stream(&mut self, conn: ConnId, stream: StreamId, code: u64);

    /// Zero-length write with FIN.
    fn finish_stream(&mut self, conn: ConnId, stream: StreamId);

    fn close_connection(&mut self, conn: ConnId, code: u64);

    fn path_quality(&mut self, conn: ConnId) -> Option<PathQuality>;
}

// ---------------------------------------------------------------------------
// EngineEvents
// ---------------------------------------------------------------------------

/// Inbound callbacks from the engine into the core.
///
/// Implementations must never panic or block; errors are handled inside.
pub trait EngineEvents {
    // ---
    fn on_connection_ready(
        &mut self,
        ctl: &mut dyn EngineControl,
        conn: ConnId,
        peer: SocketAddr,
        role: Role,
    );

    fn on_connection_closed(&mut self, ctl: &mut dyn EngineControl, conn: ConnId, reason: CloseReason);

    fn prepare_datagram(&mut self, ctl: &mut dyn EngineControl, conn: ConnId, buf: &mut dyn SendBuffer);

    fn on_datagram(&mut self, ctl: &mut dyn EngineControl, conn: ConnId, data: Bytes);

    fn on_datagram_status(&mut self, conn: ConnId, status: DatagramStatus) {
        let _ = (conn, status);
    }

    fn prepare_to_send(
        &mut self,
        ctl: &mut dyn EngineControl,
        conn: ConnId,
        stream: StreamId,
        buf: &mut dyn SendBuffer,
    );

    fn on_stream_data(
        &mut self,
        ctl: &mut dyn EngineControl,
        conn: ConnId,
        stream: StreamId,
        data: Bytes,
        fin: bool,
    );

    fn on_stream_reset(&mut self, ctl: &mut dyn EngineControl, conn: ConnId, stream: StreamId);

    /// Called at the end of every poll; the core runs its timers from here.
    fn on_time_check(&mut self, ctl: &mut dyn EngineControl);
}

// ---------------------------------------------------------------------------
// QuicEngine
// ---------------------------------------------------------------------------

/// A QUIC protocol engine the transport can drive.
///
/// Implementations: `moqx_quic::QuinnEngine`, `moqx_link_sim::LinkSimEngine`.
pub trait QuicEngine: Send + 'static {
    // ---
    /// Start a client connection. The connection is reported ready later
    /// through [`EngineEvents::on_connection_ready`].
    fn connect(&mut self, remote: SocketAddr, server_name: &str) -> Result<ConnId>;

    fn control(&mut self) -> &mut dyn EngineControl;

    fn waker(&self) -> EngineWaker;

    /// Process I/O for at most `max_wait`, dispatching every callback to
    /// `events`. Returns early when woken.
    fn poll(&mut self, max_wait: Duration, events: &mut dyn EngineEvents) -> Result<()>;

    /// Close every connection and release sockets.
    fn shutdown(&mut self);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn vec_send_buffer_honours_limits() {
        // ---
        let mut buf = VecSendBuffer::new(4);
        assert!(buf.provide(5, true).is_none(), "over max_len must fail");
        assert!(!buf.was_provided());

        let dst = buf.provide(3, true).unwrap();
        dst.copy_from_slice(b"abc");
        assert_eq!(buf.data(), b"abc");
        assert!(buf.still_active());

        let mut failing = VecSendBuffer::failing(8);
        assert!(failing.provide(1, true).is_none());
        assert!(failing.provide(0, false).is_some(), "zero-length provide never allocates");
    }
}
