//! Outbound half of the simulated engine.
//!
//! [`LinkSimControl`] records what the core asks for. Stream activity and
//! priorities take effect immediately; FIN, reset and close are queued and
//! sent by the engine only after the data written in the current callback,
//! so a FIN always follows the bytes that precede it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

// ---

use parking_lot::Mutex;

// ---

use moqx_domain::{ConnId, EngineControl, PathQuality, StreamId};

// ---------------------------------------------------------------------------
// LinkSimHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PathState {
    // ---
    cwin_bytes: u64,
    rtt_us: u64,
    retransmits: u64,
    lost: u64,
    tx_bytes: u64,
    rx_bytes: u64,
}

/// Shared view of one side's simulated path.
///
/// Tests keep a clone to change the congestion window or inject
/// retransmits while the engine runs on the network thread.
#[derive(Debug, Clone, Default)]
pub struct LinkSimHandle {
    // ---
    inner: Arc<Mutex<PathState>>,
}

impl LinkSimHandle {
    // ---
    pub(crate) fn new(cwin_bytes: u64, rtt_us: u64) -> Self {
        // ---
        let state = PathState {
            cwin_bytes,
            rtt_us,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn set_cwin(&self, bytes: u64) {
        self.inner.lock().cwin_bytes = bytes;
    }

    pub fn add_retransmits(&self, n: u64) {
        self.inner.lock().retransmits += n;
    }

    /// Datagrams dropped by the link so far.
    pub fn lost(&self) -> u64 {
        self.inner.lock().lost
    }

    /// Payload bytes sent so far.
    pub fn tx_bytes(&self) -> u64 {
        self.inner.lock().tx_bytes
    }

    pub fn rx_bytes(&self) -> u64 {
        self.inner.lock().rx_bytes
    }

    pub(crate) fn record_tx(&self, bytes: usize) {
        self.inner.lock().tx_bytes += bytes as u64;
    }

    pub(crate) fn record_rx(&self, bytes: usize) {
        self.inner.lock().rx_bytes += bytes as u64;
    }

    pub(crate) fn record_loss(&self) {
        self.inner.lock().lost += 1;
    }
}

// ---------------------------------------------------------------------------
// LinkSimControl
// ---------------------------------------------------------------------------

/// Deferred operations, applied in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CtlOp {
    Finish(StreamId),
    Reset(StreamId, u64),
    Close(u64),
}

#[derive(Debug)]
pub(crate) struct LinkSimControl {
    // ---
    /// The one connection this engine carries, once known.
    pub conn: Option<ConnId>,

    active: HashSet<StreamId>,
    priorities: HashMap<StreamId, u8>,
    pub dgram_ready: bool,

    ops: Vec<CtlOp>,
    handle: LinkSimHandle,

    /// Previous path sample for rate computation.
    last_sample: Option<(Instant, u64, u64)>,
}

impl LinkSimControl {
    // ---
    pub fn new(handle: LinkSimHandle) -> Self {
        // ---
        Self {
            conn: None,
            active: HashSet::new(),
            priorities: HashMap::new(),
            dgram_ready: false,
            ops: Vec::new(),
            handle,
            last_sample: None,
        }
    }

    /// Active streams, most urgent first. Ties break on stream id.
    pub fn active_streams(&self) -> Vec<StreamId> {
        // ---
        let mut streams: Vec<StreamId> = self.active.iter().copied().collect();
        streams.sort_by_key(|s| (self.priorities.get(s).copied().unwrap_or(u8::MAX), *s));
        streams
    }

    pub fn set_active(&mut self, stream: StreamId, active: bool) {
        if active {
            self.active.insert(stream);
        } else {
            self.active.remove(&stream);
        }
    }

    pub fn has_work(&self) -> bool {
        self.conn.is_some() && (!self.active.is_empty() || self.dgram_ready)
    }

    pub fn take_ops(&mut self) -> Vec<CtlOp> {
        std::mem::take(&mut self.ops)
    }

    /// Forget a stream that was finished or reset.
    pub fn forget(&mut self, stream: StreamId) {
        self.active.remove(&stream);
        self.priorities.remove(&stream);
    }

    /// Connection gone: drop every per-connection bit of state.
    pub fn clear(&mut self) {
        // ---
        self.conn = None;
        self.active.clear();
        self.priorities.clear();
        self.dgram_ready = false;
        self.ops.clear();
    }

    fn is_current(&self, conn: ConnId) -> bool {
        self.conn == Some(conn)
    }
}

impl EngineControl for LinkSimControl {
    // ---
    fn mark_stream_active(&mut self, conn: ConnId, stream: StreamId, active: bool) {
        if self.is_current(conn) {
            self.set_active(stream, active);
        }
    }

    fn mark_datagram_ready(&mut self, conn: ConnId, ready: bool) {
        if self.is_current(conn) {
            self.dgram_ready = ready;
        }
    }

    fn set_stream_priority(&mut self, conn: ConnId, stream: StreamId, priority: u8) {
        if self.is_current(conn) {
            self.priorities.insert(stream, priority);
        }
    }

    fn reset_stream(&mut self, conn: ConnId, stream: StreamId, code: u64) {
        if self.is_current(conn) {
            self.ops.push(CtlOp::Reset(stream, code));
        }
    }

    fn finish_stream(&mut self, conn: ConnId, stream: StreamId) {
        if self.is_current(conn) {
            self.ops.push(CtlOp::Finish(stream));
        }
    }

    fn close_connection(&mut self, conn: ConnId, code: u64) {
        if self.is_current(conn) {
            self.ops.push(CtlOp::Close(code));
        }
    }

    fn path_quality(&mut self, conn: ConnId) -> Option<PathQuality> {
        // ---
        if !self.is_current(conn) {
            return None;
        }
        let (cwin, rtt, retransmits, lost, tx, rx) = {
            let s = self.handle.inner.lock();
            (s.cwin_bytes, s.rtt_us, s.retransmits, s.lost, s.tx_bytes, s.rx_bytes)
        };

        let now = Instant::now();
        let (tx_rate_bps, rx_rate_bps) = match self.last_sample {
            Some((at, prev_tx, prev_rx)) => {
                let secs = now.duration_since(at).as_secs_f64().max(1e-3);
                (
                    (tx.saturating_sub(prev_tx) as f64 * 8.0 / secs) as u64,
                    (rx.saturating_sub(prev_rx) as f64 * 8.0 / secs) as u64,
                )
            }
            None => (0, 0),
        };
        self.last_sample = Some((now, tx, rx));

        Some(PathQuality {
            rtt_us: rtt,
            srtt_us: rtt,
            cwin_bytes: cwin,
            bytes_in_transit: 0,
            retransmits,
            lost_packets: lost,
            timer_losses: 0,
            spurious_losses: 0,
            tx_rate_bps,
            rx_rate_bps,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
