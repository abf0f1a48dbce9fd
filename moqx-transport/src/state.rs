//! Connection and flow records.
//!
//! ```text
//! TransportState
//!   └─ conns: ConnId ──► ConnectionRecord
//!                          ├─ flows:      FlowId   ──► FlowRecord ──► Arc<SendQueue>
//!                          ├─ tx_streams: StreamId ──► FlowId
//!                          ├─ rx_streams: StreamId ──► RxStream ──► Arc<StreamBuffer>
//!                          ├─ dgram_tx:   Arc<SendQueue>
//!                          ├─ dgram_rx:   Arc<DatagramQueue>
//!                          └─ reassembly: ReassemblyRing
//! ```
//!
//! Everything here lives behind the transport's state lock. The send
//! queues ([`SendQueue`]) carry their own lock so producers can
//! push without holding the state lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---

use bytes::Bytes;
use parking_lot::Mutex;

// ---

use moqx_domain::{
    // ---
    ClockPtr,
    ConnId,
    ConnectionMetrics,
    DatagramQueue,
    FlowId,
    FlowMetrics,
    PriorityQueue,
    Role,
    SendUnit,
    StreamAction,
    StreamBuffer,
    StreamId,
    TransportConfig,
    TransportStatus,
};

// ---

use crate::fragment::ReassemblyRing;

// ---------------------------------------------------------------------------
// Send queues
// ---------------------------------------------------------------------------

/// A send queue plus the "activation already requested" flag.
///
/// Producers push first and then swap the flag; the network thread clears
/// the flag before it services the queue. A push can therefore never land
/// between a service pass and the next activation request unnoticed.
#[derive(Debug)]
pub(crate) struct SendQueue {
    // ---
    pub queue: Mutex<PriorityQueue<SendUnit>>,
    activation_pending: AtomicBool,
}

impl SendQueue {
    // ---
    pub fn new(config: &TransportConfig, clock: ClockPtr) -> Self {
        // ---
        Self {
            queue: Mutex::new(PriorityQueue::new(
                config.time_queue_max_duration_ms,
                config.time_queue_init_queue_size,
                clock,
            )),
            activation_pending: AtomicBool::new(false),
        }
    }

    /// Returns `true` if the caller must send an activation request.
    pub fn request_activation(&self) -> bool {
        !self.activation_pending.swap(true, Ordering::AcqRel)
    }

    pub fn clear_activation(&self) {
        self.activation_pending.store(false, Ordering::Release);
    }

    pub fn size(&self) -> usize {
        self.queue.lock().size()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// TxObject
// ---------------------------------------------------------------------------

/// The object currently being written to a flow's stream.
#[derive(Debug)]
pub(crate) struct TxObject {
    // ---
    pub data: Bytes,
    pub offset: usize,
    pub enqueued_at: Duration,
}

impl TxObject {
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

// ---------------------------------------------------------------------------
// FlowRecord
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct FlowRecord {
    // ---
    pub reliable: bool,
    pub bidir: bool,
    pub priority: u8,

    /// At most one open stream at a time.
    pub current_stream: Option<StreamId>,

    /// Bytes written to `current_stream` so far.
    pub stream_tx_bytes: u64,

    /// Replacement requested by the most recent enqueue that asked for one.
    pub pending_action: StreamAction,

    pub tx_object: Option<TxObject>,
    pub tx: Arc<SendQueue>,

    /// Drop queued units until one carries a stream action.
    pub discard_mode: bool,

    /// Remove the record once the queue drains.
    pub delete_on_empty: bool,

    /// Clock reading (ms) of the previous prepare callback.
    pub last_tx_tick: Option<u64>,

    pub metrics: FlowMetrics,
}

impl FlowRecord {
    // ---
    pub fn new(reliable: bool, bidir: bool, priority: u8, tx: Arc<SendQueue>) -> Self {
        // ---
        Self {
            reliable,
            bidir,
            priority,
            current_stream: None,
            stream_tx_bytes: 0,
            pending_action: StreamAction::NoAction,
            tx_object: None,
            tx,
            discard_mode: false,
            delete_on_empty: false,
            last_tx_tick: None,
            metrics: FlowMetrics::default(),
        }
    }

    /// Units still owed to the engine: queued plus the partial object.
    pub fn backlog(&self) -> usize {
        self.tx.size() + usize::from(self.tx_object.is_some())
    }
}

// ---------------------------------------------------------------------------
// RxStream
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct RxStream {
    // ---
    pub buffer: Arc<StreamBuffer>,
    pub flow: Option<FlowId>,

    /// Set on every garbage-collection pass; a closed buffer is removed on
    /// the pass after it was first seen, even if the application never
    /// drained it.
    pub checked_once: bool,
}

impl RxStream {
    pub fn new(flow: Option<FlowId>) -> Self {
        Self {
            buffer: Arc::new(StreamBuffer::new()),
            flow,
            checked_once: false,
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionRecord
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct ConnectionRecord {
    // ---
    pub conn_id: ConnId,
    pub peer: SocketAddr,
    pub role: Role,
    pub status: TransportStatus,

    next_flow_id: u64,
    next_bidir_index: u64,
    next_uni_index: u64,
    pub next_msg_id: u64,

    pub flows: HashMap<FlowId, FlowRecord>,

    /// Locally driven streams and the flow that owns each.
    pub tx_streams: HashMap<StreamId, FlowId>,
    pub rx_streams: HashMap<StreamId, RxStream>,

    pub dgram_tx: Arc<SendQueue>,
    pub dgram_rx: Arc<DatagramQueue>,
    pub reassembly: Arc<Mutex<ReassemblyRing>>,

    pub congested: bool,
    /// Consecutive clean sweeps while congested.
    pub not_congested_gauge: u32,

    pub prev_retransmits: u64,
    pub metrics: ConnectionMetrics,
}

impl ConnectionRecord {
    // ---
    pub fn new(
        conn_id: ConnId,
        peer: SocketAddr,
        role: Role,
        config: &TransportConfig,
        clock: ClockPtr,
    ) -> Self {
        // ---
        Self {
            conn_id,
            peer,
            role,
            status: TransportStatus::Connecting,
            next_flow_id: 1,
            next_bidir_index: 0,
            next_uni_index: 0,
            next_msg_id: 1,
            flows: HashMap::new(),
            tx_streams: HashMap::new(),
            rx_streams: HashMap::new(),
            dgram_tx: Arc::new(SendQueue::new(config, clock)),
            dgram_rx: Arc::new(DatagramQueue::new(config.time_queue_rx_size)),
            reassembly: Arc::new(Mutex::new(ReassemblyRing::default())),
            congested: false,
            not_congested_gauge: 0,
            prev_retransmits: 0,
            metrics: ConnectionMetrics::default(),
        }
    }

    pub fn allocate_flow_id(&mut self) -> FlowId {
        // ---
        let id = FlowId(self.next_flow_id);
        self.next_flow_id += 1;
        id
    }

    fn allocate_stream_id(&mut self, bidir: bool) -> StreamId {
        // ---
        let counter = if bidir {
            &mut self.next_bidir_index
        } else {
            &mut self.next_uni_index
        };
        let id = StreamId::new(self.role, bidir, *counter);
        *counter += 1;
        id
    }

    /// Give `flow` a fresh locally initiated stream. The flow must not have
    /// a current stream.
    pub fn open_stream(&mut self, flow_id: FlowId) -> Option<StreamId> {
        // ---
        let bidir = self.flows.get(&flow_id)?.bidir;
        let stream = self.allocate_stream_id(bidir);

        let flow = self.flows.get_mut(&flow_id)?;
        debug_assert!(flow.current_stream.is_none());
        flow.current_stream = Some(stream);
        flow.stream_tx_bytes = 0;
        self.tx_streams.insert(stream, flow_id);

        if bidir {
            // The peer may answer on our bidirectional stream.
            self.rx_streams.insert(stream, RxStream::new(Some(flow_id)));
        }
        Some(stream)
    }

    /// Detach `stream` from its flow. With `drop_rx` its receive buffer is
    /// closed and dropped as well.
    pub fn release_stream(&mut self, stream: StreamId, drop_rx: bool) {
        // ---
        if let Some(flow_id) = self.tx_streams.remove(&stream) {
            if let Some(flow) = self.flows.get_mut(&flow_id) {
                if flow.current_stream == Some(stream) {
                    flow.current_stream = None;
                }
            }
        }
        if !drop_rx {
            return;
        }
        if let Some(rx) = self.rx_streams.remove(&stream) {
            rx.buffer.close();
        }
    }

    /// Queued or partially written units across every flow and the
    /// datagram queue.
    pub fn pending_units(&self) -> usize {
        self.flows.values().map(FlowRecord::backlog).sum::<usize>() + self.dgram_tx.size()
    }
}

// ---------------------------------------------------------------------------
// TransportState
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct TransportState {
    // ---
    pub conns: HashMap<ConnId, ConnectionRecord>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
