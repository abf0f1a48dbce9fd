//! Deterministic harness for the network core.
//!
//! Drives [`NetworkCore`] directly on the test thread with a recording
//! [`MockControl`] and a [`ManualClock`]. No engine, no threads, no sleeps.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

// ---

use bytes::Bytes;
use tokio::sync::mpsc;

// ---

use moqx_domain::{
    // ---
    CloseReason,
    ConnId,
    ConnectionMetrics,
    EngineControl,
    EngineEvents,
    EngineWaker,
    FlowId,
    FlowMetrics,
    ManualClock,
    PathQuality,
    Role,
    SendUnit,
    StreamAction,
    StreamId,
    TransportConfig,
    VecSendBuffer,
};

// ---

use crate::congestion;
use crate::dispatch::{NetCmd, RunnerTx};
use crate::network::NetworkCore;
use crate::notifier::{Notification, NotifierRx, NotifierTx};
use crate::receive;
use crate::scheduler;
use crate::state::ConnectionRecord;
use crate::transport::{Shared, Transport};

// ---------------------------------------------------------------------------
// MockControl
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CtlCall {
    // ---
    MarkActive { conn: ConnId, stream: StreamId, active: bool },
    DatagramReady { conn: ConnId, ready: bool },
    Priority { conn: ConnId, stream: StreamId, priority: u8 },
    Reset { conn: ConnId, stream: StreamId, code: u64 },
    Finish { conn: ConnId, stream: StreamId },
    Close { conn: ConnId, code: u64 },
}

/// Records every outbound call in order.
#[derive(Debug, Default)]
pub(crate) struct MockControl {
    // ---
    pub calls: Vec<CtlCall>,
    quality: HashMap<ConnId, PathQuality>,
}

impl MockControl {
    // ---
    pub fn set_quality(&mut self, conn: ConnId, quality: PathQuality) {
        self.quality.insert(conn, quality);
    }

    /// Distinct streams in the order they were first marked active.
    pub fn opened_streams(&self) -> Vec<StreamId> {
        // ---
        let mut out = Vec::new();
        for call in &self.calls {
            if let CtlCall::MarkActive { stream, active: true, .. } = call {
                if !out.contains(stream) {
                    out.push(*stream);
                }
            }
        }
        out
    }

    pub fn resets(&self) -> Vec<StreamId> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                CtlCall::Reset { stream, .. } => Some(*stream),
                _ => None,
            })
            .collect()
    }

    pub fn finishes(&self) -> Vec<StreamId> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                CtlCall::Finish { stream, .. } => Some(*stream),
                _ => None,
            })
            .collect()
    }

    pub fn last_priority(&self, stream: StreamId) -> Option<u8> {
        self.calls.iter().rev().find_map(|c| match c {
            CtlCall::Priority { stream: s, priority, .. } if *s == stream => Some(*priority),
            _ => None,
        })
    }

    /// `true` if `old` was reset or finished before `new` was first marked active.
    pub fn closed_before_opened(&self, old: StreamId, new: StreamId) -> bool {
        // ---
        let closed = self.calls.iter().position(|c| {
            matches!(c, CtlCall::Reset { stream, .. } | CtlCall::Finish { stream, .. } if *stream == old)
        });
        let opened = self
            .calls
            .iter()
            .position(|c| matches!(c, CtlCall::MarkActive { stream, active: true, .. } if *stream == new));

        matches!((closed, opened), (Some(c), Some(o)) if c < o)
    }
}

impl EngineControl for MockControl {
    // ---
    fn mark_stream_active(&mut self, conn: ConnId, stream: StreamId, active: bool) {
        self.calls.push(CtlCall::MarkActive { conn, stream, active });
    }

    fn mark_datagram_ready(&mut self, conn: ConnId, ready: bool) {
        self.calls.push(CtlCall::DatagramReady { conn, ready });
    }

    fn set_stream_priority(&mut self, conn: ConnId, stream: StreamId, priority: u8) {
        self.calls.push(CtlCall::Priority { conn, stream, priority });
    }

    fn reset_stream(&mut self, conn: ConnId, stream: StreamId, code: u64) {
        self.calls.push(CtlCall::Reset { conn, stream, code });
    }

    fn finish_stream(&mut self, conn: ConnId, stream: StreamId) {
        self.calls.push(CtlCall::Finish { conn, stream });
    }

    fn close_connection(&mut self, conn: ConnId, code: u64) {
        self.calls.push(CtlCall::Close { conn, code });
    }

    fn path_quality(&mut self, conn: ConnId) -> Option<PathQuality> {
        self.quality.get(&conn).copied()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub(crate) struct Harness {
    // ---
    pub transport: Transport,
    pub shared: Arc<Shared>,
    pub core: NetworkCore,
    pub ctl: MockControl,
    pub clock: Arc<ManualClock>,
    pub conn: ConnId,
    runner_rx: mpsc::Receiver<NetCmd>,
    notify_rx: NotifierRx,
}

impl Harness {
    // ---
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    /// One ready client connection, `ConnId(1)`.
    pub fn with_config(config: TransportConfig) -> Self {
        // ---
        let clock = ManualClock::new();
        let waker: EngineWaker = Arc::new(|| {});
        let (runner, runner_rx) = RunnerTx::new(config.runner_queue_size, waker);
        let (notifier, notify_rx) = NotifierTx::channel(config.notify_queue_size);
        let shared = Arc::new(Shared::new(config, clock.clone(), runner, notifier));

        let mut h = Self {
            transport: Transport::from_shared(shared.clone()),
            shared: shared.clone(),
            core: NetworkCore::new(shared),
            ctl: MockControl::default(),
            clock,
            conn: ConnId(1),
            runner_rx,
            notify_rx,
        };
        let peer = SocketAddr::from(([127, 0, 0, 1], 4433));
        h.core.on_connection_ready(&mut h.ctl, h.conn, peer, Role::Client);
        h
    }

    /// Register a client connection still in its handshake.
    pub fn preconnect(&mut self, conn: ConnId) {
        // ---
        let peer = SocketAddr::from(([127, 0, 0, 1], 0));
        let record = ConnectionRecord::new(conn, peer, Role::Client, &self.shared.config, self.shared.clock.clone());
        self.shared.state.lock().conns.insert(conn, record);
    }

    /// Run queued runner commands. Returns how many ran.
    pub fn pump(&mut self) -> usize {
        // ---
        let mut n = 0;
        while let Ok(cmd) = self.runner_rx.try_recv() {
            self.core.handle_cmd(&mut self.ctl, cmd);
            n += 1;
        }
        n
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::iter::from_fn(|| self.notify_rx.try_recv()).collect()
    }

    // --- engine callbacks ----------------------------------------------------

    pub fn prepare(&mut self, stream: StreamId, max_len: usize) -> VecSendBuffer {
        let mut buf = VecSendBuffer::new(max_len);
        self.prepare_into(stream, &mut buf);
        buf
    }

    pub fn prepare_into(&mut self, stream: StreamId, buf: &mut VecSendBuffer) {
        self.core.prepare_to_send(&mut self.ctl, self.conn, stream, buf);
    }

    pub fn prepare_datagram(&mut self, max_len: usize) -> VecSendBuffer {
        let mut buf = VecSendBuffer::new(max_len);
        self.core.prepare_datagram(&mut self.ctl, self.conn, &mut buf);
        buf
    }

    pub fn stream_data(&mut self, stream: StreamId, data: Bytes, fin: bool) {
        self.core.on_stream_data(&mut self.ctl, self.conn, stream, data, fin);
    }

    pub fn stream_reset(&mut self, stream: StreamId) {
        self.core.on_stream_reset(&mut self.ctl, self.conn, stream);
    }

    pub fn datagram(&mut self, data: Bytes) {
        self.core.on_datagram(&mut self.ctl, self.conn, data);
    }

    pub fn connection_closed(&mut self, reason: CloseReason) {
        self.core.on_connection_closed(&mut self.ctl, self.conn, reason);
    }

    pub fn sweep(&mut self) {
        // ---
        let mut state = self.shared.state.lock();
        if let Some(record) = state.conns.get_mut(&self.conn) {
            congestion::check_connection(record, &mut self.ctl, &self.shared.config);
        }
    }

    pub fn remove_closed_streams(&mut self) {
        self.with_record(receive::remove_closed_streams);
    }

    // --- direct state access ------------------------------------------------

    /// Open a stream for `flow` as an activation would.
    pub fn open_stream_for(&mut self, flow: FlowId) -> StreamId {
        // ---
        let mut state = self.shared.state.lock();
        let record = state.conns.get_mut(&self.conn).expect("harness connection");
        scheduler::activate_flow(record, &mut self.ctl, flow);
        record.flows[&flow].current_stream.expect("activation opened a stream")
    }

    /// Push straight into the flow's queue, bypassing enqueue validation.
    pub fn push_raw(&mut self, flow: FlowId, data: Bytes) {
        // ---
        let conn = self.conn;
        let now = self.clock_now();
        self.with_record(|c| {
            let f = &c.flows[&flow];
            let unit = SendUnit {
                conn_id: conn,
                flow_id: flow,
                priority: f.priority,
                action: StreamAction::NoAction,
                enqueued_at: now,
                data,
            };
            f.tx.queue.lock().push(0, unit, 0, f.priority, 0).expect("push");
        });
    }

    pub fn set_discard_mode(&mut self, flow: FlowId) {
        self.with_record(|c| c.flows.get_mut(&flow).expect("flow").discard_mode = true);
    }

    pub fn discard_mode(&self, flow: FlowId) -> bool {
        self.read_record(|c| c.flows[&flow].discard_mode)
    }

    pub fn current_stream(&self, flow: FlowId) -> Option<StreamId> {
        self.read_record(|c| c.flows.get(&flow).and_then(|f| f.current_stream))
    }

    pub fn open_tx_streams(&self, flow: FlowId) -> usize {
        self.read_record(|c| c.tx_streams.values().filter(|&&f| f == flow).count())
    }

    pub fn has_flow(&self, flow: FlowId) -> bool {
        self.read_record(|c| c.flows.contains_key(&flow))
    }

    pub fn has_rx_stream(&self, stream: StreamId) -> bool {
        self.read_record(|c| c.rx_streams.contains_key(&stream))
    }

    pub fn flow_metrics(&self, flow: FlowId) -> FlowMetrics {
        self.read_record(|c| c.flows[&flow].metrics.clone())
    }

    pub fn conn_metrics(&self) -> ConnectionMetrics {
        self.read_record(|c| c.metrics.clone())
    }

    pub fn is_congested(&self) -> bool {
        self.read_record(|c| c.congested)
    }

    fn clock_now(&self) -> std::time::Duration {
        moqx_domain::Clock::now(&*self.clock)
    }

    fn with_record<T>(&mut self, f: impl FnOnce(&mut ConnectionRecord) -> T) -> T {
        let mut state = self.shared.state.lock();
        f(state.conns.get_mut(&self.conn).expect("harness connection"))
    }

    fn read_record<T>(&self, f: impl FnOnce(&ConnectionRecord) -> T) -> T {
        let state = self.shared.state.lock();
        f(state.conns.get(&self.conn).expect("harness connection"))
    }
}
