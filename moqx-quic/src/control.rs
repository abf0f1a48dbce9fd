//! Outbound half of the quinn engine.
//!
//! [`QuinnControl`] holds every connection the engine knows about. As with
//! any engine, FIN, reset and close requests made from inside a callback
//! are queued and applied after the data written by that callback.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

// ---

use bytes::Bytes;
use tokio::runtime::Handle;

// ---

use moqx_domain::{ConnId, EngineControl, PathQuality, Role, StreamId};

// ---

use crate::tasks::{EventTx, Opener, StreamWriter};

// ---------------------------------------------------------------------------
// QuinnConn
// ---------------------------------------------------------------------------

pub(crate) struct QuinnConn {
    // ---
    role: Role,

    /// `None` until the handshake completes.
    connection: Option<quinn::Connection>,

    writers: HashMap<StreamId, StreamWriter>,
    active: HashSet<StreamId>,
    priorities: HashMap<StreamId, u8>,
    dgram_ready: bool,

    /// Previous `(when, udp tx bytes, udp rx bytes)` for rate computation.
    last_sample: Option<(Instant, u64, u64)>,
}

impl QuinnConn {
    // ---
    fn new(role: Role, connection: Option<quinn::Connection>) -> Self {
        // ---
        Self {
            role,
            connection,
            writers: HashMap::new(),
            active: HashSet::new(),
            priorities: HashMap::new(),
            dgram_ready: false,
            last_sample: None,
        }
    }

    /// Room in the datagram send buffer for one more maximum-size datagram.
    fn datagram_room(&self) -> Option<usize> {
        // ---
        let connection = self.connection.as_ref()?;
        let max = connection.max_datagram_size()?;
        (connection.datagram_send_buffer_space() >= max).then_some(max)
    }
}

// ---------------------------------------------------------------------------
// QuinnControl
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CtlOp {
    Finish(ConnId, StreamId),
    Reset(ConnId, StreamId, u64),
    Close(ConnId, u64),
}

pub(crate) struct QuinnControl {
    // ---
    rt: Handle,
    events: EventTx,
    conns: HashMap<ConnId, QuinnConn>,
    ops: Vec<CtlOp>,
}

impl QuinnControl {
    // ---
    pub(crate) fn new(rt: Handle, events: EventTx) -> Self {
        // ---
        Self {
            rt,
            events,
            conns: HashMap::new(),
            ops: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Connection bookkeeping
    // -----------------------------------------------------------------------

    pub(crate) fn insert_connecting(&mut self, conn: ConnId) {
        self.conns.insert(conn, QuinnConn::new(Role::Client, None));
    }

    pub(crate) fn insert_connected(&mut self, conn: ConnId, connection: quinn::Connection, role: Role) {
        // ---
        self.conns
            .entry(conn)
            .or_insert_with(|| QuinnConn::new(role, None))
            .connection = Some(connection);
    }

    /// Forget `conn`. Returns `false` if it was already gone.
    pub(crate) fn remove(&mut self, conn: ConnId) -> bool {
        // ---
        self.ops.retain(|op| match op {
            CtlOp::Finish(c, _) | CtlOp::Reset(c, _, _) | CtlOp::Close(c, _) => *c != conn,
        });
        self.conns.remove(&conn).is_some()
    }

    pub(crate) fn attach_peer_stream(&mut self, conn: ConnId, stream: StreamId, send: quinn::SendStream) {
        // ---
        let Some(c) = self.conns.get_mut(&conn) else {
            return;
        };
        let priority = c.priorities.get(&stream).copied();
        let writer = StreamWriter::spawn(&self.rt, conn, stream, Opener::Peer(send), priority, self.events.clone());
        c.writers.insert(stream, writer);
    }

    // -----------------------------------------------------------------------
    // Servicing
    // -----------------------------------------------------------------------

    /// Active streams with writer room, most urgent first within each connection.
    pub(crate) fn writable_streams(&self) -> Vec<(ConnId, StreamId)> {
        // ---
        let mut out = Vec::new();
        for (&conn, c) in &self.conns {
            let mut streams: Vec<StreamId> = c
                .active
                .iter()
                .copied()
                .filter(|s| c.writers.get(s).is_some_and(|w| w.room() > 0))
                .collect();
            streams.sort_by_key(|s| (c.priorities.get(s).copied().unwrap_or(u8::MAX), *s));
            out.extend(streams.into_iter().map(|s| (conn, s)));
        }
        out
    }

    pub(crate) fn room(&self, conn: ConnId, stream: StreamId) -> usize {
        // ---
        self.conns
            .get(&conn)
            .filter(|c| c.active.contains(&stream))
            .and_then(|c| c.writers.get(&stream))
            .map_or(0, StreamWriter::room)
    }

    pub(crate) fn write(&mut self, conn: ConnId, stream: StreamId, data: Bytes) {
        // ---
        if let Some(w) = self.conns.get(&conn).and_then(|c| c.writers.get(&stream)) {
            w.write(data);
        }
    }

    pub(crate) fn set_inactive(&mut self, conn: ConnId, stream: StreamId) {
        if let Some(c) = self.conns.get_mut(&conn) {
            c.active.remove(&stream);
        }
    }

    pub(crate) fn datagram_ready_conns(&self) -> Vec<ConnId> {
        self.conns
            .iter()
            .filter(|(_, c)| c.dgram_ready)
            .map(|(&conn, _)| conn)
            .collect()
    }

    pub(crate) fn datagram_room(&self, conn: ConnId) -> Option<usize> {
        self.conns
            .get(&conn)
            .filter(|c| c.dgram_ready)
            .and_then(QuinnConn::datagram_room)
    }

    /// Hand a datagram to quinn. quinn offers no per-datagram feedback, so
    /// only a local refusal is reported.
    pub(crate) fn send_datagram(&mut self, conn: ConnId, data: Bytes) -> Result<(), String> {
        // ---
        let Some(connection) = self.conns.get(&conn).and_then(|c| c.connection.as_ref()) else {
            return Err("connection gone".into());
        };
        connection.send_datagram(data).map_err(|e| e.to_string())
    }

    pub(crate) fn has_work(&self) -> bool {
        // ---
        self.conns.values().any(|c| {
            c.active.iter().any(|s| c.writers.get(s).is_some_and(|w| w.room() > 0))
                || (c.dgram_ready && c.datagram_room().is_some())
        })
    }

    pub(crate) fn take_ops(&mut self) -> Vec<CtlOp> {
        std::mem::take(&mut self.ops)
    }

    // -----------------------------------------------------------------------
    // Deferred operations
    // -----------------------------------------------------------------------

    pub(crate) fn finish(&mut self, conn: ConnId, stream: StreamId) {
        // ---
        if let Some(c) = self.conns.get_mut(&conn) {
            c.active.remove(&stream);
            c.priorities.remove(&stream);
            if let Some(w) = c.writers.remove(&stream) {
                w.finish();
            }
        }
    }

    pub(crate) fn reset(&mut self, conn: ConnId, stream: StreamId, code: u64) {
        // ---
        if let Some(c) = self.conns.get_mut(&conn) {
            c.active.remove(&stream);
            c.priorities.remove(&stream);
            if let Some(w) = c.writers.remove(&stream) {
                w.reset(code);
            }
        }
    }

    /// Close and forget `conn`. Returns `false` if it was unknown.
    pub(crate) fn close(&mut self, conn: ConnId, code: u64) -> bool {
        // ---
        let Some(c) = self.conns.get(&conn) else {
            return false;
        };
        if let Some(connection) = c.connection.as_ref() {
            let code = quinn::VarInt::from_u64(code).unwrap_or(quinn::VarInt::MAX);
            connection.close(code, b"close");
        }
        self.remove(conn)
    }

    pub(crate) fn close_all(&mut self, code: u64) {
        // ---
        let conns: Vec<ConnId> = self.conns.keys().copied().collect();
        for conn in conns {
            self.close(conn, code);
        }
    }
}

// ---------------------------------------------------------------------------
// EngineControl
// ---------------------------------------------------------------------------

impl EngineControl for QuinnControl {
    // ---
    fn mark_stream_active(&mut self, conn: ConnId, stream: StreamId, active: bool) {
        // ---
        let Some(c) = self.conns.get_mut(&conn) else {
            return;
        };
        if !active {
            c.active.remove(&stream);
            return;
        }
        let Some(connection) = c.connection.clone() else {
            return;
        };

        if !c.writers.contains_key(&stream) {
            if !stream.is_local(c.role) {
                tracing::debug!(conn_id = %conn, %stream, "no send half for peer stream");
                return;
            }
            let opener = Opener::Local {
                connection,
                bidir: stream.is_bidir(),
            };
            let priority = c.priorities.get(&stream).copied();
            let writer = StreamWriter::spawn(&self.rt, conn, stream, opener, priority, self.events.clone());
            c.writers.insert(stream, writer);
        }
        c.active.insert(stream);
    }

    fn mark_datagram_ready(&mut self, conn: ConnId, ready: bool) {
        if let Some(c) = self.conns.get_mut(&conn) {
            c.dgram_ready = ready && c.connection.is_some();
        }
    }

    fn set_stream_priority(&mut self, conn: ConnId, stream: StreamId, priority: u8) {
        // ---
        if let Some(c) = self.conns.get_mut(&conn) {
            c.priorities.insert(stream, priority);
            if let Some(w) = c.writers.get(&stream) {
                w.set_priority(priority);
            }
        }
    }

    fn reset_stream(&mut self, conn: ConnId, stream: StreamId, code: u64) {
        if self.conns.contains_key(&conn) {
            self.ops.push(CtlOp::Reset(conn, stream, code));
        }
    }

    fn finish_stream(&mut self, conn: ConnId, stream: StreamId) {
        if self.conns.contains_key(&conn) {
            self.ops.push(CtlOp::Finish(conn, stream));
        }
    }

    fn close_connection(&mut self, conn: ConnId, code: u64) {
        if self.conns.contains_key(&conn) {
            self.ops.push(CtlOp::Close(conn, code));
        }
    }

    fn path_quality(&mut self, conn: ConnId) -> Option<PathQuality> {
        // ---
        let c = self.conns.get_mut(&conn)?;
        let stats = c.connection.as_ref()?.stats();

        let tx = stats.udp_tx.bytes;
        let rx = stats.udp_rx.bytes;
        let now = Instant::now();
        let (tx_rate_bps, rx_rate_bps) = match c.last_sample {
            Some((at, prev_tx, prev_rx)) => {
                let secs = now.duration_since(at).as_secs_f64().max(1e-3);
                (
                    (tx.saturating_sub(prev_tx) as f64 * 8.0 / secs) as u64,
                    (rx.saturating_sub(prev_rx) as f64 * 8.0 / secs) as u64,
                )
            }
            None => (0, 0),
        };
        c.last_sample = Some((now, tx, rx));

        let rtt_us = u64::try_from(stats.path.rtt.as_micros()).unwrap_or(u64::MAX);
        Some(PathQuality {
            rtt_us,
            srtt_us: rtt_us,
            cwin_bytes: stats.path.cwnd,
            bytes_in_transit: 0,
            retransmits: stats.path.lost_packets,
            lost_packets: stats.path.lost_packets,
            timer_losses: 0,
            spurious_losses: 0,
            tx_rate_bps,
            rx_rate_bps,
        })
    }
}
