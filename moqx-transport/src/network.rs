//! Network thread: owns the engine and runs every engine callback.
//!
//! ```text
//!   loop {
//!       stop requested?            ──► break
//!       drain runner queue         ──► NetworkCore::handle_cmd
//!       engine.poll(max_wait)      ──► EngineEvents for NetworkCore
//!                                        └─ on_time_check: congestion sweep, metrics
//!   }
//!   NetworkCore::shutdown, engine.shutdown
//! ```
//!
//! [`NetworkCore`] holds no engine reference; every outbound call goes
//! through the `&mut dyn EngineControl` handed to it, which lets tests
//! drive it with a recording control and a manual clock.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

// ---

use bytes::Bytes;
use tokio::sync::mpsc;

// ---

use moqx_domain::{
    // ---
    CloseReason,
    ConnId,
    DatagramStatus,
    DisconnectReason,
    EngineControl,
    EngineEvents,
    FlowId,
    Priority,
    QuicEngine,
    Result,
    Role,
    SendBuffer,
    StreamId,
    TransportStatus,
};

// ---

use crate::congestion;
use crate::dispatch::NetCmd;
use crate::notifier::Notification;
use crate::receive::{self, post};
use crate::scheduler::{self, STREAM_REPLACED_CODE};
use crate::state::ConnectionRecord;
use crate::transport::Shared;

/// Reset code for streams of a flow deleted without draining.
pub(crate) const FLOW_DELETED_CODE: u64 = 0x2;

// ---------------------------------------------------------------------------
// Thread
// ---------------------------------------------------------------------------

pub(crate) fn spawn<E: QuicEngine>(
    engine: E,
    core: NetworkCore,
    rx: mpsc::Receiver<NetCmd>,
) -> Result<JoinHandle<()>> {
    // ---
    let handle = std::thread::Builder::new()
        .name("moqx-network".into())
        .spawn(move || run(engine, core, rx))?;
    Ok(handle)
}

fn run<E: QuicEngine>(mut engine: E, mut core: NetworkCore, mut rx: mpsc::Receiver<NetCmd>) {
    // ---
    let max_wait = Duration::from_micros(core.shared.config.loop_max_delay_us);
    tracing::debug!(?max_wait, "network thread started");

    loop {
        if core.shared.stop_requested.load(Ordering::Acquire) {
            break;
        }
        while let Ok(cmd) = rx.try_recv() {
            core.handle_cmd(engine.control(), cmd);
        }
        if let Err(e) = engine.poll(max_wait, &mut core) {
            tracing::error!("engine poll failed: {e}");
            break;
        }
    }

    core.shutdown(engine.control());
    engine.shutdown();
    tracing::debug!("network thread stopped");
}

// ---------------------------------------------------------------------------
// NetworkCore
// ---------------------------------------------------------------------------

pub(crate) struct NetworkCore {
    // ---
    shared: Arc<Shared>,
    last_congestion_ms: u64,
    last_metrics_ms: u64,
}

impl NetworkCore {
    // ---
    pub fn new(shared: Arc<Shared>) -> Self {
        // ---
        let now = shared.clock.now_ms();
        Self {
            shared,
            last_congestion_ms: now,
            last_metrics_ms: now,
        }
    }

    // -----------------------------------------------------------------------
    // Runner commands
    // -----------------------------------------------------------------------

    pub fn handle_cmd(&mut self, ctl: &mut dyn EngineControl, cmd: NetCmd) {
        // ---
        tracing::trace!(?cmd, "runner command");
        let mut state = self.shared.state.lock();

        match cmd {
            NetCmd::MarkStreamActive { conn, flow } => {
                let Some(record) = ready_record(state.conns.get_mut(&conn)) else {
                    return;
                };
                scheduler::activate_flow(record, ctl, flow);
            }

            NetCmd::MarkDatagramReady { conn } => {
                let Some(record) = ready_record(state.conns.get_mut(&conn)) else {
                    return;
                };
                record.dgram_tx.clear_activation();
                ctl.mark_datagram_ready(conn, true);
            }

            NetCmd::SetStreamPriority { conn, flow } => {
                let target = state
                    .conns
                    .get(&conn)
                    .and_then(|c| c.flows.get(&flow))
                    .and_then(|f| f.current_stream.map(|s| (s, f.priority)));
                if let Some((stream, priority)) = target {
                    ctl.set_stream_priority(conn, stream, Priority::saturating(priority).engine_value());
                }
            }

            NetCmd::CloseStream { conn, stream, reset } => {
                if !state.conns.contains_key(&conn) {
                    return;
                }
                if reset {
                    ctl.reset_stream(conn, stream, FLOW_DELETED_CODE);
                } else {
                    ctl.finish_stream(conn, stream);
                }
            }

            NetCmd::CloseConnection { conn, code } => {
                let Some(record) = state.conns.get_mut(&conn) else {
                    return;
                };
                let streams: Vec<StreamId> = record.tx_streams.keys().copied().collect();
                for stream in streams {
                    ctl.reset_stream(conn, stream, STREAM_REPLACED_CODE);
                    record.release_stream(stream, false);
                }
                tracing::info!(conn_id = %conn, code, "closing connection");
                ctl.close_connection(conn, code);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Close every connection and tell the notifier to stop.
    pub fn shutdown(&mut self, ctl: &mut dyn EngineControl) {
        // ---
        let records: Vec<ConnectionRecord> = {
            let mut state = self.shared.state.lock();
            state.conns.drain().map(|(_, record)| record).collect()
        };

        for record in records {
            ctl.close_connection(record.conn_id, 0);
            self.release_connection(
                record,
                TransportStatus::Disconnected,
                DisconnectReason::LocalShutdown,
            );
        }

        self.shared.set_status(TransportStatus::Shutdown);
        post(&self.shared, Notification::Stop);
    }

    /// Account for undelivered units, post final snapshots and the status.
    fn release_connection(
        &self,
        mut record: ConnectionRecord,
        status: TransportStatus,
        reason: DisconnectReason,
    ) {
        // ---
        let conn = record.conn_id;
        let dropped = record.pending_units();
        record.metrics.tx_units_closed += dropped as u64;

        for rx in record.rx_streams.values() {
            rx.buffer.close();
        }
        tracing::info!(conn_id = %conn, ?status, ?reason, dropped, "connection released");

        post_snapshots(&self.shared, &record);
        post(
            &self.shared,
            Notification::ConnectionStatus {
                conn,
                status,
                reason: Some(reason),
            },
        );
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn run_timers(&mut self, ctl: &mut dyn EngineControl) {
        // ---
        let cfg = &self.shared.config;
        let now = self.shared.clock.now_ms();

        let sweep = now.saturating_sub(self.last_congestion_ms) >= cfg.congestion.check_interval_ms;
        let report = now.saturating_sub(self.last_metrics_ms) >= cfg.metrics_interval_ms;
        if !sweep && !report {
            return;
        }

        let mut state = self.shared.state.lock();
        if sweep {
            self.last_congestion_ms = now;
            for record in state.conns.values_mut() {
                if record.status == TransportStatus::Ready {
                    congestion::check_connection(record, ctl, cfg);
                }
            }
        }

        if report {
            self.last_metrics_ms = now;
            for record in state.conns.values_mut() {
                receive::remove_closed_streams(record);
                post_snapshots(&self.shared, record);

                record.metrics.reset_period();
                for flow in record.flows.values_mut() {
                    flow.metrics.reset_period();
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine callbacks
// ---------------------------------------------------------------------------

impl EngineEvents for NetworkCore {
    // ---
    fn on_connection_ready(&mut self, ctl: &mut dyn EngineControl, conn: ConnId, peer: SocketAddr, role: Role) {
        // ---
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            let record = state
                .conns
                .entry(conn)
                .or_insert_with(|| ConnectionRecord::new(conn, peer, role, &shared.config, shared.clock.clone()));
            record.peer = peer;
            record.status = TransportStatus::Ready;

            // Flows created while connecting start sending now.
            let backlogged: Vec<FlowId> = record
                .flows
                .iter()
                .filter(|(_, f)| f.reliable && f.backlog() > 0)
                .map(|(&id, _)| id)
                .collect();
            for flow in backlogged {
                scheduler::activate_flow(record, ctl, flow);
            }
            if !record.dgram_tx.is_empty() {
                record.dgram_tx.clear_activation();
                ctl.mark_datagram_ready(conn, true);
            }
        }

        tracing::info!(conn_id = %conn, %peer, ?role, "connection ready");
        shared.set_status(TransportStatus::Ready);
        post(shared, Notification::NewConnection { conn, peer });
        post(
            shared,
            Notification::ConnectionStatus {
                conn,
                status: TransportStatus::Ready,
                reason: None,
            },
        );
    }

    fn on_connection_closed(&mut self, _ctl: &mut dyn EngineControl, conn: ConnId, reason: CloseReason) {
        // ---
        let (record, remaining) = {
            let mut state = self.shared.state.lock();
            (state.conns.remove(&conn), state.conns.len())
        };
        let Some(record) = record else {
            tracing::debug!(conn_id = %conn, ?reason, "close for released connection");
            return;
        };

        let (status, why) = match &reason {
            CloseReason::IdleTimeout => (TransportStatus::Disconnected, DisconnectReason::IdleTimeout),
            CloseReason::RemoteClose { .. } => (TransportStatus::RemoteRequestClose, DisconnectReason::RemoteClose),
            CloseReason::LocalClose { .. } => (TransportStatus::Disconnected, DisconnectReason::LocalShutdown),
            CloseReason::Unreachable => (TransportStatus::Disconnected, DisconnectReason::Unreachable),
            CloseReason::Error(e) => {
                tracing::warn!(conn_id = %conn, "connection error: {e}");
                (TransportStatus::Disconnected, DisconnectReason::Error)
            }
        };

        let was_client = record.role == Role::Client;
        self.release_connection(record, status, why);
        if was_client && remaining == 0 {
            self.shared.set_status(status);
        }
    }

    fn prepare_datagram(&mut self, _ctl: &mut dyn EngineControl, conn: ConnId, buf: &mut dyn SendBuffer) {
        // ---
        let mut state = self.shared.state.lock();
        match state.conns.get_mut(&conn) {
            Some(record) => scheduler::prepare_datagram(record, buf),
            None => {
                let _ = buf.provide(0, false);
            }
        }
    }

    fn on_datagram(&mut self, _ctl: &mut dyn EngineControl, conn: ConnId, data: Bytes) {
        // ---
        let mut state = self.shared.state.lock();
        if let Some(record) = state.conns.get_mut(&conn) {
            receive::on_datagram(&self.shared, record, data);
        }
    }

    fn on_datagram_status(&mut self, conn: ConnId, status: DatagramStatus) {
        // ---
        let mut state = self.shared.state.lock();
        let Some(record) = state.conns.get_mut(&conn) else {
            return;
        };
        let m = &mut record.metrics;
        match status {
            DatagramStatus::Acked => m.tx_dgram_ack += 1,
            DatagramStatus::Lost => m.tx_dgram_lost += 1,
            DatagramStatus::Spurious => m.tx_dgram_spurious += 1,
        }
    }

    fn prepare_to_send(
        &mut self,
        ctl: &mut dyn EngineControl,
        conn: ConnId,
        stream: StreamId,
        buf: &mut dyn SendBuffer,
    ) {
        // ---
        let now = self.shared.clock.now();
        let mut state = self.shared.state.lock();
        match state.conns.get_mut(&conn) {
            Some(record) => scheduler::prepare_stream(record, ctl, stream, buf, &self.shared.config, now),
            None => {
                let _ = buf.provide(0, false);
            }
        }
    }

    fn on_stream_data(
        &mut self,
        _ctl: &mut dyn EngineControl,
        conn: ConnId,
        stream: StreamId,
        data: Bytes,
        fin: bool,
    ) {
        // ---
        let mut state = self.shared.state.lock();
        if let Some(record) = state.conns.get_mut(&conn) {
            receive::on_stream_data(&self.shared, record, stream, data, fin);
        }
    }

    fn on_stream_reset(&mut self, ctl: &mut dyn EngineControl, conn: ConnId, stream: StreamId) {
        // ---
        let mut state = self.shared.state.lock();
        if let Some(record) = state.conns.get_mut(&conn) {
            receive::on_stream_reset(&self.shared, record, ctl, stream);
        }
    }

    fn on_time_check(&mut self, ctl: &mut dyn EngineControl) {
        self.run_timers(ctl);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Commands for a connection still in its handshake wait for it to be ready.
fn ready_record(record: Option<&mut ConnectionRecord>) -> Option<&mut ConnectionRecord> {
    record.filter(|r| r.status == TransportStatus::Ready)
}

fn post_snapshots(shared: &Shared, record: &ConnectionRecord) {
    // ---
    let conn = record.conn_id;
    post(
        shared,
        Notification::ConnectionMetrics {
            conn,
            metrics: record.metrics.clone(),
        },
    );
    for (&flow, f) in &record.flows {
        post(
            shared,
            Notification::FlowMetrics {
                conn,
                flow,
                metrics: f.metrics.clone(),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
