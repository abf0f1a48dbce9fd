//! Receive path: stream bytes, stream closure, and datagrams.
//!
//! Bytes are appended to shared buffers and the application is told they
//! are there; it drains them from its own thread. Notifications are
//! throttled so a slow application cannot grow the notifier backlog
//! without bound.

use std::sync::Arc;

// ---

use bytes::Bytes;

// ---

use moqx_domain::{
    // ---
    ConnId,
    EngineControl,
    FlowId,
    StreamCloseReason,
    StreamId,
};

// ---

use crate::notifier::Notification;
use crate::scheduler;
use crate::state::{ConnectionRecord, FlowRecord, RxStream, SendQueue};
use crate::transport::Shared;

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

pub(crate) fn on_stream_data(
    shared: &Shared,
    conn: &mut ConnectionRecord,
    stream: StreamId,
    data: Bytes,
    fin: bool,
) {
    // ---
    let conn_id = conn.conn_id;

    if !conn.rx_streams.contains_key(&stream) {
        if stream.is_local(conn.role) {
            // Our own stream, already released by a replacement.
            tracing::trace!(%conn_id, %stream, len = data.len(), "data on released stream ignored");
            return;
        }
        let flow = if stream.is_bidir() {
            Some(adopt_peer_stream(shared, conn, stream))
        } else {
            None
        };
        conn.rx_streams.insert(stream, RxStream::new(flow));
    }

    let Some(rx) = conn.rx_streams.get(&stream) else {
        return;
    };
    let flow_id = rx.flow;
    let buffer = Arc::clone(&rx.buffer);
    let len = data.len();
    buffer.push(data);

    if let Some(flow) = flow_id.and_then(|id| conn.flows.get_mut(&id)) {
        flow.metrics.rx_stream_cb += 1;
        flow.metrics.rx_stream_bytes += len as u64;
    }

    if len > 0 {
        notify_recv_ready(shared, conn_id, Some(stream), flow_id);
    }

    if fin {
        buffer.close();
        post(
            shared,
            Notification::StreamClosed {
                conn: conn_id,
                stream,
                reason: StreamCloseReason::Fin,
            },
        );
    }
}

/// A peer-opened bidirectional stream becomes a flow we can answer on.
fn adopt_peer_stream(shared: &Shared, conn: &mut ConnectionRecord, stream: StreamId) -> FlowId {
    // ---
    let conn_id = conn.conn_id;
    let flow_id = conn.allocate_flow_id();
    let tx = Arc::new(SendQueue::new(&shared.config, shared.clock.clone()));

    let mut flow = FlowRecord::new(true, true, shared.config.peer_bidir_priority, tx);
    flow.current_stream = Some(stream);
    conn.flows.insert(flow_id, flow);
    conn.tx_streams.insert(stream, flow_id);

    tracing::debug!(%conn_id, %flow_id, %stream, "flow created for peer stream");
    post(shared, Notification::NewFlow { conn: conn_id, flow: flow_id });
    flow_id
}

pub(crate) fn on_stream_reset(
    shared: &Shared,
    conn: &mut ConnectionRecord,
    ctl: &mut dyn EngineControl,
    stream: StreamId,
) {
    // ---
    let conn_id = conn.conn_id;
    let mut known = false;

    if let Some(rx) = conn.rx_streams.get(&stream) {
        rx.buffer.close();
        known = true;
    }

    if let Some(flow_id) = conn.tx_streams.remove(&stream) {
        known = true;
        let mut reopen = false;

        if let Some(flow) = conn.flows.get_mut(&flow_id) {
            if flow.current_stream == Some(stream) {
                flow.current_stream = None;
                if flow.tx_object.take().is_some() {
                    flow.metrics.tx_buffer_drops += 1;
                }
                reopen = !flow.tx.is_empty();
            }
        }
        tracing::debug!(%conn_id, %flow_id, %stream, reopen, "sending stream reset by peer");

        if reopen {
            scheduler::activate_flow(conn, ctl, flow_id);
        }
    }

    if known {
        post(
            shared,
            Notification::StreamClosed {
                conn: conn_id,
                stream,
                reason: StreamCloseReason::Reset,
            },
        );
    }
}

/// Bind a received stream to a local flow so its notifications carry it.
pub(crate) fn bind_stream(conn: &mut ConnectionRecord, flow: FlowId, stream: StreamId) {
    // ---
    conn.rx_streams
        .entry(stream)
        .or_insert_with(|| RxStream::new(None))
        .flow = Some(flow);
}

/// Drop buffers that are closed and were either drained or already
/// offered to the application on a previous pass.
pub(crate) fn remove_closed_streams(conn: &mut ConnectionRecord) {
    // ---
    let conn_id = conn.conn_id;
    conn.rx_streams.retain(|stream, rx| {
        if !rx.buffer.is_closed() {
            return true;
        }
        if rx.buffer.is_empty() || rx.checked_once {
            tracing::trace!(%conn_id, %stream, left = rx.buffer.len(), "receive buffer removed");
            return false;
        }
        rx.checked_once = true;
        true
    });
}

// ---------------------------------------------------------------------------
// Datagrams
// ---------------------------------------------------------------------------

pub(crate) fn on_datagram(shared: &Shared, conn: &mut ConnectionRecord, data: Bytes) {
    // ---
    let conn_id = conn.conn_id;
    conn.metrics.rx_dgrams += 1;
    conn.metrics.rx_dgrams_bytes += data.len() as u64;

    if conn.dgram_rx.push(data) {
        conn.metrics.rx_dgram_drops += 1;
    }

    // The application drains in a loop once told; one nudge per few
    // datagrams is enough.
    if conn.dgram_rx.len() <= shared.config.dgram_notify_depth {
        notify_recv_ready(shared, conn_id, None, None);
    }
}

// ---------------------------------------------------------------------------
// Notification helpers
// ---------------------------------------------------------------------------

fn notify_recv_ready(shared: &Shared, conn: ConnId, stream: Option<StreamId>, flow: Option<FlowId>) {
    // ---
    let backlog = shared.notifier.backlog();
    if backlog > shared.config.notify_backlog_warn {
        tracing::warn!(%conn, ?stream, backlog, "notifier backlogged, receive notification skipped");
        return;
    }
    post(shared, Notification::RecvReady { conn, stream, flow });
}

/// Post and swallow the error; it was already logged by the notifier.
pub(crate) fn post(shared: &Shared, event: Notification) {
    let _ = shared.notifier.post(event);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::test_support::Harness;
    use moqx_domain::{EnqueueFlags, Role, TransportConfig};

    fn peer_bidi(index: u64) -> StreamId {
        // Harness connections are clients; the peer is the server.
        StreamId::new(Role::Server, true, index)
    }

    #[test]
    fn peer_bidir_stream_creates_flow_and_notifies() {
        // ---
        let mut h = Harness::new();
        h.drain_notifications();

        let stream = peer_bidi(0);
        h.stream_data(stream, Bytes::from_static(b"hello"), false);

        let events = h.drain_notifications();
        let flow = match events.as_slice() {
            [Notification::NewFlow { flow, .. }, Notification::RecvReady { stream: Some(s), flow: Some(f), .. }] => {
                assert_eq!(s, &stream);
                assert_eq!(f, flow);
                *flow
            }
            other => panic!("unexpected notifications: {other:?}"),
        };

        let buffer = h.transport.stream_buffer(h.conn, stream).unwrap().unwrap();
        assert_eq!(buffer.read_all(), Bytes::from_static(b"hello"));
        assert_eq!(h.flow_metrics(flow).rx_stream_bytes, 5);

        // Answering on the adopted flow reuses the peer's stream.
        h.transport
            .enqueue(h.conn, flow, Bytes::from_static(b"hi"), 10, 0, EnqueueFlags::default())
            .unwrap();
        h.pump();
        assert_eq!(h.current_stream(flow), Some(stream));
        assert_eq!(h.prepare(stream, 100).data(), b"hi");
    }

    #[test]
    fn fin_closes_buffer_and_gc_waits_one_pass() {
        // ---
        let mut h = Harness::new();
        let stream = StreamId::new(Role::Server, false, 0);
        h.stream_data(stream, Bytes::from_static(b"abc"), true);

        let events = h.drain_notifications();
        assert!(events.contains(&Notification::StreamClosed {
            conn: h.conn,
            stream,
            reason: StreamCloseReason::Fin,
        }));

        let buffer = h.transport.stream_buffer(h.conn, stream).unwrap().unwrap();
        assert!(buffer.is_closed());

        h.remove_closed_streams();
        assert!(h.has_rx_stream(stream), "undrained buffer survives the first pass");
        h.remove_closed_streams();
        assert!(!h.has_rx_stream(stream), "and is removed on the second");

        // The application's handle still drains.
        assert_eq!(buffer.read_all(), Bytes::from_static(b"abc"));
    }

    #[test]
    fn drained_closed_buffer_removed_immediately() {
        // ---
        let mut h = Harness::new();
        let stream = StreamId::new(Role::Server, false, 1);
        h.stream_data(stream, Bytes::from_static(b"x"), true);
        h.transport.stream_buffer(h.conn, stream).unwrap().unwrap().read_all();

        h.remove_closed_streams();
        assert!(!h.has_rx_stream(stream));
    }

    #[test]
    fn peer_reset_of_sending_stream_reopens_when_backlogged() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, true, 2, false).unwrap();
        for _ in 0..2 {
            h.transport
                .enqueue(h.conn, flow, Bytes::from_static(b"0123456789"), 2, 0, EnqueueFlags::default())
                .unwrap();
        }
        h.pump();
        let old = h.current_stream(flow).unwrap();
        h.prepare(old, 4);

        h.stream_reset(old);
        let new = h.current_stream(flow).expect("queued data gets a new stream");
        assert_ne!(new, old);
        assert_eq!(h.flow_metrics(flow).tx_buffer_drops, 1);
        assert_eq!(h.prepare(new, 100).data(), b"0123456789");
        assert!(h
            .drain_notifications()
            .contains(&Notification::StreamClosed {
                conn: h.conn,
                stream: old,
                reason: StreamCloseReason::Reset
            }));
    }

    #[test]
    fn datagram_notifications_stop_when_queue_is_deep() {
        // ---
        let mut cfg = TransportConfig::default();
        cfg.dgram_notify_depth = 2;
        cfg.time_queue_rx_size = 3;
        let mut h = Harness::with_config(cfg);
        h.drain_notifications();

        for i in 0..5u8 {
            h.datagram(Bytes::from(vec![i]));
        }

        let notified = h
            .drain_notifications()
            .into_iter()
            .filter(|n| matches!(n, Notification::RecvReady { stream: None, .. }))
            .count();
        assert_eq!(notified, 2, "only while the queue is shallow");

        let m = h.conn_metrics();
        assert_eq!(m.rx_dgrams, 5);
        assert_eq!(m.rx_dgram_drops, 2, "bounded queue evicts the oldest");

        let got: Vec<Bytes> = std::iter::from_fn(|| h.transport.dequeue_datagram(h.conn).unwrap()).collect();
        assert_eq!(got, vec![Bytes::from(vec![2]), Bytes::from(vec![3]), Bytes::from(vec![4])]);
    }

    #[test]
    fn receive_notification_skipped_when_notifier_backlogged() {
        // ---
        let mut cfg = TransportConfig::default();
        cfg.notify_backlog_warn = 1;
        let mut h = Harness::with_config(cfg);
        h.drain_notifications();

        let stream = StreamId::new(Role::Server, false, 0);
        for _ in 0..4 {
            h.stream_data(stream, Bytes::from_static(b"z"), false);
        }
        assert_eq!(h.drain_notifications().len(), 2);
        assert_eq!(h.transport.stream_buffer(h.conn, stream).unwrap().unwrap().len(), 4);
    }

    #[test]
    fn bound_stream_reports_its_flow() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, true, 1, false).unwrap();
        let stream = StreamId::new(Role::Server, false, 3);
        h.transport.bind_stream_to_flow(h.conn, flow, stream).unwrap();
        h.drain_notifications();

        h.stream_data(stream, Bytes::from_static(b"q"), false);
        assert_eq!(
            h.drain_notifications(),
            vec![Notification::RecvReady {
                conn: h.conn,
                stream: Some(stream),
                flow: Some(flow)
            }]
        );
    }
}
