//! Send scheduler: fills engine buffers for one stream or for the
//! connection's datagram channel.
//!
//! # Stream path
//!
//! ```text
//!   prepare_stream(stream)
//!     │
//!     ├─ 1. discard mode?   drop the head unit unless it carries a stream action
//!     ├─ 2. pending action? reset / FIN the old stream, open a new one, return
//!     ├─ 3. no object?      pop the next unit (expired units are counted)
//!     └─ 4. copy            min(max_len, remaining) bytes, advance the cursor
//! ```
//!
//! Objects larger than `max_len` are streamed across invocations through
//! the [`TxObject`] cursor; nothing is fragmented here.
//!
//! Everything runs on the network thread with the state lock held.

use std::time::Duration;

// ---

use moqx_domain::{
    // ---
    EngineControl,
    FlowId,
    Priority,
    SendBuffer,
    StreamAction,
    StreamId,
    TransportConfig,
    TransportError,
};

// ---

use crate::state::{ConnectionRecord, FlowRecord, TxObject};

/// Application error code carried by stream resets issued by the scheduler.
pub(crate) const STREAM_REPLACED_CODE: u64 = 0x1;

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

/// Open a stream for `flow` if it has none and tell the engine it has data.
pub(crate) fn activate_flow(conn: &mut ConnectionRecord, ctl: &mut dyn EngineControl, flow_id: FlowId) {
    // ---
    let conn_id = conn.conn_id;
    let Some(flow) = conn.flows.get(&flow_id) else {
        tracing::debug!(%conn_id, %flow_id, "activation for deleted flow");
        return;
    };
    flow.tx.clear_activation();
    if !flow.reliable {
        return;
    }

    let stream = match flow.current_stream {
        Some(stream) => stream,
        None => {
            let priority = flow.priority;
            let Some(stream) = conn.open_stream(flow_id) else {
                return;
            };
            tracing::debug!(%conn_id, %flow_id, %stream, priority, "stream opened");
            ctl.set_stream_priority(conn_id, stream, Priority::saturating(priority).engine_value());
            stream
        }
    };
    ctl.mark_stream_active(conn_id, stream, true);
}

// ---------------------------------------------------------------------------
// Stream path
// ---------------------------------------------------------------------------

pub(crate) fn prepare_stream(
    conn: &mut ConnectionRecord,
    ctl: &mut dyn EngineControl,
    stream: StreamId,
    buf: &mut dyn SendBuffer,
    cfg: &TransportConfig,
    now: Duration,
) {
    // ---
    fill_stream(conn, ctl, stream, buf, cfg, now);
    remove_if_drained(conn, ctl, stream);
}

fn fill_stream(
    conn: &mut ConnectionRecord,
    ctl: &mut dyn EngineControl,
    stream: StreamId,
    buf: &mut dyn SendBuffer,
    cfg: &TransportConfig,
    now: Duration,
) {
    // ---
    let conn_id = conn.conn_id;
    let flow_id = match conn.tx_streams.get(&stream) {
        Some(&flow_id) if conn.flows.contains_key(&flow_id) => flow_id,
        _ => {
            tracing::debug!(%conn_id, %stream, "prepare for a stream with no flow");
            idle(buf, false);
            return;
        }
    };

    let Some(flow) = conn.flows.get_mut(&flow_id) else {
        idle(buf, false);
        return;
    };
    if flow.current_stream != Some(stream) {
        idle(buf, false);
        return;
    }
    let tx = flow.tx.clone();
    account_callback(flow, cfg, now);

    // --- 1. discard mode
    if flow.discard_mode && flow.tx_object.is_none() {
        let mut queue = tx.queue.lock();
        let front = queue.front();
        flow.metrics.tx_queue_expired += front.expired as u64;

        match front.value.map(|unit| unit.action) {
            Some(action) if action.is_replace() => {
                tracing::info!(%conn_id, %flow_id, ?action, "discard mode cleared by stream action");
                flow.discard_mode = false;
                flow.pending_action = action;
            }
            Some(_) => {
                queue.pop();
                flow.metrics.tx_queue_discards += 1;
                let active = !queue.is_empty();
                drop(queue);
                idle(buf, active);
                return;
            }
            None => {
                drop(queue);
                idle(buf, false);
                return;
            }
        }
    }

    // --- 2. pending stream replacement
    if flow.pending_action.is_replace() {
        let action = flow.pending_action;
        let mid_flight = flow.tx_object.is_some();

        // A FIN replacement lets the partial object complete first.
        if !(action == StreamAction::ReplaceUsingFin && mid_flight) {
            flow.pending_action = StreamAction::NoAction;

            if mid_flight {
                flow.tx_object = None;
                flow.metrics.tx_buffer_drops += 1;
                tracing::debug!(%conn_id, %flow_id, %stream, "partial object abandoned by reset");
            }

            if flow.stream_tx_bytes > 0 {
                replace_stream(conn, ctl, flow_id, stream, action);
                idle(buf, false);
                return;
            }
            tracing::trace!(%conn_id, %flow_id, %stream, "stream still fresh, replacement skipped");
        }
    }

    // --- 3. next object
    if flow.tx_object.is_none() {
        let popped = tx.queue.lock().pop_front();

        if popped.expired > 0 {
            flow.metrics.tx_queue_expired += popped.expired as u64;
            flow.last_tx_tick = None;
            tracing::debug!(%conn_id, %flow_id, expired = popped.expired, "expired units dropped");
        }

        let Some(unit) = popped.value else {
            idle(buf, false);
            return;
        };

        if unit.is_empty() {
            tracing::error!(%conn_id, %flow_id, "{}, dropped", TransportError::ZeroLengthObject);
            flow.metrics.tx_zero_length_drops += 1;
            idle(buf, !tx.is_empty());
            return;
        }

        flow.tx_object = Some(TxObject {
            data: unit.data,
            offset: 0,
            enqueued_at: unit.enqueued_at,
        });
    }

    // --- 4. copy
    let more_queued = !tx.is_empty() || flow.pending_action.is_replace();
    let Some(obj) = flow.tx_object.as_mut() else {
        idle(buf, more_queued);
        return;
    };

    let len = obj.remaining().min(buf.max_len());
    let still_active = obj.remaining() > len || more_queued;

    let Some(dst) = buf.provide(len, still_active) else {
        tracing::warn!(
            %conn_id, %flow_id, %stream, len,
            "{}, object kept for the next callback",
            TransportError::EngineBufferAllocationFailed
        );
        return;
    };
    dst.copy_from_slice(&obj.data[obj.offset..obj.offset + len]);
    obj.offset += len;

    flow.stream_tx_bytes += len as u64;
    flow.metrics.tx_stream_bytes += len as u64;

    if obj.remaining() == 0 {
        let age = now.saturating_sub(obj.enqueued_at);
        flow.metrics.tx_stream_objects += 1;
        flow.metrics.tx_object_duration_us.add_value(age.as_micros() as u64);
        flow.tx_object = None;
    }
}

/// Finish a graceful delete once the flow has nothing left to send,
/// whether its queue drained by sending, expiry or discard.
fn remove_if_drained(conn: &mut ConnectionRecord, ctl: &mut dyn EngineControl, stream: StreamId) {
    // ---
    let conn_id = conn.conn_id;
    let Some(&flow_id) = conn.tx_streams.get(&stream) else {
        return;
    };
    let Some(flow) = conn.flows.get(&flow_id) else {
        return;
    };
    if !flow.delete_on_empty
        || flow.current_stream != Some(stream)
        || flow.tx_object.is_some()
        || !flow.tx.is_empty()
    {
        return;
    }

    tracing::info!(%conn_id, %flow_id, %stream, "flow drained, deleting");
    ctl.finish_stream(conn_id, stream);
    conn.release_stream(stream, false);
    conn.flows.remove(&flow_id);
}

/// Record the gap since the previous callback for this flow.
fn account_callback(flow: &mut FlowRecord, cfg: &TransportConfig, now: Duration) {
    // ---
    let now_ms = now.as_millis() as u64;
    let queued = flow.tx.size();

    flow.metrics.tx_stream_cb += 1;
    flow.metrics.tx_queue_size.add_value(queued as u64);

    if let Some(last) = flow.last_tx_tick {
        let delta = now_ms.saturating_sub(last);
        flow.metrics.tx_callback_ms.add_value(delta);

        if flow.priority > 0
            && delta > cfg.congestion.delayed_callback_ms
            && queued >= cfg.congestion.delayed_callback_queue_depth
        {
            flow.metrics.tx_delayed_callback += 1;
        }
    }
    flow.last_tx_tick = Some(now_ms);
}

/// Close `old` (reset or FIN) and give the flow a new stream.
///
/// The flow passes through "no stream" in between, so it never owns two
/// current streams.
fn replace_stream(
    conn: &mut ConnectionRecord,
    ctl: &mut dyn EngineControl,
    flow_id: FlowId,
    old: StreamId,
    action: StreamAction,
) {
    // ---
    let conn_id = conn.conn_id;
    match action {
        StreamAction::ReplaceUsingReset => {
            ctl.reset_stream(conn_id, old, STREAM_REPLACED_CODE);
            conn.release_stream(old, true);
        }
        StreamAction::ReplaceUsingFin => {
            ctl.finish_stream(conn_id, old);
            conn.release_stream(old, false);
        }
        StreamAction::NoAction => return,
    }

    let Some(new) = conn.open_stream(flow_id) else {
        return;
    };
    let Some(flow) = conn.flows.get_mut(&flow_id) else {
        return;
    };
    flow.discard_mode = false;

    tracing::debug!(%conn_id, %flow_id, %old, %new, ?action, "stream replaced");
    ctl.set_stream_priority(conn_id, new, Priority::saturating(flow.priority).engine_value());
    ctl.mark_stream_active(conn_id, new, true);
}

fn idle(buf: &mut dyn SendBuffer, still_active: bool) {
    let _ = buf.provide(0, still_active);
}

// ---------------------------------------------------------------------------
// Datagram path
// ---------------------------------------------------------------------------

pub(crate) fn prepare_datagram(conn: &mut ConnectionRecord, buf: &mut dyn SendBuffer) {
    // ---
    let conn_id = conn.conn_id;
    let tx = conn.dgram_tx.clone();
    conn.metrics.tx_dgram_cb += 1;

    let mut queue = tx.queue.lock();
    let front = queue.front();
    conn.metrics.tx_dgram_expired += front.expired as u64;

    let Some(unit) = front.value.cloned() else {
        drop(queue);
        idle(buf, false);
        remove_drained_datagram_flows(conn);
        return;
    };

    let Some(flow) = conn.flows.get_mut(&unit.flow_id) else {
        queue.pop();
        conn.metrics.tx_dgram_drops += 1;
        tracing::debug!(%conn_id, flow_id = %unit.flow_id, "datagram for deleted flow dropped");
        let active = !queue.is_empty();
        drop(queue);
        idle(buf, active);
        return;
    };

    if unit.len() > buf.max_len() {
        // Try again when the engine offers a larger buffer.
        idle(buf, true);
        return;
    }

    let still_active = queue.size() > 1;
    let Some(dst) = buf.provide(unit.len(), still_active) else {
        tracing::warn!(%conn_id, "{}, datagram kept", TransportError::EngineBufferAllocationFailed);
        return;
    };
    dst.copy_from_slice(&unit.data);
    queue.pop();

    flow.metrics.tx_dgrams += 1;
    flow.metrics.tx_dgrams_bytes += unit.len() as u64;

    let drained = queue.is_empty();
    drop(queue);
    if drained {
        remove_drained_datagram_flows(conn);
    }
}

/// Datagram flows share one queue; a graceful delete completes once it is empty.
fn remove_drained_datagram_flows(conn: &mut ConnectionRecord) {
    // ---
    let conn_id = conn.conn_id;
    conn.flows.retain(|flow_id, flow| {
        let remove = !flow.reliable && flow.delete_on_empty;
        if remove {
            tracing::info!(%conn_id, %flow_id, "datagram flow drained, deleting");
        }
        !remove
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use bytes::Bytes;

    use super::*;
    use crate::test_support::{CtlCall, Harness};
    use moqx_domain::{EnqueueFlags, Role, VecSendBuffer};

    fn object(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    // ---

    /// One 20-byte object on a new stream, drained five bytes at a time.
    #[test]
    fn object_streams_across_invocations_on_one_stream() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, true, 2, false).unwrap();

        h.transport
            .enqueue(h.conn, flow, object(20, b'X'), 2, 0, EnqueueFlags::new_stream_fin())
            .unwrap();
        h.pump();

        let stream = h.current_stream(flow).expect("activation opens a stream");
        assert_eq!(h.ctl.opened_streams(), vec![stream], "exactly one stream opened");

        let mut delivered = Vec::new();
        for call in 0..4 {
            let buf = h.prepare(stream, 5);
            assert_eq!(buf.data().len(), 5, "call {call} must carry 5 bytes");
            assert_eq!(buf.still_active(), call < 3, "active until the object is done");
            delivered.extend_from_slice(buf.data());
        }

        assert_eq!(delivered, vec![b'X'; 20]);
        assert_eq!(h.current_stream(flow), Some(stream), "no replacement happened");
        assert!(h.ctl.resets().is_empty() && h.ctl.finishes().is_empty());
        assert_eq!(h.flow_metrics(flow).tx_stream_objects, 1);
    }

    // ---

    /// A reset replacement while an object is 40/100 bytes in.
    #[test]
    fn reset_replacement_abandons_partial_object() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, true, 3, true).unwrap();

        h.transport
            .enqueue(h.conn, flow, object(100, b'a'), 3, 0, EnqueueFlags::default())
            .unwrap();
        h.pump();
        let old = h.current_stream(flow).unwrap();

        assert_eq!(h.prepare(old, 40).data().len(), 40);

        h.transport
            .enqueue(h.conn, flow, object(10, b'b'), 3, 0, EnqueueFlags::new_stream_reset())
            .unwrap();
        h.pump();

        let buf = h.prepare(old, 1_000);
        assert!(buf.data().is_empty(), "the old stream gets nothing more");
        assert!(!buf.still_active());

        let new = h.current_stream(flow).expect("new stream allocated");
        assert_ne!(new, old);
        assert_eq!(h.ctl.resets(), vec![old]);
        assert!(!h.has_rx_stream(old), "receive buffer of the reset stream dropped");
        assert_eq!(h.flow_metrics(flow).tx_buffer_drops, 1);

        let buf = h.prepare(new, 1_000);
        assert_eq!(buf.data(), &[b'b'; 10][..], "the 60 unsent bytes of the old object are gone");
    }

    // ---

    #[test]
    fn fin_replacement_finishes_partial_object_first() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, true, 3, false).unwrap();

        h.transport
            .enqueue(h.conn, flow, object(30, b'a'), 3, 0, EnqueueFlags::default())
            .unwrap();
        h.pump();
        let old = h.current_stream(flow).unwrap();
        assert_eq!(h.prepare(old, 10).data().len(), 10);

        h.transport
            .enqueue(h.conn, flow, object(5, b'b'), 3, 0, EnqueueFlags::new_stream_fin())
            .unwrap();

        let buf = h.prepare(old, 100);
        assert_eq!(buf.data(), &[b'a'; 20][..], "partial object completes on the old stream");
        assert!(buf.still_active());

        let buf = h.prepare(old, 100);
        assert!(buf.data().is_empty());
        assert_eq!(h.ctl.finishes(), vec![old]);
        assert!(h.ctl.resets().is_empty());

        let new = h.current_stream(flow).unwrap();
        assert_ne!(new, old);
        assert_eq!(h.prepare(new, 100).data(), &[b'b'; 5][..]);
        assert_eq!(h.flow_metrics(flow).tx_buffer_drops, 0);
    }

    // ---

    /// Over a sequence of replacements the flow never holds two streams and
    /// the engine only ever sees a new stream after the old one was closed.
    #[test]
    fn replacements_always_pass_through_no_stream() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, true, 1, false).unwrap();
        let mut seen = Vec::new();

        for round in 0..6u8 {
            let flags = if round % 2 == 0 {
                EnqueueFlags::new_stream_reset()
            } else {
                EnqueueFlags::new_stream_fin()
            };
            h.transport.enqueue(h.conn, flow, object(8, round), 1, 0, flags).unwrap();
            h.pump();

            for _ in 0..3 {
                if let Some(stream) = h.current_stream(flow) {
                    h.prepare(stream, 4);
                    if seen.last() != Some(&stream) {
                        seen.push(stream);
                    }
                }
            }
            assert_eq!(h.open_tx_streams(flow), usize::from(h.current_stream(flow).is_some()));
        }

        let opened = h.ctl.opened_streams();
        let closed: Vec<StreamId> = h.ctl.resets().into_iter().chain(h.ctl.finishes()).collect();
        assert_eq!(opened, seen, "every stream the flow used was opened once, in order");
        assert_eq!(closed.len(), opened.len() - 1, "all but the current stream were closed");

        // Each open after the first is preceded by the close of its predecessor.
        for pair in opened.windows(2) {
            assert!(h.ctl.closed_before_opened(pair[0], pair[1]));
        }
    }

    // ---

    #[test]
    fn zero_length_unit_is_dropped_and_counted() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, true, 1, false).unwrap();
        let stream = h.open_stream_for(flow);

        h.push_raw(flow, Bytes::new());
        h.push_raw(flow, object(3, 1));

        let buf = h.prepare(stream, 100);
        assert!(buf.data().is_empty());
        assert!(buf.still_active(), "more data queued behind the empty unit");
        assert_eq!(h.flow_metrics(flow).tx_zero_length_drops, 1);
        assert_eq!(h.prepare(stream, 100).data().len(), 3);
    }

    // ---

    #[test]
    fn allocation_failure_keeps_object_for_next_callback() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, true, 1, false).unwrap();
        h.transport
            .enqueue(h.conn, flow, object(6, 7), 1, 0, EnqueueFlags::default())
            .unwrap();
        h.pump();
        let stream = h.current_stream(flow).unwrap();

        let mut failing = VecSendBuffer::failing(100);
        h.prepare_into(stream, &mut failing);
        assert!(!failing.was_provided());

        assert_eq!(h.prepare(stream, 100).data(), &[7; 6][..], "nothing was lost");
    }

    // ---

    #[test]
    fn expired_units_never_reach_the_stream() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, true, 1, false).unwrap();
        for _ in 0..3 {
            h.transport
                .enqueue(h.conn, flow, object(4, 1), 1, 100, EnqueueFlags::default())
                .unwrap();
        }
        h.pump();
        let stream = h.current_stream(flow).unwrap();

        h.clock.advance_ms(150);
        let buf = h.prepare(stream, 100);
        assert!(buf.data().is_empty());
        assert!(!buf.still_active());
        assert_eq!(h.flow_metrics(flow).tx_queue_expired, 3);
    }

    // ---

    #[test]
    fn discard_mode_drops_until_stream_action() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, true, 5, false).unwrap();
        let stream = h.open_stream_for(flow);

        // Carry some bytes so the next replacement is not skipped.
        h.push_raw(flow, object(2, 0));
        h.prepare(stream, 100);

        for i in 1..=3 {
            h.push_raw(flow, object(2, i));
        }
        h.set_discard_mode(flow);

        for _ in 0..3 {
            let buf = h.prepare(stream, 100);
            assert!(buf.data().is_empty(), "discarded units are never sent");
        }
        assert_eq!(h.flow_metrics(flow).tx_queue_discards, 3);

        h.transport
            .enqueue(h.conn, flow, object(2, 9), 5, 0, EnqueueFlags::new_stream_reset())
            .unwrap();
        h.push_raw(flow, object(2, 10));
        let buf = h.prepare(stream, 100);
        assert!(buf.data().is_empty());

        let new = h.current_stream(flow).unwrap();
        assert_ne!(new, stream);
        assert!(!h.discard_mode(flow), "a stream action ends discard mode");
        assert_eq!(h.prepare(new, 100).data(), &[9, 9][..]);
        assert_eq!(h.prepare(new, 100).data(), &[10, 10][..]);
    }

    // ---

    #[test]
    fn graceful_delete_completes_when_queue_expires() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, true, 1, false).unwrap();
        for _ in 0..3 {
            h.transport
                .enqueue(h.conn, flow, object(4, 1), 1, 100, EnqueueFlags::default())
                .unwrap();
        }
        h.pump();
        let stream = h.current_stream(flow).unwrap();

        h.transport.delete_flow(h.conn, flow, true).unwrap();
        h.pump();
        assert!(h.has_flow(flow), "backlog keeps the flow alive");

        h.clock.advance_ms(200);
        let buf = h.prepare(stream, 100);
        assert!(buf.data().is_empty());
        assert!(!buf.still_active());

        assert!(!h.has_flow(flow), "the flow goes once nothing is left to send");
        assert_eq!(h.ctl.finishes(), vec![stream]);
        assert!(h.ctl.resets().is_empty());
        assert_eq!(h.open_tx_streams(flow), 0);
    }

    // ---

    #[test]
    fn graceful_delete_completes_when_discards_empty_the_queue() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, true, 5, false).unwrap();
        let stream = h.open_stream_for(flow);
        for i in 0..3 {
            h.push_raw(flow, object(2, i));
        }
        h.set_discard_mode(flow);
        h.transport.delete_flow(h.conn, flow, true).unwrap();

        for _ in 0..2 {
            assert!(h.prepare(stream, 100).data().is_empty());
            assert!(h.has_flow(flow), "units still queued");
        }
        assert!(h.prepare(stream, 100).data().is_empty());

        assert!(!h.has_flow(flow), "the last discard completes the delete");
        assert_eq!(h.ctl.finishes(), vec![stream]);

        let late = h.prepare(stream, 100);
        assert!(late.data().is_empty() && !late.still_active());
    }

    // ---

    #[test]
    fn callback_gaps_count_as_delayed_under_backlog() {
        // ---
        let mut cfg = moqx_domain::TransportConfig::default();
        cfg.congestion.delayed_callback_queue_depth = 2;
        let mut h = Harness::with_config(cfg);
        let flow = h.transport.create_flow(h.conn, true, 3, false).unwrap();
        let stream = h.open_stream_for(flow);
        for i in 0..6 {
            h.push_raw(flow, object(1, i));
        }

        h.prepare(stream, 100);
        h.clock.advance_ms(10);
        h.prepare(stream, 100);
        h.clock.advance_ms(80);
        h.prepare(stream, 100);

        let m = h.flow_metrics(flow);
        assert_eq!(m.tx_delayed_callback, 1, "only the 80 ms gap is delayed");
        assert_eq!(m.tx_callback_ms.max, 80);
    }

    // ---

    #[test]
    fn stale_stream_callback_is_idle() {
        // ---
        let mut h = Harness::new();
        let buf = h.prepare(StreamId::new(Role::Client, false, 42), 100);
        assert!(buf.was_provided() && !buf.still_active());
        assert_eq!(h.ctl.calls, Vec::<CtlCall>::new());
    }

    // ---

    #[test]
    fn datagram_sent_whole_or_not_at_all() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, false, 1, false).unwrap();
        h.transport
            .enqueue(h.conn, flow, object(50, 1), 1, 0, EnqueueFlags::default())
            .unwrap();
        h.transport
            .enqueue(h.conn, flow, object(10, 2), 1, 0, EnqueueFlags::default())
            .unwrap();

        let small = h.prepare_datagram(20);
        assert!(small.data().is_empty(), "a datagram is never split");
        assert!(small.still_active(), "retry later with a larger buffer");

        let big = h.prepare_datagram(1200);
        assert_eq!(big.data().len(), 50);
        assert!(big.still_active());

        let last = h.prepare_datagram(1200);
        assert_eq!(last.data().len(), 10);
        assert!(!last.still_active());
        assert_eq!(h.flow_metrics(flow).tx_dgrams, 2);
    }

    // ---

    #[test]
    fn datagram_for_deleted_flow_is_dropped() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, false, 1, false).unwrap();
        h.transport
            .enqueue(h.conn, flow, object(5, 1), 1, 0, EnqueueFlags::default())
            .unwrap();
        h.transport.delete_flow(h.conn, flow, false).unwrap();

        let buf = h.prepare_datagram(1200);
        assert!(buf.data().is_empty());
        assert_eq!(h.conn_metrics().tx_dgram_drops, 1);
    }
}
