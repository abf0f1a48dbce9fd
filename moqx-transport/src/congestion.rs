//! Periodic congestion sweep.
//!
//! A connection is judged congested when any of these hold since the
//! previous sweep:
//!
//! - a flow at or below `delayed_callback_min_priority` urgency saw its
//!   delayed-callback counter grow by more than `delayed_callback_delta`
//! - a flow's queue reached `queue_depth`
//! - the congestion window was sampled low and retransmits grew by more
//!   than `retransmit_delta`
//!
//! Leaving the congested state takes `clear_after_checks` clean sweeps in
//! a row.

use moqx_domain::{CongestionConfig, EngineControl, FlowId, PathQuality, TransportConfig};

// ---

use crate::scheduler;
use crate::state::ConnectionRecord;

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

pub(crate) fn check_connection(conn: &mut ConnectionRecord, ctl: &mut dyn EngineControl, config: &TransportConfig) {
    // ---
    let cfg = &config.congestion;
    let conn_id = conn.conn_id;

    if let Some(pq) = ctl.path_quality(conn_id) {
        sample_path(conn, &pq, cfg);
    }
    let retransmit_delta = conn.metrics.tx_retransmits.saturating_sub(conn.prev_retransmits);
    conn.prev_retransmits = conn.metrics.tx_retransmits;
    let cwin_low = conn.metrics.cwin_congested > conn.metrics.prev_cwin_congested;
    conn.metrics.prev_cwin_congested = conn.metrics.cwin_congested;

    let mut congested = cwin_low && retransmit_delta > cfg.retransmit_delta;
    let mut candidate: Option<(u8, FlowId)> = None;
    let mut stalled = Vec::new();

    for (&flow_id, flow) in conn.flows.iter_mut() {
        if flow.discard_mode {
            continue;
        }

        let delayed = flow.metrics.tx_delayed_callback - flow.metrics.prev_tx_delayed_callback;
        flow.metrics.prev_tx_delayed_callback = flow.metrics.tx_delayed_callback;
        if flow.priority >= cfg.delayed_callback_min_priority && delayed > cfg.delayed_callback_delta {
            tracing::debug!(%conn_id, %flow_id, delayed, "delayed callbacks");
            congested = true;
        }

        let backlog = flow.backlog();
        if flow.reliable && backlog >= cfg.queue_depth {
            tracing::debug!(%conn_id, %flow_id, backlog, "queue over depth");
            congested = true;
        }

        let eligible = flow.reliable
            && flow.current_stream.is_some()
            && flow.priority >= cfg.reset_wait_min_priority;
        if eligible && candidate.map_or(true, |(p, _)| flow.priority > p) {
            candidate = Some((flow.priority, flow_id));
        }

        if flow.reliable && backlog > 0 {
            stalled.push(flow_id);
        }
    }

    if congested {
        conn.metrics.tx_congested += 1;
        conn.not_congested_gauge = 0;
        if !conn.congested {
            tracing::info!(%conn_id, "connection congested");
        }
        conn.congested = true;

        if config.use_reset_wait_strategy {
            if let Some((priority, flow_id)) = candidate {
                if let Some(flow) = conn.flows.get_mut(&flow_id) {
                    flow.discard_mode = true;
                    flow.metrics.tx_reset_wait += 1;
                    tracing::info!(%conn_id, %flow_id, priority, "reset-and-wait: flow discarding until next stream");
                }
            }
        }
    } else if conn.congested {
        conn.not_congested_gauge += 1;
        if conn.not_congested_gauge >= cfg.clear_after_checks {
            tracing::info!(%conn_id, checks = conn.not_congested_gauge, "connection congestion cleared");
            conn.congested = false;
            conn.not_congested_gauge = 0;
        }
    }

    // Backlogged flows are re-activated in case an activation request was
    // lost to a full runner queue.
    for flow_id in stalled {
        scheduler::activate_flow(conn, ctl, flow_id);
    }
}

fn sample_path(conn: &mut ConnectionRecord, pq: &PathQuality, cfg: &CongestionConfig) {
    // ---
    let m = &mut conn.metrics;
    m.rtt_us.add_value(pq.rtt_us);
    m.srtt_us.add_value(pq.srtt_us);
    m.tx_cwin_bytes.add_value(pq.cwin_bytes);
    m.tx_in_transit_bytes.add_value(pq.bytes_in_transit);
    m.tx_rate_bps.add_value(pq.tx_rate_bps);
    m.rx_rate_bps.add_value(pq.rx_rate_bps);

    m.tx_retransmits = pq.retransmits;
    m.tx_lost_pkts = pq.lost_packets;
    m.tx_timer_losses = pq.timer_losses;
    m.tx_spurious_losses = pq.spurious_losses;

    if pq.cwin_bytes < cfg.low_cwin_bytes {
        m.cwin_congested += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use bytes::Bytes;

    use super::*;
    use crate::test_support::Harness;
    use moqx_domain::{EnqueueFlags, TransportConfig};

    fn reset_wait_config() -> TransportConfig {
        // ---
        let mut cfg = TransportConfig::default();
        cfg.use_reset_wait_strategy = true;
        cfg
    }

    fn fill(h: &mut Harness, flow: FlowId, priority: u8, n: usize) {
        // ---
        for i in 0..n {
            h.transport
                .enqueue(h.conn, flow, Bytes::from(vec![i as u8; 4]), priority, 0, EnqueueFlags::default())
                .unwrap();
        }
    }

    /// Queue depth 60 against a threshold of 50 on a priority-5 flow.
    #[test]
    fn deep_queue_puts_flow_into_discard_mode() {
        // ---
        let mut h = Harness::with_config(reset_wait_config());
        let flow = h.transport.create_flow(h.conn, true, 5, false).unwrap();
        fill(&mut h, flow, 5, 60);
        h.pump();
        let stream = h.current_stream(flow).unwrap();

        h.sweep();
        assert!(h.is_congested());
        assert!(h.discard_mode(flow));
        assert_eq!(h.flow_metrics(flow).tx_reset_wait, 1);

        for _ in 0..60 {
            assert!(h.prepare(stream, 1_000).data().is_empty(), "backlog is shed, not sent");
        }
        assert_eq!(h.flow_metrics(flow).tx_queue_discards, 60);

        h.transport
            .enqueue(h.conn, flow, Bytes::from_static(b"key"), 5, 0, EnqueueFlags::new_stream_reset())
            .unwrap();
        let sent = h.prepare(stream, 1_000);
        assert!(!h.discard_mode(flow));
        assert_eq!(sent.data(), b"key", "nothing reached the stream, so it is kept");
        assert_eq!(h.current_stream(flow), Some(stream));
    }

    #[test]
    fn least_urgent_open_flow_is_sacrificed() {
        // ---
        let mut h = Harness::with_config(reset_wait_config());
        let urgent = h.transport.create_flow(h.conn, true, 4, false).unwrap();
        let bulk = h.transport.create_flow(h.conn, true, 9, false).unwrap();
        let control = h.transport.create_flow(h.conn, true, 0, false).unwrap();

        fill(&mut h, urgent, 4, 55);
        fill(&mut h, bulk, 9, 1);
        fill(&mut h, control, 0, 1);
        h.pump();

        h.sweep();
        assert!(h.discard_mode(bulk), "highest priority value is the victim");
        assert!(!h.discard_mode(urgent));
        assert!(!h.discard_mode(control), "flows below the reset-wait priority are exempt");
    }

    #[test]
    fn no_discard_without_reset_wait_strategy() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, true, 5, false).unwrap();
        fill(&mut h, flow, 5, 60);
        h.pump();

        h.sweep();
        assert!(h.is_congested());
        assert!(!h.discard_mode(flow));
    }

    #[test]
    fn congestion_clears_after_consecutive_clean_sweeps() {
        // ---
        let mut h = Harness::new();
        let flow = h.transport.create_flow(h.conn, true, 5, false).unwrap();
        fill(&mut h, flow, 5, 60);
        h.pump();
        h.sweep();
        assert!(h.is_congested());

        let stream = h.current_stream(flow).unwrap();
        while !h.prepare(stream, 1_000).data().is_empty() {}

        let clear_after = TransportConfig::default().congestion.clear_after_checks;
        for _ in 1..clear_after {
            h.sweep();
            assert!(h.is_congested(), "hysteresis holds the state");
        }
        h.sweep();
        assert!(!h.is_congested());
        assert_eq!(h.conn_metrics().tx_congested, 1);
    }

    #[test]
    fn retransmits_with_low_cwin_count_as_congestion() {
        // ---
        let mut h = Harness::new();
        h.ctl.set_quality(h.conn, PathQuality { cwin_bytes: 100_000, ..Default::default() });
        h.sweep();
        assert!(!h.is_congested());

        // Retransmits alone are not enough.
        h.ctl.set_quality(h.conn, PathQuality { cwin_bytes: 100_000, retransmits: 10, ..Default::default() });
        h.sweep();
        assert!(!h.is_congested());

        h.ctl.set_quality(h.conn, PathQuality { cwin_bytes: 2_000, retransmits: 20, ..Default::default() });
        h.sweep();
        assert!(h.is_congested());

        let m = h.conn_metrics();
        assert_eq!(m.cwin_congested, 1);
        assert_eq!(m.tx_retransmits, 20);
        assert_eq!(m.tx_cwin_bytes.min, 2_000);
    }

    #[test]
    fn delayed_callbacks_count_as_congestion() {
        // ---
        let mut cfg = TransportConfig::default();
        cfg.congestion.delayed_callback_queue_depth = 1;
        let mut h = Harness::with_config(cfg);
        let flow = h.transport.create_flow(h.conn, true, 3, false).unwrap();
        fill(&mut h, flow, 3, 10);
        h.pump();
        let stream = h.current_stream(flow).unwrap();

        h.prepare(stream, 1);
        for _ in 0..3 {
            h.clock.advance_ms(100);
            h.prepare(stream, 1);
        }
        assert_eq!(h.flow_metrics(flow).tx_delayed_callback, 3);

        h.sweep();
        assert!(h.is_congested());
    }
}
