//! Connection and flow counters.
//!
//! Plain counters are cumulative for the life of the record. [`MinMaxAvg`]
//! fields accumulate per metrics period and are cleared by `reset_period`
//! after each snapshot is posted.

use serde::Serialize;

// ---------------------------------------------------------------------------
// MinMaxAvg
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MinMaxAvg {
    // ---
    pub min: u64,
    pub max: u64,
    pub avg: u64,
    pub value_sum: u64,
    pub value_count: u64,
}

impl MinMaxAvg {
    // ---
    pub fn add_value(&mut self, value: u64) {
        // ---
        self.min = if self.value_count == 0 {
            value
        } else {
            self.min.min(value)
        };
        self.max = self.max.max(value);
        self.value_sum = self.value_sum.saturating_add(value);
        self.value_count += 1;
        self.avg = self.value_sum / self.value_count;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// ConnectionMetrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionMetrics {
    // ---
    /// Congestion sweeps that sampled a congestion window below the low mark.
    pub cwin_congested: u64,
    pub prev_cwin_congested: u64,
    /// Sweeps that judged the connection congested.
    pub tx_congested: u64,

    pub tx_rate_bps: MinMaxAvg,
    pub rx_rate_bps: MinMaxAvg,
    pub tx_cwin_bytes: MinMaxAvg,
    pub tx_in_transit_bytes: MinMaxAvg,
    pub rtt_us: MinMaxAvg,
    pub srtt_us: MinMaxAvg,

    pub tx_retransmits: u64,
    pub tx_lost_pkts: u64,
    pub tx_timer_losses: u64,
    pub tx_spurious_losses: u64,

    pub rx_dgrams: u64,
    pub rx_dgrams_bytes: u64,
    /// Received datagrams evicted because the receive queue was full.
    pub rx_dgram_drops: u64,

    pub tx_dgram_cb: u64,
    pub tx_dgram_ack: u64,
    pub tx_dgram_lost: u64,
    pub tx_dgram_spurious: u64,
    /// Datagrams dropped because their flow no longer exists.
    pub tx_dgram_drops: u64,
    pub tx_dgram_expired: u64,

    /// Queued units released when the connection closed.
    pub tx_units_closed: u64,
}

impl ConnectionMetrics {
    // ---
    pub fn reset_period(&mut self) {
        // ---
        self.tx_rate_bps.clear();
        self.rx_rate_bps.clear();
        self.tx_cwin_bytes.clear();
        self.tx_in_transit_bytes.clear();
        self.rtt_us.clear();
        self.srtt_us.clear();
    }
}

// ---------------------------------------------------------------------------
// FlowMetrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlowMetrics {
    // ---
    pub enqueued_objs: u64,

    pub rx_stream_cb: u64,
    pub rx_stream_bytes: u64,

    /// Partially written objects abandoned by a stream reset.
    pub tx_buffer_drops: u64,
    /// Units discarded by discard mode or `clear_queue`.
    pub tx_queue_discards: u64,
    pub tx_queue_expired: u64,
    pub tx_delayed_callback: u64,
    pub prev_tx_delayed_callback: u64,
    /// Times the congestion monitor put this flow into discard mode.
    pub tx_reset_wait: u64,
    pub tx_zero_length_drops: u64,

    pub tx_queue_size: MinMaxAvg,
    pub tx_callback_ms: MinMaxAvg,
    pub tx_object_duration_us: MinMaxAvg,

    pub tx_dgrams: u64,
    pub tx_dgrams_bytes: u64,
    pub tx_stream_cb: u64,
    pub tx_stream_objects: u64,
    pub tx_stream_bytes: u64,
}

impl FlowMetrics {
    // ---
    pub fn reset_period(&mut self) {
        // ---
        self.tx_queue_size.clear();
        self.tx_callback_ms.clear();
        self.tx_object_duration_us.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn min_max_avg_tracks_period() {
        // ---
        let mut m = MinMaxAvg::default();
        m.add_value(10);
        m.add_value(0);
        m.add_value(50);

        assert_eq!(m.min, 0, "zero is a real minimum, not 'unset'");
        assert_eq!(m.max, 50);
        assert_eq!(m.avg, 20);
        assert_eq!(m.value_count, 3);

        m.clear();
        assert_eq!(m, MinMaxAvg::default());
    }

    #[test]
    fn reset_period_keeps_counters() {
        // ---
        let mut f = FlowMetrics {
            tx_stream_objects: 4,
            ..Default::default()
        };
        f.tx_callback_ms.add_value(7);
        f.reset_period();

        assert_eq!(f.tx_stream_objects, 4, "cumulative counters survive a period reset");
        assert_eq!(f.tx_callback_ms.value_count, 0);
    }

    #[test]
    fn snapshots_serialize() {
        // ---
        let json = serde_json::to_value(ConnectionMetrics::default()).unwrap();
        assert!(json.get("tx_congested").is_some());
        assert!(json["rtt_us"].get("avg").is_some());
    }
}
