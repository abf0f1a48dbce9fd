//! Transport tuning knobs.
//!
//! Every field has a working default; deserialising a partial JSON object
//! fills the rest from [`Default`].

use serde::{Deserialize, Serialize};

// ---

use super::error::{Result, TransportError};

// ---------------------------------------------------------------------------
// CongestionConfig
// ---------------------------------------------------------------------------

/// Thresholds for the periodic congestion sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionConfig {
    // ---
    pub check_interval_ms: u64,

    /// A flow with at least this many queued units counts as congested.
    pub queue_depth: usize,

    /// Flows more urgent than this are ignored by the delayed-callback rule
    /// (control flows).
    pub delayed_callback_min_priority: u8,

    /// Delayed-callback increase per sweep that counts as congested.
    pub delayed_callback_delta: u64,

    /// Gap between two prepare callbacks on one flow that counts as delayed.
    pub delayed_callback_ms: u64,

    /// Queue depth a flow must have for a slow callback to count as delayed.
    pub delayed_callback_queue_depth: usize,

    /// Retransmit increase per sweep that counts as congested, when the
    /// congestion window is also low.
    pub retransmit_delta: u64,

    pub low_cwin_bytes: u64,

    /// Consecutive clean sweeps needed to leave the congested state.
    pub clear_after_checks: u32,

    /// Flows with a priority value at or above this may be picked for reset-and-wait.
    pub reset_wait_min_priority: u8,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        // ---
        Self {
            check_interval_ms: 100,
            queue_depth: 50,
            delayed_callback_min_priority: 2,
            delayed_callback_delta: 1,
            delayed_callback_ms: 50,
            delayed_callback_queue_depth: 20,
            retransmit_delta: 2,
            low_cwin_bytes: 4_000,
            clear_after_checks: 5,
            reset_wait_min_priority: 4,
        }
    }
}

// ---------------------------------------------------------------------------
// TransportConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    // ---
    /// Initial capacity reserved for each priority level of a send queue.
    pub time_queue_init_queue_size: usize,

    /// Maximum TTL in milliseconds. Zero TTLs use this value.
    pub time_queue_max_duration_ms: u32,

    /// Received-datagram queue bound per connection.
    pub time_queue_rx_size: usize,

    pub debug: bool,

    /// Minimum / initial congestion window handed to the QUIC engine.
    pub quic_cwin_minimum: u64,

    pub idle_timeout_ms: u64,

    /// Sacrifice one congested flow's backlog to relieve the connection.
    pub use_reset_wait_strategy: bool,

    /// BBR when true, the engine's loss-based default otherwise.
    pub use_bbr: bool,

    /// Upper bound on one engine poll inside the network loop.
    pub loop_max_delay_us: u64,

    pub metrics_interval_ms: u64,

    pub runner_queue_size: usize,
    pub notify_queue_size: usize,

    /// Receive notifications are skipped while the notifier backlog exceeds this.
    pub notify_backlog_warn: usize,

    /// Datagram notifications are posted only while the receive queue is
    /// shallower than this.
    pub dgram_notify_depth: usize,

    /// Priority given to flows created for peer-initiated bidirectional streams.
    pub peer_bidir_priority: u8,

    pub congestion: CongestionConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        // ---
        Self {
            time_queue_init_queue_size: 1_000,
            time_queue_max_duration_ms: 1_000,
            time_queue_rx_size: 1_000,
            debug: false,
            quic_cwin_minimum: 131_072,
            idle_timeout_ms: 30_000,
            use_reset_wait_strategy: false,
            use_bbr: true,
            loop_max_delay_us: 500,
            metrics_interval_ms: 5_000,
            runner_queue_size: 2_000,
            notify_queue_size: 2_000,
            notify_backlog_warn: 100,
            dgram_notify_depth: 10,
            peer_bidir_priority: 10,
            congestion: CongestionConfig::default(),
        }
    }
}

// ---

impl TransportConfig {
    // ---
    pub fn validate(&self) -> Result<()> {
        // ---
        let checks: [(&str, bool); 7] = [
            ("time_queue_max_duration_ms", self.time_queue_max_duration_ms > 0),
            ("time_queue_rx_size", self.time_queue_rx_size > 0),
            ("runner_queue_size", self.runner_queue_size > 0),
            ("notify_queue_size", self.notify_queue_size > 0),
            ("metrics_interval_ms", self.metrics_interval_ms > 0),
            (
                "congestion.check_interval_ms",
                self.congestion.check_interval_ms > 0,
            ),
            ("peer_bidir_priority", self.peer_bidir_priority <= 127),
        ];

        for (field, ok) in checks {
            if !ok {
                return Err(TransportError::InvalidConfig(format!(
                    "{field} out of range"
                )));
            }
        }
        Ok(())
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
    fn partial_json_fills_defaults() {
        // ---
        let cfg: TransportConfig = serde_json::from_str(
            r#"{ "use_reset_wait_strategy": true, "congestion": { "queue_depth": 80 } }"#,
        )
        .unwrap();

        assert!(cfg.use_reset_wait_strategy);
        assert_eq!(cfg.congestion.queue_depth, 80);
        assert_eq!(cfg.congestion.clear_after_checks, 5);
        assert_eq!(cfg.idle_timeout_ms, 30_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_interval_rejected() {
        // ---
        let mut cfg = TransportConfig::default();
        cfg.congestion.check_interval_ms = 0;
        assert!(matches!(
            cfg.validate(),
            Err(TransportError::InvalidConfig(_))
        ));
    }
}
