//! Mapping from [`TransportConfig`] to quinn's transport parameters.

use std::sync::Arc;
use std::time::Duration;

// ---

use quinn::congestion::{BbrConfig, CubicConfig};

// ---

use moqx_domain::TransportConfig;

// ---

use crate::error::QuicError;

/// quinn refuses windows below a couple of packets.
const MIN_INITIAL_WINDOW: u64 = 14_720;

pub(crate) fn transport_config(cfg: &TransportConfig) -> Result<quinn::TransportConfig, QuicError> {
    // ---
    let mut tc = quinn::TransportConfig::default();

    if cfg.idle_timeout_ms > 0 {
        let idle = Duration::from_millis(cfg.idle_timeout_ms);
        let timeout = quinn::IdleTimeout::try_from(idle).map_err(|e| QuicError::Config(e.to_string()))?;
        tc.max_idle_timeout(Some(timeout));
        tc.keep_alive_interval(Some(idle / 3));
    } else {
        tc.max_idle_timeout(None);
    }

    let window = cfg.quic_cwin_minimum.max(MIN_INITIAL_WINDOW);
    if cfg.use_bbr {
        let mut bbr = BbrConfig::default();
        bbr.initial_window(window);
        tc.congestion_controller_factory(Arc::new(bbr));
    } else {
        let mut cubic = CubicConfig::default();
        cubic.initial_window(window);
        tc.congestion_controller_factory(Arc::new(cubic));
    }

    Ok(tc)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn defaults_and_variants_are_accepted() {
        // ---
        let mut cfg = TransportConfig::default();
        assert!(transport_config(&cfg).is_ok());

        cfg.use_bbr = false;
        cfg.idle_timeout_ms = 0;
        cfg.quic_cwin_minimum = 0;
        assert!(transport_config(&cfg).is_ok());
    }
}
