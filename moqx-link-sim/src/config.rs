// ---------------------------------------------------------------------------
// LinkSimConfig
// ---------------------------------------------------------------------------

/// Configuration for the in-process link simulator.
///
/// All fields default to a perfect link: no drops, no cap.
#[derive(Debug, Clone)]
pub struct LinkSimConfig {
    // ---
    /// Probability `[0.0, 1.0]` that a datagram is silently dropped.
    /// Streams are never dropped.
    pub drop_percent: f64,

    /// Probability `[0.0, 1.0]` that a datagram is delivered twice.
    pub dup_percent: f64,

    /// Caps stream and datagram bytes together, in bytes per second,
    /// using a token bucket. `None` = unlimited.
    pub bw_cap_bps: Option<u64>,

    /// RNG seed for reproducible drop / dup sequences. `None` = random.
    pub seed: Option<u64>,

    /// Largest datagram buffer offered to the core.
    pub max_datagram_size: usize,

    /// Largest stream write offered per callback.
    pub stream_chunk: usize,

    /// Congestion window reported until changed through the handle.
    pub cwin_bytes: u64,

    /// Round-trip time reported in path quality.
    pub rtt_us: u64,
}

// ---

impl Default for LinkSimConfig {
    fn default() -> Self {
        // ---
        Self {
            drop_percent: 0.0,
            dup_percent: 0.0,
            bw_cap_bps: None,
            seed: None,
            max_datagram_size: 1_200,
            stream_chunk: 1_200,
            cwin_bytes: 1_000_000,
            rtt_us: 1_000,
        }
    }
}

// ---

impl LinkSimConfig {
    // ---
    /// Perfect link, no impairments. Useful as a baseline.
    pub fn perfect() -> Self {
        Self::default()
    }

    // ---

    /// Typical degraded satellite link: 5 % loss, 1 % dup, 512 kbit/s.
    pub fn degraded() -> Self {
        // ---
        Self {
            drop_percent: 0.05,
            dup_percent: 0.01,
            bw_cap_bps: Some(64_000),
            cwin_bytes: 16_000,
            rtt_us: 600_000,
            ..Default::default()
        }
    }

    // ---

    /// Link whose congestion window sits below the default low-cwin
    /// threshold. Paired with injected retransmits it drives the
    /// congestion monitor.
    pub fn constrained() -> Self {
        // ---
        Self {
            cwin_bytes: 2_000,
            rtt_us: 80_000,
            ..Default::default()
        }
    }

    /// `(drop, dup)` clamped into `[0.0, 1.0]`.
    pub(crate) fn probabilities(&self) -> (f64, f64) {
        (
            self.drop_percent.clamp(0.0, 1.0),
            self.dup_percent.clamp(0.0, 1.0),
        )
    }
}
