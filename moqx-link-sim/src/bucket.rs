use std::time::Instant;

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

/// Token bucket for bandwidth capping in the simulated link.
///
/// Tokens represent bytes. [`TokenBucket::grant`] refills from elapsed
/// wall time at the configured rate and reports how many bytes may be
/// written now; the caller then [`consume`](TokenBucket::consume)s what it
/// actually wrote. Capacity is capped at one second's worth so long idle
/// periods cannot accumulate an unbounded burst allowance.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    // ---
    /// Bytes per second limit.
    rate_bps: u64,

    /// Available tokens (bytes).
    tokens: f64,

    /// Last refill timestamp.
    last_refill: Instant,
}

// ---

impl TokenBucket {
    // ---
    pub(crate) fn new(rate_bps: u64) -> Self {
        // ---
        Self {
            rate_bps,
            tokens: 0.0, // start empty, the first write pays for tokens via refill
            last_refill: Instant::now(),
        }
    }

    // ---

    /// Refill from elapsed time, then return up to `n` available bytes.
    pub(crate) fn grant(&mut self, n: usize) -> usize {
        // ---
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        let cap = self.rate_bps as f64;
        self.tokens = (self.tokens + elapsed * cap).min(cap);

        (self.tokens as usize).min(n)
    }

    /// Spend `n` bytes. May go negative when a datagram larger than the
    /// grant was written; the debt is repaid by later refills.
    pub(crate) fn consume(&mut self, n: usize) {
        self.tokens -= n as f64;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::Duration;

    use super::TokenBucket;

    /// Verify the token bucket refills at the configured rate.
    #[test]
    fn token_bucket_caps_throughput() {
        // ---
        let rate = 1_000_000_u64; // 1 MB/s
        let mut bucket = TokenBucket::new(rate);

        // Bucket starts empty, so an immediate grant is (nearly) nothing.
        let got = bucket.grant(1_000_000);
        assert!(got < 10_000, "empty bucket granted {got} bytes");
        bucket.consume(got);

        // After 100ms, ~100 KB should have refilled.
        std::thread::sleep(Duration::from_millis(100));
        let got = bucket.grant(1_000_000) as f64;
        let expected = rate as f64 * 0.1;
        let delta = (got - expected).abs() / expected;
        assert!(
            delta < 0.5,
            "after 100ms refill, got {got} bytes, expected ~{expected} (delta {:.1}%)",
            delta * 100.0
        );
    }

    #[test]
    fn debt_delays_the_next_grant() {
        // ---
        let mut bucket = TokenBucket::new(1_000);
        bucket.consume(5_000);
        assert_eq!(bucket.grant(100), 0, "overdrawn bucket grants nothing");
    }
}
