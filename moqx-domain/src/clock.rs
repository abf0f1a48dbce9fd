//! Monotonic time source for queues and the network loop.
//!
//! Everything that ages data (TTL expiry, delayed pops, callback deltas,
//! congestion sampling) reads time through [`Clock`] so tests can drive
//! it with a [`ManualClock`] instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    // ---
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;

    fn now_ms(&self) -> u64 {
        self.now().as_millis() as u64
    }
}

pub type ClockPtr = Arc<dyn Clock>;

// ---------------------------------------------------------------------------
// SystemClock
// ---------------------------------------------------------------------------

/// Wall clock backed by [`Instant`]. Origin is the construction time.
#[derive(Debug, Clone)]
pub struct SystemClock {
    // ---
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> ClockPtr {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Clock that only moves when told to. Starts at zero.
#[derive(Debug, Default)]
pub struct ManualClock {
    // ---
    micros: AtomicU64,
}

impl ManualClock {
    // ---
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, by: Duration) {
        self.micros
            .fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    pub fn set(&self, at: Duration) {
        self.micros.store(at.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
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
    fn manual_clock_moves_only_when_advanced() {
        // ---
        let clock = ManualClock::new();
        assert_eq!(clock.now_ms(), 0);

        clock.advance_ms(250);
        clock.advance(Duration::from_micros(500));
        assert_eq!(clock.now(), Duration::from_micros(250_500));
        assert_eq!(clock.now_ms(), 250);

        clock.set(Duration::from_secs(2));
        assert_eq!(clock.now_ms(), 2_000);
    }
}
