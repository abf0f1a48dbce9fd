use serde::{Deserialize, Serialize};

// ---

use super::error::{Result, TransportError};

/// Send priority for flows and units.
///
/// Range is `0..=127`; lower values are more urgent. The engine receives
/// the value shifted left by one, leaving bit 0 free for its own
/// incremental-scheduling flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(u8);

// ---

impl Priority {
    // ---
    pub const MAX: u8 = 127;

    /// Most urgent level. Typically used for control flows.
    pub const HIGHEST: Priority = Priority(0);

    pub fn new(value: u8) -> Result<Self> {
        // ---
        if value > Self::MAX {
            return Err(TransportError::InvalidPriority(value));
        }
        Ok(Self(value))
    }

    /// Saturate out-of-range values to [`Priority::MAX`].
    pub fn saturating(value: u8) -> Self {
        Self(value.min(Self::MAX))
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Value handed to the QUIC engine's stream scheduler.
    pub fn engine_value(self) -> u8 {
        self.0 << 1
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
