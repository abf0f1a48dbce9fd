use std::time::Duration;

// ---

use bytes::Bytes;
use serde::Serialize;

// ---

use super::ids::{ConnId, FlowId};

// ---------------------------------------------------------------------------
// StreamAction
// ---------------------------------------------------------------------------

/// Stream lifecycle instruction carried by a send unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum StreamAction {
    // ---
    #[default]
    NoAction,

    /// Abruptly reset the current stream and open a new one.
    ReplaceUsingReset,

    /// Finish the current stream cleanly and open a new one.
    ReplaceUsingFin,
}

impl StreamAction {
    pub fn is_replace(self) -> bool {
        self != StreamAction::NoAction
    }
}

// ---------------------------------------------------------------------------
// EnqueueFlags
// ---------------------------------------------------------------------------

/// Per-enqueue stream and queue handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueFlags {
    // ---
    /// Start this object on a fresh stream.
    pub new_stream: bool,

    /// With `new_stream`, close the previous stream by reset instead of FIN.
    pub use_reset: bool,

    /// Discard everything already queued on the flow before pushing.
    pub clear_queue: bool,
}

impl EnqueueFlags {
    // ---
    pub fn new_stream_fin() -> Self {
        Self {
            new_stream: true,
            ..Default::default()
        }
    }

    pub fn new_stream_reset() -> Self {
        Self {
            new_stream: true,
            use_reset: true,
            ..Default::default()
        }
    }

    /// Stream action implied by these flags.
    pub fn stream_action(&self) -> StreamAction {
        // ---
        match (self.new_stream, self.use_reset) {
            (false, _) => StreamAction::NoAction,
            (true, true) => StreamAction::ReplaceUsingReset,
            (true, false) => StreamAction::ReplaceUsingFin,
        }
    }
}

// ---------------------------------------------------------------------------
// SendUnit
// ---------------------------------------------------------------------------

/// One immutable enqueued payload.
///
/// Cloning is cheap: the payload is a shared [`Bytes`] and is never
/// mutated after construction.
#[derive(Debug, Clone)]
pub struct SendUnit {
    // ---
    pub conn_id: ConnId,
    pub flow_id: FlowId,
    pub priority: u8,
    pub action: StreamAction,

    /// Clock reading at enqueue time.
    pub enqueued_at: Duration,

    pub data: Bytes,
}

impl SendUnit {
    // ---
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
