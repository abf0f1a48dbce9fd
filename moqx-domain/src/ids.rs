//! Identifier newtypes shared by every layer.
//!
//! Stream ids follow QUIC numbering:
//!
//! ```text
//!   bit 0  initiator   0 = client, 1 = server
//!   bit 1  direction   0 = bidirectional, 1 = unidirectional
//!   bits 2..          per-type sequence index
//! ```

use std::fmt;

use serde::Serialize;

// ---------------------------------------------------------------------------
// ConnId
// ---------------------------------------------------------------------------

/// Opaque connection handle assigned by the QUIC engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// FlowId
// ---------------------------------------------------------------------------

/// Logical flow id, unique within its connection. Zero is never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FlowId(pub u64);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Which side of the connection this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    Client,
    Server,
}

// ---------------------------------------------------------------------------
// StreamId
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StreamId(pub u64);

// ---

impl StreamId {
    // ---
    const SERVER_BIT: u64 = 0x1;
    const UNI_BIT: u64 = 0x2;

    /// Build the id of the `index`-th stream of the given type opened by `initiator`.
    pub fn new(initiator: Role, bidir: bool, index: u64) -> Self {
        // ---
        let mut raw = index << 2;
        if initiator == Role::Server {
            raw |= Self::SERVER_BIT;
        }
        if !bidir {
            raw |= Self::UNI_BIT;
        }
        Self(raw)
    }

    pub fn is_bidir(self) -> bool {
        self.0 & Self::UNI_BIT == 0
    }

    pub fn initiator(self) -> Role {
        // ---
        if self.0 & Self::SERVER_BIT == 0 {
            Role::Client
        } else {
            Role::Server
        }
    }

    /// `true` if the stream was opened by the endpoint playing `local`.
    pub fn is_local(self, local: Role) -> bool {
        self.initiator() == local
    }

    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
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
    fn stream_id_bits_follow_quic_numbering() {
        // ---
        assert_eq!(StreamId::new(Role::Client, true, 0).0, 0);
        assert_eq!(StreamId::new(Role::Server, true, 0).0, 1);
        assert_eq!(StreamId::new(Role::Client, false, 0).0, 2);
        assert_eq!(StreamId::new(Role::Server, false, 0).0, 3);
        assert_eq!(StreamId::new(Role::Client, false, 3).0, 14);

        let id = StreamId::new(Role::Server, false, 7);
        assert!(!id.is_bidir(), "uni bit must be set");
        assert_eq!(id.initiator(), Role::Server);
        assert_eq!(id.index(), 7);
        assert!(id.is_local(Role::Server));
        assert!(!id.is_local(Role::Client));
    }
}
