//! Datagram fragmentation for payloads larger than one datagram.
//!
//! # Wire format
//!
//! ```text
//!   0               8               16
//!   ┌───────────────┬───────────────┬──────────────────┐
//!   │ msg_id (u64)  │ offset<<1|last│ payload ...      │
//!   └───────────────┴───────────────┴──────────────────┘
//!          big-endian      big-endian
//! ```
//!
//! `offset` is the byte offset of the payload within the message; `last`
//! marks the final fragment.
//!
//! Reassembly keeps partial messages in a fixed ring of buckets. New
//! messages go into the current bucket; when it fills, the ring advances
//! and the next bucket is cleared, evicting whatever was abandoned there.
//! Memory is bounded without per-message timers.

use std::collections::{BTreeMap, HashMap};

// ---

use bytes::{Buf, BufMut, Bytes, BytesMut};

// ---

pub const HEADER_LEN: usize = 16;

/// Default total size (header included) of one fragment datagram.
pub const DEFAULT_MAX_FRAGMENT: usize = 1200;

const RING_BUCKETS: usize = 20;
const MAX_MSGS_PER_BUCKET: usize = 5000;

// ---------------------------------------------------------------------------
// Fragment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    // ---
    pub msg_id: u64,
    pub offset: u64,
    pub last: bool,
    pub payload: Bytes,
}

impl Fragment {
    // ---
    /// Parse a received datagram. Returns `None` if it is shorter than the header.
    pub fn parse(mut datagram: Bytes) -> Option<Self> {
        // ---
        if datagram.len() < HEADER_LEN {
            return None;
        }
        let msg_id = datagram.get_u64();
        let offset_and_fin = datagram.get_u64();

        Some(Self {
            msg_id,
            offset: offset_and_fin >> 1,
            last: offset_and_fin & 1 == 1,
            payload: datagram,
        })
    }
}

/// Split `data` into datagrams of at most `max_fragment` bytes each.
pub fn split(msg_id: u64, data: &Bytes, max_fragment: usize) -> Vec<Bytes> {
    // ---
    let chunk = max_fragment.saturating_sub(HEADER_LEN).max(1);
    let mut out = Vec::with_capacity(data.len() / chunk + 1);
    let mut offset = 0;

    loop {
        let end = (offset + chunk).min(data.len());
        let last = end == data.len();

        let mut buf = BytesMut::with_capacity(HEADER_LEN + end - offset);
        buf.put_u64(msg_id);
        buf.put_u64(((offset as u64) << 1) | u64::from(last));
        buf.put_slice(&data[offset..end]);
        out.push(buf.freeze());

        if last {
            return out;
        }
        offset = end;
    }
}

// ---------------------------------------------------------------------------
// ReassemblyRing
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Partial {
    // ---
    /// offset -> payload
    pieces: BTreeMap<u64, Bytes>,
    /// End offset, known once the last fragment arrived.
    total: Option<u64>,
}

impl Partial {
    // ---
    /// Contiguous from zero up to `total`.
    fn is_complete(&self) -> bool {
        // ---
        let Some(total) = self.total else {
            return false;
        };
        let mut expect = 0;
        for (&offset, piece) in &self.pieces {
            if offset != expect {
                return false;
            }
            expect += piece.len() as u64;
        }
        expect == total
    }

    fn assemble(self) -> Bytes {
        // ---
        if self.pieces.len() == 1 {
            return self.pieces.into_values().next().unwrap_or_default();
        }
        let mut out = BytesMut::new();
        for piece in self.pieces.into_values() {
            out.extend_from_slice(&piece);
        }
        out.freeze()
    }
}

/// Bounded reassembly state for one connection.
#[derive(Debug)]
pub struct ReassemblyRing {
    // ---
    buckets: Vec<HashMap<u64, Partial>>,
    current: usize,
    per_bucket: usize,
}

impl Default for ReassemblyRing {
    fn default() -> Self {
        Self::new(RING_BUCKETS, MAX_MSGS_PER_BUCKET)
    }
}

impl ReassemblyRing {
    // ---
    pub fn new(buckets: usize, per_bucket: usize) -> Self {
        // ---
        Self {
            buckets: (0..buckets.max(1)).map(|_| HashMap::new()).collect(),
            current: 0,
            per_bucket: per_bucket.max(1),
        }
    }

    /// Add one fragment. Returns the whole message once every fragment of
    /// it has arrived.
    pub fn insert(&mut self, frag: Fragment) -> Option<Bytes> {
        // ---
        if frag.offset == 0 && frag.last {
            return Some(frag.payload);
        }

        let idx = match self.buckets.iter().position(|b| b.contains_key(&frag.msg_id)) {
            Some(idx) => idx,
            None => {
                if self.buckets[self.current].len() >= self.per_bucket {
                    self.rotate();
                }
                self.current
            }
        };

        let bucket = &mut self.buckets[idx];
        let partial = bucket.entry(frag.msg_id).or_default();
        if frag.last {
            partial.total = Some(frag.offset + frag.payload.len() as u64);
        }
        partial.pieces.insert(frag.offset, frag.payload);

        if !partial.is_complete() {
            return None;
        }
        bucket.remove(&frag.msg_id).map(Partial::assemble)
    }

    fn rotate(&mut self) {
        // ---
        self.current = (self.current + 1) % self.buckets.len();
        let evicted = self.buckets[self.current].len();
        if evicted > 0 {
            tracing::debug!(evicted, bucket = self.current, "reassembly ring evicted partial messages");
        }
        self.buckets[self.current].clear();
    }

    /// Partial messages currently held.
    pub fn pending(&self) -> usize {
        self.buckets.iter().map(HashMap::len).sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
