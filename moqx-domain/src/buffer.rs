//! Receive-side buffers shared between the network thread (producer) and
//! application threads (consumers).
//!
//! Contents are reference-counted [`Bytes`] chunks. The producer only ever
//! appends whole chunks and the consumer only ever takes them off the front,
//! so no thread edits bytes another thread may be reading.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

// ---

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// StreamBuffer
// ---------------------------------------------------------------------------

/// Ordered byte accumulator for one received stream.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    // ---
    chunks: Mutex<ChunkList>,

    /// Set once the peer finished or reset the stream.
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct ChunkList {
    // ---
    chunks: VecDeque<Bytes>,
    len: usize,
}

// ---

impl StreamBuffer {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, data: Bytes) {
        // ---
        if data.is_empty() {
            return;
        }
        let mut list = self.chunks.lock();
        list.len += data.len();
        list.chunks.push_back(data);
    }

    /// Take up to `max` bytes from the front.
    ///
    /// Returns at most one chunk's worth so the common case never copies.
    pub fn read(&self, max: usize) -> Option<Bytes> {
        // ---
        let mut guard = self.chunks.lock();
        let list = &mut *guard;
        let head = list.chunks.front_mut()?;

        let out = if head.len() <= max {
            list.chunks.pop_front()?
        } else {
            head.split_to(max)
        };
        list.len -= out.len();
        Some(out)
    }

    /// Take everything buffered, coalesced into one buffer.
    pub fn read_all(&self) -> Bytes {
        // ---
        let mut guard = self.chunks.lock();
        let list = &mut *guard;
        let total = list.len;
        list.len = 0;

        match list.chunks.len() {
            0 => Bytes::new(),
            1 => list.chunks.pop_front().unwrap_or_default(),
            _ => {
                let mut out = BytesMut::with_capacity(total);
                for chunk in list.chunks.drain(..) {
                    out.extend_from_slice(&chunk);
                }
                out.freeze()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// DatagramQueue
// ---------------------------------------------------------------------------

/// Bounded FIFO of received datagrams. When full, the oldest is evicted.
#[derive(Debug)]
pub struct DatagramQueue {
    // ---
    queue: Mutex<VecDeque<Bytes>>,
    limit: usize,
}

impl DatagramQueue {
    // ---
    pub fn new(limit: usize) -> Self {
        // ---
        Self {
            queue: Mutex::new(VecDeque::with_capacity(limit.min(1024))),
            limit: limit.max(1),
        }
    }

    /// Append a datagram. Returns `true` if an older datagram was evicted.
    pub fn push(&self, data: Bytes) -> bool {
        // ---
        let mut q = self.queue.lock();
        let evicted = if q.len() >= self.limit {
            q.pop_front();
            true
        } else {
            false
        };
        q.push_back(data);
        evicted
    }

    pub fn pop(&self) -> Option<Bytes> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
