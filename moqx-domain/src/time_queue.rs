//! Single-priority FIFO with per-entry time-to-live.
//!
//! ```text
//!   push ──► [ e0 | e1 | e2 | ... ] ──► front / pop_front
//!              │
//!              └─ expired heads are swept (and counted) on every read
//! ```
//!
//! Expiry is checked lazily on each read, never by a background sweep, so a
//! queue that is read rarely under backpressure still never hands out a
//! stale entry. An entry behind a live head may already be stale; it is
//! swept once it reaches the head.

use std::collections::VecDeque;

// ---------------------------------------------------------------------------
// QueueElement
// ---------------------------------------------------------------------------

/// Result of a read: the value (if any) plus how many stale entries the
/// read discarded on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueElement<V> {
    // ---
    pub value: Option<V>,

    /// Group key the value was pushed with. Zero when `value` is `None`.
    pub group_key: u64,

    /// Entries discarded because their TTL elapsed.
    pub expired: usize,
}

impl<V> QueueElement<V> {
    // ---
    pub fn empty(expired: usize) -> Self {
        Self {
            value: None,
            group_key: 0,
            expired,
        }
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }
}

// ---------------------------------------------------------------------------
// TimeQueue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Entry<T> {
    // ---
    group_key: u64,
    value: T,
    expiry_ms: u64,
    /// Not poppable before this tick (delayed pop).
    ready_ms: u64,
}

/// FIFO of values that expire `ttl_ms` after being pushed.
#[derive(Debug)]
pub struct TimeQueue<T> {
    // ---
    entries: VecDeque<Entry<T>>,
    max_ttl_ms: u32,
}

// ---

impl<T> TimeQueue<T> {
    // ---
    pub fn new(max_ttl_ms: u32, initial_capacity: usize) -> Self {
        // ---
        Self {
            entries: VecDeque::with_capacity(initial_capacity),
            max_ttl_ms: max_ttl_ms.max(1),
        }
    }

    // ---

    /// Effective TTL for a requested value: 0 means the queue maximum,
    /// anything larger than the maximum is clamped.
    pub fn effective_ttl(&self, ttl_ms: u32) -> u32 {
        // ---
        if ttl_ms == 0 {
            self.max_ttl_ms
        } else {
            ttl_ms.min(self.max_ttl_ms)
        }
    }

    pub fn push(&mut self, now_ms: u64, group_key: u64, value: T, ttl_ms: u32, delay_ms: u32) {
        // ---
        let ttl = self.effective_ttl(ttl_ms);
        self.entries.push_back(Entry {
            group_key,
            value,
            expiry_ms: now_ms + ttl as u64,
            ready_ms: now_ms + delay_ms as u64,
        });
    }

    // ---

    /// Drop expired entries at the head. Returns how many were dropped.
    fn sweep(&mut self, now_ms: u64) -> usize {
        // ---
        let mut expired = 0;
        while let Some(head) = self.entries.front() {
            if now_ms < head.expiry_ms {
                break;
            }
            self.entries.pop_front();
            expired += 1;
        }
        expired
    }

    /// Sweep the head and report whether a live, ready entry is available.
    ///
    /// Returns `(ready, expired_count)`.
    pub fn poll_ready(&mut self, now_ms: u64) -> (bool, usize) {
        // ---
        let expired = self.sweep(now_ms);
        let ready = self
            .entries
            .front()
            .is_some_and(|head| head.ready_ms <= now_ms);
        (ready, expired)
    }

    /// Head entry without any expiry check. Pair with [`Self::poll_ready`].
    pub fn head(&self) -> Option<(&T, u64)> {
        self.entries.front().map(|e| (&e.value, e.group_key))
    }

    // ---

    /// Oldest live entry, without removing it.
    pub fn front(&mut self, now_ms: u64) -> QueueElement<&T> {
        // ---
        let (ready, expired) = self.poll_ready(now_ms);
        if !ready {
            return QueueElement::empty(expired);
        }
        match self.head() {
            Some((value, group_key)) => QueueElement {
                value: Some(value),
                group_key,
                expired,
            },
            None => QueueElement::empty(expired),
        }
    }

    /// Remove and return the oldest live entry.
    pub fn pop_front(&mut self, now_ms: u64) -> QueueElement<T> {
        // ---
        let (ready, expired) = self.poll_ready(now_ms);
        if !ready {
            return QueueElement::empty(expired);
        }
        match self.entries.pop_front() {
            Some(e) => QueueElement {
                value: Some(e.value),
                group_key: e.group_key,
                expired,
            },
            None => QueueElement::empty(expired),
        }
    }

    /// Discard the head entry regardless of its state.
    pub fn pop(&mut self) {
        self.entries.pop_front();
    }

    /// Drop everything. Returns how many entries were dropped.
    pub fn clear(&mut self) -> usize {
        // ---
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    /// Entry count, including stale entries not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn queue() -> TimeQueue<&'static str> {
        TimeQueue::new(1_000, 16)
    }

    #[test]
    fn expired_entries_are_skipped_and_counted() {
        // ---
        let mut q = queue();
        q.push(0, 1, "a", 100, 0);
        q.push(0, 1, "b", 500, 0);

        let front = q.front(100);
        assert_eq!(front.value, Some(&"b"), "entry at exactly its TTL is expired");
        assert_eq!(front.expired, 1);

        let popped = q.pop_front(499);
        assert_eq!(popped.value, Some("b"));
        assert_eq!(popped.expired, 0, "expired count is reported once");
        assert!(q.is_empty());
    }

    #[test]
    fn stale_entry_behind_live_head_is_swept_later() {
        // ---
        let mut q = queue();
        q.push(0, 0, "long", 900, 0);
        q.push(0, 0, "short", 10, 0);

        assert_eq!(q.pop_front(50).value, Some("long"));
        let next = q.pop_front(50);
        assert_eq!(next.value, None, "short-lived entry must never be returned");
        assert_eq!(next.expired, 1);
    }

    #[test]
    fn delayed_entry_blocks_head_until_ready() {
        // ---
        let mut q = queue();
        q.push(0, 7, "later", 1_000, 200);
        q.push(0, 7, "behind", 1_000, 0);

        assert!(!q.front(199).has_value(), "delayed head must not pop early");
        let ready = q.pop_front(200);
        assert_eq!(ready.value, Some("later"));
        assert_eq!(ready.group_key, 7);
        assert_eq!(q.pop_front(200).value, Some("behind"));
    }

    #[test]
    fn zero_and_oversized_ttl_map_to_max() {
        // ---
        let q = queue();
        assert_eq!(q.effective_ttl(0), 1_000);
        assert_eq!(q.effective_ttl(5_000), 1_000);
        assert_eq!(q.effective_ttl(350), 350);
    }

    #[test]
    fn clear_reports_dropped_count() {
        // ---
        let mut q = queue();
        q.push(0, 0, "a", 0, 0);
        q.push(0, 0, "b", 0, 0);
        assert_eq!(q.clear(), 2);
        assert_eq!(q.len(), 0);
    }
}
