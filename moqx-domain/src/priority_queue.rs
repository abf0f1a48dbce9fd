//! Priority-bucketed time queue.
//!
//! One [`TimeQueue`] per priority level. Reads always scan from the most
//! urgent (lowest numeric) level, so every unit at priority `p` is served
//! before any unit at `p + 1`; within a level order is strict FIFO.

use std::collections::BTreeMap;

// ---

use super::clock::ClockPtr;
use super::error::{Result, TransportError};
use super::priority::Priority;
use super::time_queue::{QueueElement, TimeQueue};

// ---------------------------------------------------------------------------
// PriorityQueue
// ---------------------------------------------------------------------------

pub struct PriorityQueue<T> {
    // ---
    levels: BTreeMap<u8, TimeQueue<T>>,
    clock: ClockPtr,
    max_ttl_ms: u32,
    initial_capacity: usize,
}

// ---

impl<T> PriorityQueue<T> {
    // ---
    pub fn new(max_ttl_ms: u32, initial_capacity: usize, clock: ClockPtr) -> Self {
        // ---
        Self {
            levels: BTreeMap::new(),
            clock,
            max_ttl_ms,
            initial_capacity,
        }
    }

    // ---

    /// Push `value` at `priority`. `ttl_ms == 0` means the queue maximum;
    /// `delay_ms` holds the value back from reads for that long.
    pub fn push(
        &mut self,
        group_key: u64,
        value: T,
        ttl_ms: u32,
        priority: u8,
        delay_ms: u32,
    ) -> Result<()> {
        // ---
        if priority > Priority::MAX {
            return Err(TransportError::InvalidPriority(priority));
        }

        let now = self.clock.now_ms();
        let (max_ttl_ms, initial_capacity) = (self.max_ttl_ms, self.initial_capacity);

        self.levels
            .entry(priority)
            .or_insert_with(|| TimeQueue::new(max_ttl_ms, initial_capacity))
            .push(now, group_key, value, ttl_ms, delay_ms);

        Ok(())
    }

    // ---

    /// Find the most urgent level with a ready head, sweeping stale heads
    /// on every level visited.
    fn ready_level(&mut self) -> (Option<u8>, usize) {
        // ---
        let now = self.clock.now_ms();
        let mut expired = 0;

        for (level, queue) in self.levels.iter_mut() {
            if queue.is_empty() {
                continue;
            }
            let (ready, swept) = queue.poll_ready(now);
            expired += swept;
            if ready {
                return (Some(*level), expired);
            }
        }

        (None, expired)
    }

    /// Highest-priority, oldest live value, without removing it.
    pub fn front(&mut self) -> QueueElement<&T> {
        // ---
        let (level, expired) = self.ready_level();
        let head = level
            .and_then(|l| self.levels.get(&l))
            .and_then(|q| q.head());

        match head {
            Some((value, group_key)) => QueueElement {
                value: Some(value),
                group_key,
                expired,
            },
            None => QueueElement::empty(expired),
        }
    }

    /// Remove and return the highest-priority, oldest live value.
    pub fn pop_front(&mut self) -> QueueElement<T> {
        // ---
        let (level, expired) = self.ready_level();
        let Some(level) = level else {
            return QueueElement::empty(expired);
        };

        let now = self.clock.now_ms();
        match self.levels.get_mut(&level) {
            Some(queue) => {
                let mut elem = queue.pop_front(now);
                elem.expired += expired;
                elem
            }
            None => QueueElement::empty(expired),
        }
    }

    /// Discard the value [`Self::front`] would return. Returns the number of
    /// stale entries swept on the way.
    pub fn pop(&mut self) -> usize {
        self.pop_front().expired
    }

    /// Drop every queued value. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        self.levels.values_mut().map(TimeQueue::clear).sum()
    }

    /// Queued value count. Includes stale entries not yet swept, so it is
    /// an upper bound suitable for congestion heuristics.
    pub fn size(&self) -> usize {
        self.levels.values().map(TimeQueue::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.values().all(TimeQueue::is_empty)
    }
}

impl<T> std::fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("size", &self.size())
            .field("levels", &self.levels.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
