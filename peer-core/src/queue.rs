//! Per-destination queue of undelivered deltas.
//!
//! Entries flow through the queue in this order:
//! 1. `push()` - add, keeping per-origin sequence order
//! 2. `next_unsent()` / `drain_unsent()` - hand to the session, marked in-flight
//! 3. `ack()` - trim everything the destination acknowledged
//!
//! If the session drops, `requeue_in_flight()` makes in-flight entries
//! sendable again. The queue is bounded; when full, the oldest
//! unacknowledged entry is evicted to make room.

use peer_types::{Delta, PeerId, Sequence};
use std::collections::{HashMap, VecDeque};

/// Default bound on queued deltas per destination.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// A delta waiting for acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedDelta {
    /// The delta.
    pub delta: Delta,
    /// How many times a send was interrupted.
    pub retries: u32,
    /// Sent on the current session, not yet acknowledged.
    pub in_flight: bool,
}

/// Result of [`SyncQueue::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued. `evicted` is set when the queue was full.
    Queued {
        /// The oldest entry, dropped to make room.
        evicted: Option<Delta>,
    },
    /// Same (origin, sequence) already queued.
    Duplicate,
    /// The destination already acknowledged this sequence.
    AlreadyAcked,
}

/// Ordered queue of deltas for one destination peer.
#[derive(Debug)]
pub struct SyncQueue {
    capacity: usize,
    entries: VecDeque<QueuedDelta>,
    acked: HashMap<PeerId, Sequence>,
}

impl SyncQueue {
    /// Create a queue holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            acked: HashMap::new(),
        }
    }

    /// Add a delta.
    ///
    /// The delta is placed before any queued delta of the same origin with a
    /// higher sequence, so each origin stays strictly ordered.
    pub fn push(&mut self, delta: Delta) -> PushOutcome {
        if self
            .acked
            .get(&delta.origin)
            .is_some_and(|acked| delta.sequence <= *acked)
        {
            return PushOutcome::AlreadyAcked;
        }
        if self.entries.iter().any(|e| e.delta.key() == delta.key()) {
            return PushOutcome::Duplicate;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front().map(|e| e.delta)
        } else {
            None
        };

        let position = self
            .entries
            .iter()
            .position(|e| e.delta.origin == delta.origin && e.delta.sequence > delta.sequence)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            position,
            QueuedDelta {
                delta,
                retries: 0,
                in_flight: false,
            },
        );

        PushOutcome::Queued { evicted }
    }

    /// Mark every not-yet-sent entry in-flight and return them in send order.
    pub fn drain_unsent(&mut self) -> Vec<Delta> {
        self.entries
            .iter_mut()
            .filter(|e| !e.in_flight)
            .map(|e| {
                e.in_flight = true;
                e.delta.clone()
            })
            .collect()
    }

    /// Mark the first not-yet-sent entry in-flight and return it.
    pub fn next_unsent(&mut self) -> Option<Delta> {
        let entry = self.entries.iter_mut().find(|e| !e.in_flight)?;
        entry.in_flight = true;
        Some(entry.delta.clone())
    }

    /// True if some entry has not been handed to the current session.
    pub fn has_unsent(&self) -> bool {
        self.entries.iter().any(|e| !e.in_flight)
    }

    /// Cumulative acknowledgement: drop every entry of `origin` up to `sequence`.
    ///
    /// Returns the number of entries trimmed.
    pub fn ack(&mut self, origin: &PeerId, sequence: Sequence) -> usize {
        let cursor = self.acked.entry(*origin).or_insert(sequence);
        if sequence > *cursor {
            *cursor = sequence;
        }
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.delta.origin == *origin && e.delta.sequence <= sequence));
        before - self.entries.len()
    }

    /// Make in-flight entries sendable again after a lost session.
    ///
    /// Returns the number of entries re-queued.
    pub fn requeue_in_flight(&mut self) -> usize {
        let mut count = 0;
        for entry in self.entries.iter_mut().filter(|e| e.in_flight) {
            entry.in_flight = false;
            entry.retries = entry.retries.saturating_add(1);
            count += 1;
        }
        count
    }

    /// Last sequence of `origin` acknowledged by the destination.
    pub fn acked_cursor(&self, origin: &PeerId) -> Option<Sequence> {
        self.acked.get(origin).copied()
    }

    /// Iterate queued entries in send order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedDelta> {
        self.entries.iter()
    }

    /// Number of unacknowledged entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sent but not yet acknowledged.
    pub fn in_flight_count(&self) -> usize {
        self.entries.iter().filter(|e| e.in_flight).count()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
