//! Inbound delivery ledger.
//!
//! Tracks, per origin, the highest applied sequence and a window of recently
//! applied content hashes. Admission is split from commit so that a delta is
//! only recorded once the store accepted it:
//!
//! ```text
//! admit() -> Apply     -> put_content() -> commit() -> ack
//!         -> Duplicate -> ack again, state untouched
//!         -> Stale     -> drop
//! ```
//!
//! Sequences skipped over (the sender evicted them on overflow) are remembered
//! as gaps; a late arrival for a gap is stale, since applying it would break
//! per-origin ordering.

use peer_types::{ContentHash, PeerId, Sequence};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Recently applied hashes remembered per origin.
const RECENT_WINDOW: usize = 4096;

/// Decision for one inbound delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New and in order: apply it.
    Apply,
    /// Already applied; re-delivery is a no-op.
    Duplicate,
    /// Older than what was applied and never seen, or conflicting content.
    Stale,
}

#[derive(Debug, Default, Clone)]
struct OriginLedger {
    applied: Sequence,
    recent: BTreeMap<Sequence, ContentHash>,
    gaps: BTreeSet<u64>,
}

/// Per-origin record of applied deltas.
#[derive(Debug, Default, Clone)]
pub struct InboundLedger {
    origins: HashMap<PeerId, OriginLedger>,
}

impl InboundLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide what to do with an inbound delta. Does not modify the ledger.
    pub fn admit(&self, origin: &PeerId, sequence: Sequence, hash: &ContentHash) -> Admission {
        let Some(ledger) = self.origins.get(origin) else {
            return Admission::Apply;
        };
        if sequence > ledger.applied {
            return Admission::Apply;
        }
        match ledger.recent.get(&sequence) {
            Some(seen) if seen == hash => Admission::Duplicate,
            Some(_) => Admission::Stale,
            None if ledger.gaps.contains(&sequence.value()) => Admission::Stale,
            // Fell out of the window; it was applied long ago.
            None => Admission::Duplicate,
        }
    }

    /// Record a delta as applied. Call only after [`Admission::Apply`].
    pub fn commit(&mut self, origin: PeerId, sequence: Sequence, hash: ContentHash) {
        let ledger = self.origins.entry(origin).or_default();
        if sequence <= ledger.applied {
            return;
        }

        let first_missing = ledger.applied.value() + 1;
        let skipped = sequence.value() - first_missing;
        let from = first_missing.max(sequence.value().saturating_sub(RECENT_WINDOW as u64));
        ledger.gaps.extend(from..sequence.value());
        if skipped > 0 {
            ledger.gaps.retain(|g| *g + RECENT_WINDOW as u64 >= sequence.value());
        }

        ledger.applied = sequence;
        ledger.recent.insert(sequence, hash);
        while ledger.recent.len() > RECENT_WINDOW {
            ledger.recent.pop_first();
        }
    }

    /// Highest applied sequence for `origin`, i.e. what to acknowledge.
    pub fn ack_cursor(&self, origin: &PeerId) -> Option<Sequence> {
        self.origins
            .get(origin)
            .map(|l| l.applied)
            .filter(|s| *s > Sequence::zero())
    }

    /// Number of sequences of `origin` that were skipped over.
    pub fn gap_count(&self, origin: &PeerId) -> usize {
        self.origins.get(origin).map(|l| l.gaps.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::new([n; 32])
    }

    fn hash(origin: &PeerId, seq: u64) -> ContentHash {
        ContentHash::compute(origin, Sequence::new(seq), format!("post {seq}").as_bytes())
    }

    fn apply(ledger: &mut InboundLedger, origin: PeerId, seq: u64) -> Admission {
        let h = hash(&origin, seq);
        let admission = ledger.admit(&origin, Sequence::new(seq), &h);
        if admission == Admission::Apply {
            ledger.commit(origin, Sequence::new(seq), h);
        }
        admission
    }

    #[test]
    fn in_order_deltas_apply_and_advance_cursor() {
        let mut ledger = InboundLedger::new();
        let a = peer(1);
        assert_eq!(ledger.ack_cursor(&a), None);

        for seq in 1..=3 {
            assert_eq!(apply(&mut ledger, a, seq), Admission::Apply);
        }
        assert_eq!(ledger.ack_cursor(&a), Some(Sequence::new(3)));
    }

    #[test]
    fn redelivery_is_duplicate() {
        let mut ledger = InboundLedger::new();
        let a = peer(1);
        apply(&mut ledger, a, 1);
        apply(&mut ledger, a, 2);

        assert_eq!(apply(&mut ledger, a, 1), Admission::Duplicate);
        assert_eq!(apply(&mut ledger, a, 2), Admission::Duplicate);
        assert_eq!(ledger.ack_cursor(&a), Some(Sequence::new(2)));
    }

    #[test]
    fn admit_without_commit_changes_nothing() {
        let ledger = InboundLedger::new();
        let a = peer(1);
        let h = hash(&a, 1);
        assert_eq!(ledger.admit(&a, Sequence::new(1), &h), Admission::Apply);
        assert_eq!(ledger.admit(&a, Sequence::new(1), &h), Admission::Apply);
        assert_eq!(ledger.ack_cursor(&a), None);
    }

    #[test]
    fn late_gap_fill_is_stale() {
        let mut ledger = InboundLedger::new();
        let a = peer(1);
        apply(&mut ledger, a, 1);
        apply(&mut ledger, a, 4);

        assert_eq!(ledger.gap_count(&a), 2);
        assert_eq!(apply(&mut ledger, a, 2), Admission::Stale);
        assert_eq!(ledger.ack_cursor(&a), Some(Sequence::new(4)));
    }

    #[test]
    fn conflicting_hash_is_stale() {
        let mut ledger = InboundLedger::new();
        let a = peer(1);
        apply(&mut ledger, a, 1);

        let forged = ContentHash::compute(&a, Sequence::new(1), b"something else");
        assert_eq!(ledger.admit(&a, Sequence::new(1), &forged), Admission::Stale);
    }

    #[test]
    fn origins_are_independent() {
        let mut ledger = InboundLedger::new();
        apply(&mut ledger, peer(1), 5);
        assert_eq!(apply(&mut ledger, peer(2), 1), Admission::Apply);
        assert_eq!(ledger.ack_cursor(&peer(1)), Some(Sequence::new(5)));
        assert_eq!(ledger.ack_cursor(&peer(2)), Some(Sequence::new(1)));
    }
}
