//! Tracking of Success messages an acceptor has not seen yet.
//!
//! The set keeps a tail (lowest sequence number not yet confirmed) plus the
//! confirmations that arrived out of order above it. An acceptor attaches
//! [`MissingSet::missing_below`] to every Accepted reply so the leader can
//! resend exactly the outcomes it missed.

use std::collections::BTreeSet;

use crate::types::SeqNo;

/// Confirmed/missing bookkeeping for Success messages.
#[derive(Debug, Clone)]
pub struct MissingSet {
    tail: SeqNo,
    above_tail: BTreeSet<SeqNo>,
}

impl Default for MissingSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MissingSet {
    /// An empty set expecting [`SeqNo::FIRST`].
    pub fn new() -> Self {
        Self {
            tail: SeqNo::FIRST,
            above_tail: BTreeSet::new(),
        }
    }

    /// Mark `seq_no` as confirmed. Values below the tail are ignored.
    pub fn received(&mut self, seq_no: SeqNo) {
        if seq_no < self.tail {
            return;
        }
        self.above_tail.insert(seq_no);
        while self.above_tail.remove(&self.tail) {
            self.tail = self.tail.next();
        }
    }

    /// Sequence numbers in `[tail, upper)` not yet confirmed.
    pub fn missing_below(&self, upper: SeqNo) -> BTreeSet<SeqNo> {
        (self.tail.0..upper.0)
            .map(SeqNo)
            .filter(|s| !self.above_tail.contains(s))
            .collect()
    }

    /// Whether `seq_no` has been confirmed.
    pub fn contains(&self, seq_no: SeqNo) -> bool {
        seq_no < self.tail || self.above_tail.contains(&seq_no)
    }

    /// Lowest sequence number not yet confirmed.
    pub fn tail(&self) -> SeqNo {
        self.tail
    }
}
