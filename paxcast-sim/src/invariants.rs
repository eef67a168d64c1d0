//! Safety checks over per-member delivery logs.
//!
//! ## Properties
//!
//! 1. **Agreement**: for each sequence number, every member that delivered
//!    something delivered the same payload.
//! 2. **Total order**: each log is strictly increasing in sequence number,
//!    and of any two logs one is a prefix of the other. No-ops never reach
//!    the application, so logs may skip numbers, but they skip the same ones.
//! 3. **Exactly once**: no member delivers the same payload twice. Workloads
//!    use distinct payloads so a duplicate means a value was ordered twice.
//!
//! Checks return the first violation found. They run on logs of crashed
//! members too: a member that died still delivered a valid prefix.

use std::collections::{BTreeMap, HashSet};

use paxcast::{Member, SeqNo};

/// What one member handed to its application, in order.
pub type DeliveryLog = Vec<(SeqNo, Vec<u8>)>;

/// A broken safety property.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    /// Two members delivered different payloads at one sequence number.
    #[error("{first} and {second} disagree at {seq_no}")]
    Disagreement {
        /// The contested sequence number.
        seq_no: SeqNo,
        /// First member seen delivering there.
        first: Member,
        /// Member delivering something else.
        second: Member,
    },

    /// A member delivered sequence numbers out of order.
    #[error("{member} delivered {seq_no} after {previous}")]
    OutOfOrder {
        /// The offending member.
        member: Member,
        /// Last sequence number delivered before.
        previous: SeqNo,
        /// Sequence number delivered next.
        seq_no: SeqNo,
    },

    /// Two logs diverge: neither is a prefix of the other.
    #[error("{first} and {second} diverge at delivery #{position}")]
    Diverged {
        /// One member.
        first: Member,
        /// The other member.
        second: Member,
        /// Index of the first differing delivery.
        position: usize,
    },

    /// A member delivered the same payload twice.
    #[error("{member} delivered a payload twice, again at {seq_no}")]
    Duplicate {
        /// The offending member.
        member: Member,
        /// Sequence number of the second delivery.
        seq_no: SeqNo,
    },

    /// A completed broadcast never reached a live member.
    #[error("{member} never delivered a completed broadcast")]
    Missing {
        /// The member lacking the payload.
        member: Member,
    },
}

/// Agreement per sequence number.
pub fn check_agreement(logs: &[(Member, DeliveryLog)]) -> Result<(), InvariantViolation> {
    let mut chosen: BTreeMap<SeqNo, (Member, &[u8])> = BTreeMap::new();
    for (member, log) in logs {
        for (seq_no, payload) in log {
            match chosen.get(seq_no) {
                Some((first, existing)) if *existing != payload.as_slice() => {
                    return Err(InvariantViolation::Disagreement {
                        seq_no: *seq_no,
                        first: *first,
                        second: *member,
                    });
                }
                Some(_) => {}
                None => {
                    chosen.insert(*seq_no, (*member, payload.as_slice()));
                }
            }
        }
    }
    Ok(())
}

/// Strictly increasing logs, pairwise prefix-consistent.
pub fn check_total_order(logs: &[(Member, DeliveryLog)]) -> Result<(), InvariantViolation> {
    for (member, log) in logs {
        for pair in log.windows(2) {
            if pair[1].0 <= pair[0].0 {
                return Err(InvariantViolation::OutOfOrder {
                    member: *member,
                    previous: pair[0].0,
                    seq_no: pair[1].0,
                });
            }
        }
    }

    for (i, (first, a)) in logs.iter().enumerate() {
        for (second, b) in &logs[i + 1..] {
            if let Some(position) = a.iter().zip(b.iter()).position(|(x, y)| x != y) {
                return Err(InvariantViolation::Diverged {
                    first: *first,
                    second: *second,
                    position,
                });
            }
        }
    }
    Ok(())
}

/// No payload delivered twice by one member.
pub fn check_exactly_once(logs: &[(Member, DeliveryLog)]) -> Result<(), InvariantViolation> {
    for (member, log) in logs {
        let mut seen = HashSet::new();
        for (seq_no, payload) in log {
            if !seen.insert(payload.as_slice()) {
                return Err(InvariantViolation::Duplicate {
                    member: *member,
                    seq_no: *seq_no,
                });
            }
        }
    }
    Ok(())
}

/// Every payload in `expected` was delivered by every member in `logs`.
pub fn check_all_delivered(
    logs: &[(Member, DeliveryLog)],
    expected: &[Vec<u8>],
) -> Result<(), InvariantViolation> {
    for (member, log) in logs {
        let delivered: HashSet<&[u8]> = log.iter().map(|(_, p)| p.as_slice()).collect();
        if expected.iter().any(|p| !delivered.contains(p.as_slice())) {
            return Err(InvariantViolation::Missing { member: *member });
        }
    }
    Ok(())
}
