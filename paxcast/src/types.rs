//! Core types for the paxcast consensus engine.
//!
//! This module defines the identifiers and records shared by every role:
//!
//! - [`ViewNumber`]: Monotonically increasing leadership epoch
//! - [`SeqNo`]: Position of a value in the total order
//! - [`MsgId`]: Client-assigned id correlating a broadcast with its outcome
//! - [`Value`]: An application payload or the explicit no-op gap filler
//! - [`Acceptance`]: What an acceptor accepted for a sequence number
//! - [`Proposal`]: The leader's record of the value it drives for a sequence number
//! - [`PaxcastError`]: Error type for configuration and I/O failures

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::fragment::FragmentError;
use crate::membership::Member;
use crate::transport::TransportError;

/// View number: identifies an epoch of leadership.
///
/// A view number encodes both a round and the proposer's position in the
/// membership: `view = round * group_size + position`. Two members computing
/// a new view at the same time therefore never pick the same number, and a
/// higher view always wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ViewNumber(pub u64);

impl ViewNumber {
    /// The initial view (no election has happened yet).
    pub const ZERO: Self = Self(0);

    /// Create a new view number.
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Compute the next view this member may propose.
    ///
    /// The result is strictly greater than `self` and congruent to
    /// `position` modulo `group_size`.
    pub fn next_for(self, position: usize, group_size: usize) -> Self {
        let size = group_size.max(1) as u64;
        let round = self.0 / size;
        Self((round + 1) * size + position as u64)
    }
}

impl std::fmt::Display for ViewNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "view({})", self.0)
    }
}

/// Sequence number: a position in the group's total order.
///
/// The first sequence number handed out by a leader is [`SeqNo::FIRST`].
/// Gaps are never skipped, they are filled with [`Value::NoOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeqNo(pub u64);

impl SeqNo {
    /// The first valid sequence number.
    pub const FIRST: Self = Self(1);

    /// Create a new sequence number.
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Get the next sequence number.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for SeqNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "seq({})", self.0)
    }
}

/// Message id: correlates a client broadcast with its completion.
///
/// Client ids are `position * MAX_CIRCULATING + counter`, so ids from
/// different members never collide. No-op gap fillers use a reserved range
/// (top bit set) derived from their sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MsgId(pub u64);

impl MsgId {
    /// Number of distinct client ids per member before the counter wraps.
    pub const MAX_CIRCULATING: u64 = 1_000_000;

    const NO_OP_BIT: u64 = 1 << 63;

    /// Build a client message id from the sender's position and a counter.
    pub const fn client(position: usize, counter: u64) -> Self {
        Self(position as u64 * Self::MAX_CIRCULATING + counter % Self::MAX_CIRCULATING)
    }

    /// The reserved id of the no-op filling `seq_no`.
    pub const fn for_no_op(seq_no: SeqNo) -> Self {
        Self(Self::NO_OP_BIT | seq_no.0)
    }

    /// Whether this id belongs to a no-op gap filler.
    pub const fn is_no_op(self) -> bool {
        self.0 & Self::NO_OP_BIT != 0
    }

    /// Position of the member that allocated this client id.
    ///
    /// Returns `None` for no-op ids.
    pub fn origin(self) -> Option<usize> {
        if self.is_no_op() {
            None
        } else {
            Some((self.0 / Self::MAX_CIRCULATING) as usize)
        }
    }
}

impl std::fmt::Display for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_no_op() {
            write!(f, "noop-msg({})", self.0 & !Self::NO_OP_BIT)
        } else {
            write!(f, "msg({})", self.0)
        }
    }
}

/// A value ordered by the group.
///
/// Application payloads are opaque bytes. [`Value::NoOp`] fills sequence
/// numbers left empty by a superseded leader and is never delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// Placeholder filling a sequence-number gap.
    NoOp,
    /// Application payload.
    App(Vec<u8>),
}

impl Value {
    /// Whether this is the no-op filler.
    pub fn is_no_op(&self) -> bool {
        matches!(self, Value::NoOp)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::App(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::App(bytes.to_vec())
    }
}

/// What an acceptor accepted for one sequence number.
///
/// Reported to a newly elected leader inside `ViewAccepted` so it can recover
/// proposals left in flight by its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acceptance {
    /// View of the leader that proposed the value.
    pub view: ViewNumber,
    /// The accepted value.
    pub value: Value,
    /// Message id the value was proposed under.
    pub msg_id: MsgId,
}

/// The leader's record of the value being driven for one sequence number.
///
/// Keeps the outcome reported from the highest view seen so far
/// (last-writer-by-view-wins). A new leader re-proposes that outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    newest_view: ViewNumber,
    newest_outcome: Value,
    newest_msg_id: MsgId,
}

impl Proposal {
    /// Create a proposal for `value` first seen in `view`.
    pub fn new(view: ViewNumber, value: Value, msg_id: MsgId) -> Self {
        Self {
            newest_view: view,
            newest_outcome: value,
            newest_msg_id: msg_id,
        }
    }

    /// Merge an outcome reported for `view`.
    ///
    /// Only replaces the current outcome when `view` is strictly newer.
    /// Returns whether the outcome changed.
    pub fn accept_outcome(&mut self, view: ViewNumber, outcome: Value, msg_id: MsgId) -> bool {
        if view > self.newest_view {
            self.newest_view = view;
            self.newest_outcome = outcome;
            self.newest_msg_id = msg_id;
            true
        } else {
            false
        }
    }

    /// View of the newest outcome.
    pub fn view(&self) -> ViewNumber {
        self.newest_view
    }

    /// The newest outcome.
    pub fn outcome(&self) -> &Value {
        &self.newest_outcome
    }

    /// Message id of the newest outcome.
    pub fn msg_id(&self) -> MsgId {
        self.newest_msg_id
    }
}

/// Errors surfaced by paxcast.
///
/// Protocol-level conditions (stale views, lost or duplicated messages) are
/// not errors: they are absorbed by aborts, resends and de-duplication.
#[derive(Debug, thiserror::Error)]
pub enum PaxcastError {
    /// The local member is not part of the configured membership.
    #[error("member {member} is not part of the membership")]
    NotAMember {
        /// The member that could not be found.
        member: Member,
    },

    /// The membership has no members.
    #[error("membership is empty")]
    EmptyMembership,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Encoding or decoding a protocol message failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A fragment frame was malformed.
    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),

    /// The group event loop is no longer running.
    #[error("group has shut down")]
    Shutdown,
}
