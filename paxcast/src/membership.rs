//! Static group membership.
//!
//! A [`Membership`] is the sorted roster of participants plus the local
//! member's position in it. It never changes once built: majority arithmetic
//! and deterministic leader selection all derive from it.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::types::PaxcastError;

/// Identity of a group participant.
///
/// Members are ordered by address. The highest member of a set is its
/// deterministic leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Member(pub SocketAddr);

impl Member {
    /// Create a member from its socket address.
    pub const fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// The member's socket address.
    pub const fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Member {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable, sorted roster of members plus the local member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    members: Vec<Member>,
    me: Member,
    position: usize,
}

impl Membership {
    /// Build a membership from an arbitrary list of members.
    ///
    /// The list is sorted and de-duplicated. Fails if it is empty or does
    /// not contain `me`.
    pub fn new(members: impl IntoIterator<Item = Member>, me: Member) -> Result<Self, PaxcastError> {
        let members: Vec<Member> = members
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if members.is_empty() {
            return Err(PaxcastError::EmptyMembership);
        }

        let position = members
            .binary_search(&me)
            .map_err(|_| PaxcastError::NotAMember { member: me })?;

        Ok(Self {
            members,
            me,
            position,
        })
    }

    /// All members in ascending order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// The local member.
    pub fn me(&self) -> Member {
        self.me
    }

    /// Index of the local member in the sorted roster.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Smallest number of responses that forms a majority.
    pub fn majority(&self) -> usize {
        self.size() / 2 + 1
    }

    /// Whether `count` responses form a majority (`count > size / 2`).
    pub fn is_majority(&self, count: usize) -> bool {
        count > self.size() / 2
    }

    /// Whether `member` belongs to the group.
    pub fn contains(&self, member: &Member) -> bool {
        self.members.binary_search(member).is_ok()
    }

    /// The highest-ranked member of the whole group.
    pub fn default_leader(&self) -> Member {
        // Construction guarantees at least one member.
        self.members[self.members.len() - 1]
    }

    /// The highest-ranked member of `alive`, restricted to the group.
    pub fn select_leader<'a>(&self, alive: impl IntoIterator<Item = &'a Member>) -> Option<Member> {
        alive.into_iter().filter(|m| self.contains(m)).max().copied()
    }

    /// Whether the local member is the default leader.
    pub fn is_default_leader(&self) -> bool {
        self.default_leader() == self.me
    }
}
