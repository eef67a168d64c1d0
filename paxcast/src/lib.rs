//! # Paxcast
//!
//! Total-order reliable broadcast for a fixed group, built on Paxos.
//!
//! Every member hands values to the group; every live member delivers the
//! same values in the same order, each exactly once. A leader assigns
//! sequence numbers and drives one Paxos instance per number. When the
//! leader fails, the next one takes over with a higher view, learns what the
//! old leader left half-decided and finishes it before serving new requests.
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  group        tokio event loop, broadcast/shutdown handle   │
//! │  udp          fire-and-forget datagram transport            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  node         sans-IO composition, event dispatch           │
//! ├──────────────┬──────────────────┬───────────────────────────┤
//! │  leader      │  acceptor        │  detector                 │
//! │  elections,  │  votes, ordered  │  heartbeats, failure      │
//! │  proposals   │  delivery        │  and recovery             │
//! ├──────────────┴──────────────────┴───────────────────────────┤
//! │  quorum · missing · delivery · waiting · fragment           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  types · membership · message · codec · transport · config  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Protocol state never reads a clock or owns a socket. Every handler takes
//! the current time, and every send goes through a [`Transport`]. The same
//! [`Node`] runs under [`Group`] in production and under a virtual clock in
//! the simulation crate.
//!
//! ## Guarantees
//!
//! - **Agreement**: two members that deliver a value at a sequence number
//!   deliver the same value.
//! - **Total order**: delivery is in strictly increasing sequence number
//!   order, with no gaps.
//! - **Exactly once**: a broadcast the leader has seen is proposed once,
//!   however many times the client resends it.
//!
//! Nothing is persisted. A member that crashes leaves the group for good.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Foundations
// =============================================================================

/// Protocol value types and the crate error.
pub mod types;

/// Fixed group membership and leader selection.
pub mod membership;

/// Serialization of protocol messages.
pub mod codec;

/// The protocol message catalogue.
pub mod message;

/// Datagram transport abstraction.
pub mod transport;

/// Group configuration.
pub mod config;

/// Time sources.
pub mod time;

// =============================================================================
// Protocol building blocks
// =============================================================================

/// Quorum rounds with resend of unanswered requests.
pub mod quorum;

/// Sequence numbers not yet seen by an acceptor.
pub mod missing;

/// In-order delivery to the application.
pub mod delivery;

/// Clients blocked until their broadcast is ordered.
pub mod waiting;

/// Heartbeat failure detection.
pub mod detector;

/// Fragmentation of large payloads.
pub mod fragment;

// =============================================================================
// Roles and runtime
// =============================================================================

/// The acceptor role.
pub mod acceptor;

/// The leader role.
pub mod leader;

/// One member, without I/O.
pub mod node;

/// UDP transport.
pub mod udp;

/// Async runtime.
pub mod group;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use acceptor::{AcceptorState, MsgIdAllocator};
pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use config::GroupConfig;
pub use delivery::{Application, OrderedDelivery};
pub use detector::{FailureDetector, MembershipChange};
pub use fragment::{
    Fragment, FragmentCollector, FragmentError, FragmentingTransport, Reassembler, split_payload,
};
pub use group::Group;
pub use leader::{LeaderState, LeaderStats};
pub use membership::{Member, Membership};
pub use message::Message;
pub use missing::MissingSet;
pub use node::Node;
pub use quorum::{QuorumRound, RoundProgress};
pub use time::{ManualClock, TimeProvider, TokioTimeProvider};
pub use transport::{Messenger, Transport, TransportError};
pub use types::{Acceptance, MsgId, PaxcastError, Proposal, SeqNo, Value, ViewNumber};
pub use udp::UdpTransport;
pub use waiting::{Registration, WaitingRoom};
