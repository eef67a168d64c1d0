//! Protocol messages exchanged between members.
//!
//! Every datagram carries exactly one [`Message`]. Dispatch is a single
//! `match` in [`Node`](crate::node::Node).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::membership::Member;
use crate::types::{Acceptance, MsgId, SeqNo, Value, ViewNumber};

/// All protocol message kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Leader candidate announces a new view (election request).
    NewView {
        /// The candidate.
        leader: Member,
        /// The proposed view.
        view: ViewNumber,
    },

    /// Acceptor adopts a view and reports everything it accepted so far.
    ViewAccepted {
        /// The adopted view.
        view: ViewNumber,
        /// Accepted values, one entry per sequence number.
        accepted: Vec<(SeqNo, Acceptance)>,
        /// The responding acceptor.
        sender: Member,
    },

    /// Leader asks acceptors to accept `value` at `seq_no`.
    Accept {
        /// View of the proposing leader.
        view: ViewNumber,
        /// Target sequence number.
        seq_no: SeqNo,
        /// Proposed value.
        value: Value,
        /// Message id the value circulates under.
        msg_id: MsgId,
        /// The proposing leader.
        sender: Member,
    },

    /// Acceptor accepted a value.
    Accepted {
        /// View the value was accepted in.
        view: ViewNumber,
        /// The accepted sequence number.
        seq_no: SeqNo,
        /// Message id of the accepted value.
        msg_id: MsgId,
        /// Sequence numbers below `seq_no` whose Success the acceptor missed.
        missing: BTreeSet<SeqNo>,
        /// The responding acceptor.
        sender: Member,
    },

    /// Acceptor rejects an Accept from a stale view.
    Abort {
        /// The stale view.
        view: ViewNumber,
        /// The rejected sequence number.
        seq_no: SeqNo,
    },

    /// Client request forwarded to the believed leader.
    BroadcastRequest {
        /// Value to order.
        value: Value,
        /// Client-assigned message id.
        msg_id: MsgId,
    },

    /// Leader announces a decided value.
    Success {
        /// Decided sequence number.
        seq_no: SeqNo,
        /// Decided value.
        value: Value,
        /// Message id of the decided value.
        msg_id: MsgId,
    },

    /// Acceptor acknowledges a Success.
    SuccessAck {
        /// Message id of the acknowledged value.
        msg_id: MsgId,
        /// The acknowledging acceptor.
        sender: Member,
    },

    /// Liveness probe.
    Heartbeat {
        /// The probing member.
        sender: Member,
    },
}

impl Message {
    /// The member that sent this message, when the message names it.
    pub fn sender(&self) -> Option<Member> {
        match self {
            Message::NewView { leader, .. } => Some(*leader),
            Message::ViewAccepted { sender, .. }
            | Message::Accept { sender, .. }
            | Message::Accepted { sender, .. }
            | Message::SuccessAck { sender, .. }
            | Message::Heartbeat { sender } => Some(*sender),
            Message::Abort { .. } | Message::BroadcastRequest { .. } | Message::Success { .. } => {
                None
            }
        }
    }

    /// Short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::NewView { .. } => "NewView",
            Message::ViewAccepted { .. } => "ViewAccepted",
            Message::Accept { .. } => "Accept",
            Message::Accepted { .. } => "Accepted",
            Message::Abort { .. } => "Abort",
            Message::BroadcastRequest { .. } => "BroadcastRequest",
            Message::Success { .. } => "Success",
            Message::SuccessAck { .. } => "SuccessAck",
            Message::Heartbeat { .. } => "Heartbeat",
        }
    }
}
