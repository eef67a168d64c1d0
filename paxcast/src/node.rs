//! One group member, without I/O.
//!
//! A [`Node`] wires the roles together: inbound frames go through the
//! [`Reassembler`], get decoded, and are dispatched by kind to the acceptor,
//! the leader and the failure detector. Outbound messages leave through a
//! [`FragmentingTransport`] around the caller's [`Transport`].
//!
//! Nothing here reads a clock or spawns a task. The caller owns the event
//! loop: it feeds datagrams and periodic ticks with the current time, one at
//! a time. [`Group`](crate::group::Group) does so over UDP with tokio; the
//! simulation crate does so with a virtual clock.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::acceptor::{AcceptorState, MsgIdAllocator};
use crate::config::GroupConfig;
use crate::delivery::Application;
use crate::detector::{FailureDetector, MembershipChange};
use crate::fragment::{FragmentingTransport, Reassembler};
use crate::leader::LeaderState;
use crate::membership::{Member, Membership};
use crate::message::Message;
use crate::transport::{Messenger, Transport};
use crate::types::{MsgId, PaxcastError, Value};
use crate::waiting::WaitingRoom;

/// A group member's complete protocol state.
pub struct Node {
    membership: Membership,
    messenger: Messenger,
    acceptor: AcceptorState,
    leader: LeaderState,
    detector: FailureDetector,
    reassembler: Reassembler,
    app: Box<dyn Application>,
}

impl Node {
    /// Build a node. Fragment ids come from OS entropy.
    pub fn new(
        membership: Membership,
        config: &GroupConfig,
        transport: Arc<dyn Transport>,
        app: Box<dyn Application>,
        now: Duration,
    ) -> Result<Self, PaxcastError> {
        config.validate()?;
        let transport = FragmentingTransport::new(transport, config.fragment_size);
        Ok(Self::build(membership, config, Arc::new(transport), app, now))
    }

    /// Build a node whose fragment ids come from `seed`, for reproducible runs.
    pub fn seeded(
        membership: Membership,
        config: &GroupConfig,
        transport: Arc<dyn Transport>,
        app: Box<dyn Application>,
        now: Duration,
        seed: u64,
    ) -> Result<Self, PaxcastError> {
        config.validate()?;
        let transport = FragmentingTransport::seeded(transport, config.fragment_size, seed);
        Ok(Self::build(membership, config, Arc::new(transport), app, now))
    }

    fn build(
        membership: Membership,
        config: &GroupConfig,
        transport: Arc<dyn Transport>,
        app: Box<dyn Application>,
        now: Duration,
    ) -> Self {
        let messenger = Messenger::new(transport);
        let acceptor = AcceptorState::new(membership.clone(), messenger.clone());
        let detector = FailureDetector::new(
            &membership,
            config.heartbeat_interval,
            config.failure_timeout,
            now,
        );
        let leader = LeaderState::new(
            membership.clone(),
            messenger.clone(),
            config.resend_interval,
            config.completed_window,
            now,
        );
        Self {
            membership,
            messenger,
            acceptor,
            leader,
            detector,
            reassembler: Reassembler::new(config.reassembly_timeout, config.max_fragments()),
            app,
        }
    }

    // ========================================================================
    // Event entry points
    // ========================================================================

    /// Handle one inbound datagram.
    ///
    /// Malformed frames and undecodable payloads are logged and dropped.
    pub fn handle_datagram(&mut self, frame: &[u8], now: Duration) {
        let payload = match self.reassembler.accept(frame, now) {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                warn!(me = %self.membership.me(), error = %e, "dropping malformed frame");
                return;
            }
        };
        match self.messenger.decode(&payload) {
            Ok(msg) => self.dispatch(msg, now),
            Err(e) => warn!(me = %self.membership.me(), error = %e, "dropping undecodable payload"),
        }
    }

    /// Dispatch a decoded protocol message.
    pub fn dispatch(&mut self, msg: Message, now: Duration) {
        match msg {
            Message::Heartbeat { sender } => {
                if let Some(change) = self.detector.on_heartbeat(sender, now) {
                    self.on_membership_change(change, now);
                }
            }
            Message::NewView { leader, view } => {
                self.acceptor.on_new_view(leader, view);
                self.leader.handle(&Message::NewView { leader, view }, now);
            }
            Message::Accept {
                view,
                seq_no,
                value,
                msg_id,
                sender,
            } => self.acceptor.on_accept(view, seq_no, value, msg_id, sender),
            Message::Success {
                seq_no,
                value,
                msg_id,
            } => {
                self.acceptor
                    .on_success(seq_no, value, msg_id, self.app.as_mut());
            }
            other => self.leader.handle(&other, now),
        }
    }

    /// Drive timers: probes and failure checks, round resends, reassembly expiry.
    pub fn tick(&mut self, now: Duration) {
        for change in self.detector.tick(now, &self.messenger) {
            self.on_membership_change(change, now);
        }
        self.leader.tick(now);
        self.reassembler.expire(now);
    }

    fn on_membership_change(&mut self, change: MembershipChange, now: Duration) {
        match change {
            MembershipChange::Failed { member, alive } => {
                self.leader.on_member_failed(member, &alive, now);
            }
            MembershipChange::Recovered { member, .. } => {
                debug!(member = %member, "recovery needs no protocol action");
            }
        }
    }

    // ========================================================================
    // Client side
    // ========================================================================

    /// Start a broadcast: allocate an id, register it, request ordering.
    pub fn begin_broadcast(&mut self, value: Value) -> MsgId {
        let msg_id = self.acceptor.next_msg_id();
        self.acceptor.waiting_room().register(msg_id);
        self.acceptor.send_broadcast_request(value, msg_id);
        msg_id
    }

    /// Resend the request for a broadcast still waiting for its Success.
    pub fn resend_broadcast(&mut self, value: Value, msg_id: MsgId) {
        self.acceptor.send_broadcast_request(value, msg_id);
    }

    /// Whether the Success for a local broadcast has arrived.
    pub fn is_complete(&self, msg_id: MsgId) -> bool {
        self.acceptor.waiting_room().is_complete(msg_id)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// The local member.
    pub fn me(&self) -> Member {
        self.membership.me()
    }

    /// The group roster.
    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Acceptor state.
    pub fn acceptor(&self) -> &AcceptorState {
        &self.acceptor
    }

    /// Leader state.
    pub fn leader(&self) -> &LeaderState {
        &self.leader
    }

    /// Failure detector state.
    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    /// Waiting room shared with concurrent `broadcast` callers.
    pub fn waiting_room(&self) -> Arc<WaitingRoom> {
        self.acceptor.waiting_room()
    }

    /// Message id allocator shared with concurrent `broadcast` callers.
    pub fn msg_id_allocator(&self) -> Arc<MsgIdAllocator> {
        self.acceptor.msg_id_allocator()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("acceptor", &self.acceptor)
            .field("leader", &self.leader)
            .finish_non_exhaustive()
    }
}
