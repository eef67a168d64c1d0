//! The acceptor role, played by every member.
//!
//! The acceptor is the passive half of the protocol. It answers three
//! requests and owns the client-facing side of `broadcast`:
//!
//! ```text
//! NewView(leader, v)      v > view        adopt, reply ViewAccepted(v, accepted)
//!                         v == view,
//!                         same leader     reply ViewAccepted again
//!                         otherwise       ignore
//!
//! Accept(v, seq, value)   v < view        reply Abort(v, seq)
//!                         otherwise       record, reply Accepted(v, seq, missing)
//!
//! Success(seq, value)     deliver in order, mark confirmed, wake the local
//!                         client, reply SuccessAck to the leader
//! ```
//!
//! The accepted table is the acceptor's vote history. It is reported in full
//! to every new leader so values accepted under a previous leader are never
//! lost.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::delivery::{Application, OrderedDelivery};
use crate::membership::{Member, Membership};
use crate::message::Message;
use crate::missing::MissingSet;
use crate::transport::Messenger;
use crate::types::{Acceptance, MsgId, SeqNo, Value, ViewNumber};
use crate::waiting::WaitingRoom;

/// Allocates client message ids for one member.
///
/// Shared between the event loop and concurrent `broadcast` callers.
#[derive(Debug)]
pub struct MsgIdAllocator {
    position: usize,
    counter: AtomicU64,
}

impl MsgIdAllocator {
    /// Allocator for the member at `position`.
    pub fn new(position: usize) -> Self {
        Self {
            position,
            counter: AtomicU64::new(0),
        }
    }

    /// Allocate the next id. The first id uses counter 1.
    pub fn next(&self) -> MsgId {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        MsgId::client(self.position, counter)
    }
}

/// Acceptor-side protocol state of one member.
pub struct AcceptorState {
    membership: Membership,
    messenger: Messenger,
    view: ViewNumber,
    leader: Member,
    accepted: BTreeMap<SeqNo, Acceptance>,
    missing: MissingSet,
    delivery: OrderedDelivery,
    waiting: Arc<WaitingRoom>,
    msg_ids: Arc<MsgIdAllocator>,
}

impl AcceptorState {
    /// Create the acceptor. It initially follows the default leader in view 0.
    pub fn new(membership: Membership, messenger: Messenger) -> Self {
        let leader = membership.default_leader();
        let msg_ids = Arc::new(MsgIdAllocator::new(membership.position()));
        Self {
            membership,
            messenger,
            view: ViewNumber::ZERO,
            leader,
            accepted: BTreeMap::new(),
            missing: MissingSet::new(),
            delivery: OrderedDelivery::new(),
            waiting: Arc::new(WaitingRoom::new()),
            msg_ids,
        }
    }

    // ========================================================================
    // Protocol handlers
    // ========================================================================

    /// Handle a leadership announcement.
    pub fn on_new_view(&mut self, leader: Member, view: ViewNumber) {
        if view > self.view {
            info!(
                me = %self.membership.me(),
                leader = %leader,
                view = %view,
                "adopting new view"
            );
            self.view = view;
            self.leader = leader;
            self.send_view_accepted();
        } else if view == self.view && leader == self.leader {
            debug!(leader = %leader, view = %view, "re-acknowledging view");
            self.send_view_accepted();
        } else {
            debug!(
                leader = %leader,
                view = %view,
                current = %self.view,
                "ignoring stale view"
            );
        }
    }

    /// Handle an Accept request.
    pub fn on_accept(
        &mut self,
        view: ViewNumber,
        seq_no: SeqNo,
        value: Value,
        msg_id: MsgId,
        sender: Member,
    ) {
        if view < self.view {
            warn!(
                sender = %sender,
                view = %view,
                current = %self.view,
                seq_no = %seq_no,
                "rejecting accept from stale leader"
            );
            self.messenger.send(sender, &Message::Abort { view, seq_no });
            return;
        }

        // Raise the promise so a delayed lower-view Accept can no longer
        // overwrite this acceptance.
        if view > self.view {
            info!(leader = %sender, view = %view, "adopting view from accept");
            self.view = view;
            self.leader = sender;
        }

        debug!(seq_no = %seq_no, view = %view, msg_id = %msg_id, "accepted");
        self.accepted.insert(
            seq_no,
            Acceptance {
                view,
                value,
                msg_id,
            },
        );
        let missing = self.missing.missing_below(seq_no);
        self.messenger.send(
            sender,
            &Message::Accepted {
                view,
                seq_no,
                msg_id,
                missing,
                sender: self.membership.me(),
            },
        );
    }

    /// Handle a Success notification.
    ///
    /// Returns the number of application values delivered.
    pub fn on_success(
        &mut self,
        seq_no: SeqNo,
        value: Value,
        msg_id: MsgId,
        app: &mut dyn Application,
    ) -> usize {
        let delivered = self.delivery.offer(seq_no, value, app);
        self.missing.received(seq_no);
        if self.waiting.unblock(msg_id) {
            debug!(msg_id = %msg_id, seq_no = %seq_no, "broadcast completed");
        }
        self.messenger.send(
            self.leader,
            &Message::SuccessAck {
                msg_id,
                sender: self.membership.me(),
            },
        );
        delivered
    }

    // ========================================================================
    // Client side
    // ========================================================================

    /// Allocate a message id for a new local broadcast.
    pub fn next_msg_id(&self) -> MsgId {
        self.msg_ids.next()
    }

    /// Send (or resend) a broadcast request to the believed leader.
    pub fn send_broadcast_request(&self, value: Value, msg_id: MsgId) {
        debug!(leader = %self.leader, msg_id = %msg_id, "requesting broadcast");
        self.messenger
            .send(self.leader, &Message::BroadcastRequest { value, msg_id });
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Highest view adopted.
    pub fn view(&self) -> ViewNumber {
        self.view
    }

    /// Believed leader.
    pub fn leader(&self) -> Member {
        self.leader
    }

    /// The accepted table.
    pub fn accepted(&self) -> &BTreeMap<SeqNo, Acceptance> {
        &self.accepted
    }

    /// Success bookkeeping.
    pub fn missing(&self) -> &MissingSet {
        &self.missing
    }

    /// Next sequence number the application waits for.
    pub fn next_delivery(&self) -> SeqNo {
        self.delivery.next_expected()
    }

    /// Shared waiting room for local broadcasts.
    pub fn waiting_room(&self) -> Arc<WaitingRoom> {
        self.waiting.clone()
    }

    /// Shared message id allocator.
    pub fn msg_id_allocator(&self) -> Arc<MsgIdAllocator> {
        self.msg_ids.clone()
    }

    fn send_view_accepted(&self) {
        let accepted = self
            .accepted
            .iter()
            .map(|(seq, acc)| (*seq, acc.clone()))
            .collect();
        self.messenger.send(
            self.leader,
            &Message::ViewAccepted {
                view: self.view,
                accepted,
                sender: self.membership.me(),
            },
        );
    }
}

impl std::fmt::Debug for AcceptorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptorState")
            .field("me", &self.membership.me())
            .field("view", &self.view)
            .field("leader", &self.leader)
            .field("accepted", &self.accepted.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use std::collections::BTreeSet;
    use std::net::SocketAddr;

    fn member(port: u16) -> Member {
        Member::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn setup(me: u16) -> (AcceptorState, Arc<RecordingTransport>) {
        let membership =
            Membership::new([member(0), member(1), member(2)], member(me)).expect("membership");
        let transport = RecordingTransport::new();
        (
            AcceptorState::new(membership, Messenger::new(transport.clone())),
            transport,
        )
    }

    fn value(s: &str) -> Value {
        Value::App(s.as_bytes().to_vec())
    }

    #[test]
    fn test_initially_follows_default_leader() {
        let (acceptor, _t) = setup(0);
        assert_eq!(acceptor.leader(), member(2));
        assert_eq!(acceptor.view(), ViewNumber::ZERO);
    }

    #[test]
    fn test_msg_ids_start_at_one_and_encode_position() {
        let (acceptor, _t) = setup(1);
        assert_eq!(acceptor.next_msg_id(), MsgId(1_000_001));
        assert_eq!(acceptor.next_msg_id(), MsgId(1_000_002));
    }

    #[test]
    fn test_new_view_adopts_higher_views_only() {
        let (mut acceptor, transport) = setup(0);

        acceptor.on_new_view(member(2), ViewNumber::new(5));
        assert_eq!(
            transport.take(),
            vec![(
                member(2),
                Message::ViewAccepted {
                    view: ViewNumber::new(5),
                    accepted: vec![],
                    sender: member(0),
                }
            )]
        );

        // lower view: ignored
        acceptor.on_new_view(member(1), ViewNumber::new(4));
        assert!(transport.take().is_empty());
        assert_eq!(acceptor.leader(), member(2));

        // same view, different leader: ignored
        acceptor.on_new_view(member(1), ViewNumber::new(5));
        assert!(transport.take().is_empty());

        // same view, same leader: idempotent re-ack
        acceptor.on_new_view(member(2), ViewNumber::new(5));
        assert_eq!(transport.take().len(), 1);
    }

    #[test]
    fn test_accept_records_and_reports_missing() {
        let (mut acceptor, transport) = setup(0);
        acceptor.on_new_view(member(2), ViewNumber::new(5));
        transport.take();

        acceptor.on_accept(ViewNumber::new(5), SeqNo(3), value("c"), MsgId(7), member(2));
        assert_eq!(
            transport.take(),
            vec![(
                member(2),
                Message::Accepted {
                    view: ViewNumber::new(5),
                    seq_no: SeqNo(3),
                    msg_id: MsgId(7),
                    missing: [SeqNo(1), SeqNo(2)].into_iter().collect::<BTreeSet<_>>(),
                    sender: member(0),
                }
            )]
        );
        assert_eq!(acceptor.accepted()[&SeqNo(3)].value, value("c"));
    }

    #[test]
    fn test_accept_from_stale_view_aborts() {
        let (mut acceptor, transport) = setup(0);
        acceptor.on_new_view(member(1), ViewNumber::new(7));
        transport.take();

        acceptor.on_accept(ViewNumber::new(5), SeqNo(1), value("x"), MsgId(1), member(2));
        assert_eq!(
            transport.take(),
            vec![(
                member(2),
                Message::Abort {
                    view: ViewNumber::new(5),
                    seq_no: SeqNo(1),
                }
            )]
        );
        assert!(acceptor.accepted().is_empty());
    }

    #[test]
    fn test_accept_overwrites_and_raises_view() {
        let (mut acceptor, transport) = setup(0);
        acceptor.on_accept(ViewNumber::new(5), SeqNo(1), value("a"), MsgId(1), member(2));
        acceptor.on_accept(ViewNumber::new(7), SeqNo(1), value("b"), MsgId(2), member(1));
        assert_eq!(acceptor.view(), ViewNumber::new(7));
        assert_eq!(acceptor.leader(), member(1));
        assert_eq!(acceptor.accepted()[&SeqNo(1)].value, value("b"));
        transport.take();

        // the delayed view-5 accept can no longer overwrite
        acceptor.on_accept(ViewNumber::new(5), SeqNo(1), value("a"), MsgId(1), member(2));
        assert!(matches!(transport.take()[0].1, Message::Abort { .. }));
        assert_eq!(acceptor.accepted()[&SeqNo(1)].msg_id, MsgId(2));
    }

    #[test]
    fn test_view_accepted_reports_accepted_table() {
        let (mut acceptor, transport) = setup(0);
        acceptor.on_accept(ViewNumber::new(5), SeqNo(1), value("a"), MsgId(1), member(2));
        transport.take();

        acceptor.on_new_view(member(1), ViewNumber::new(7));
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, member(1));
        match &sent[0].1 {
            Message::ViewAccepted { accepted, .. } => {
                assert_eq!(accepted.len(), 1);
                assert_eq!(accepted[0].0, SeqNo(1));
                assert_eq!(accepted[0].1.view, ViewNumber::new(5));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_success_delivers_unblocks_and_acks() {
        let (mut acceptor, transport) = setup(0);
        let id = acceptor.next_msg_id();
        acceptor.waiting_room().register(id);

        let mut got = Vec::new();
        let mut app = |s: SeqNo, p: Vec<u8>| got.push((s, p));
        let delivered = acceptor.on_success(SeqNo(1), value("hello"), id, &mut app);
        drop(app);

        assert_eq!(delivered, 1);
        assert_eq!(got, vec![(SeqNo(1), b"hello".to_vec())]);
        assert!(acceptor.waiting_room().is_complete(id));
        assert!(acceptor.missing().contains(SeqNo(1)));
        assert_eq!(
            transport.take(),
            vec![(
                member(2),
                Message::SuccessAck {
                    msg_id: id,
                    sender: member(0),
                }
            )]
        );
    }

    #[test]
    fn test_duplicate_success_delivers_once_but_acks_again() {
        let (mut acceptor, transport) = setup(0);
        let mut count = 0;
        let mut app = |_: SeqNo, _: Vec<u8>| count += 1;

        acceptor.on_success(SeqNo(1), value("a"), MsgId(9), &mut app);
        acceptor.on_success(SeqNo(1), value("a"), MsgId(9), &mut app);
        drop(app);

        assert_eq!(count, 1);
        assert_eq!(transport.take().len(), 2);
    }

    #[test]
    fn test_broadcast_request_goes_to_believed_leader() {
        let (mut acceptor, transport) = setup(0);
        acceptor.send_broadcast_request(value("x"), MsgId(1));
        assert_eq!(transport.take()[0].0, member(2));

        acceptor.on_new_view(member(1), ViewNumber::new(7));
        transport.take();
        acceptor.send_broadcast_request(value("x"), MsgId(1));
        assert_eq!(transport.take()[0].0, member(1));
    }
}
