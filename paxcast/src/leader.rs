//! The leader role.
//!
//! Every member carries a `LeaderState`; only the elected one drives
//! proposals. The leader runs three kinds of [`QuorumRound`]:
//!
//! ```text
//! Election      NewView(me, v)        ──> ViewAccepted(v, accepted)   majority: elected
//! Accept        Accept(v, seq, value) ──> Accepted(v, seq, missing)   majority: decided
//! Success       Success(seq, value)   ──> SuccessAck(msg_id)          all:      forget
//! ```
//!
//! ## Election
//!
//! A member starts an election when it is the default leader at startup, or
//! when the failure detector reports a failure and it is the highest alive
//! member. On majority it re-proposes every value reported by the acceptors
//! (keeping the outcome from the highest view per sequence number) and fills
//! every empty sequence number up to the highest known one with a no-op.
//! Starting an election ends any earlier election this member still runs.
//!
//! ## Stepping down
//!
//! A NewView with a higher view naming another member clears the elected
//! flag. Accepts sent under a superseded view are answered with Abort, which
//! drops the proposal, ends the round and releases the client message id so
//! a resend is proposed again once this member is re-elected.
//!
//! ## Garbage collection
//!
//! A Success round ends once every member has acknowledged. The decided
//! outcome, the proposal and the circulating message id are then forgotten.
//! The message id moves to a bounded window so a late retransmission of the
//! same client request is still recognised.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::membership::{Member, Membership};
use crate::message::Message;
use crate::quorum::{QuorumRound, RoundProgress};
use crate::transport::Messenger;
use crate::types::{Acceptance, MsgId, Proposal, SeqNo, Value, ViewNumber};

// ============================================================================
// Completed id window
// ============================================================================

/// Bounded FIFO of client message ids whose rounds were garbage collected.
#[derive(Debug)]
struct CompletedWindow {
    order: VecDeque<MsgId>,
    ids: HashSet<MsgId>,
    capacity: usize,
}

impl CompletedWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, msg_id: MsgId) {
        if self.capacity == 0 || !self.ids.insert(msg_id) {
            return;
        }
        self.order.push_back(msg_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, msg_id: &MsgId) -> bool {
        self.ids.contains(msg_id)
    }
}

// ============================================================================
// Rounds
// ============================================================================

#[derive(Debug)]
enum Round {
    Election {
        view: ViewNumber,
        round: QuorumRound<()>,
    },
    Accept {
        view: ViewNumber,
        seq_no: SeqNo,
        value: Value,
        msg_id: MsgId,
        round: QuorumRound<()>,
    },
    Success {
        seq_no: SeqNo,
        msg_id: MsgId,
        round: QuorumRound<()>,
    },
}

impl Round {
    fn quorum(&mut self) -> &mut QuorumRound<()> {
        match self {
            Round::Election { round, .. }
            | Round::Accept { round, .. }
            | Round::Success { round, .. } => round,
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Round::Election { round, .. }
            | Round::Accept { round, .. }
            | Round::Success { round, .. } => round.is_finished(),
        }
    }
}

/// Snapshot of the leader's bookkeeping, for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaderStats {
    /// In-flight election rounds.
    pub elections: usize,
    /// In-flight accept rounds.
    pub accepts: usize,
    /// In-flight success rounds.
    pub successes: usize,
    /// Proposals held.
    pub proposals: usize,
    /// Decided outcomes not yet acknowledged by everyone.
    pub decided: usize,
    /// Client message ids currently circulating.
    pub circulating: usize,
}

// ============================================================================
// LeaderState
// ============================================================================

/// Leader-side protocol state of one member.
pub struct LeaderState {
    membership: Membership,
    messenger: Messenger,
    resend_interval: Duration,

    view: ViewNumber,
    elected: bool,
    /// Last allocated sequence number (0 before the first).
    last_seq: u64,

    proposals: BTreeMap<SeqNo, Proposal>,
    decided: BTreeMap<SeqNo, (Value, MsgId)>,
    circulating: HashSet<MsgId>,
    completed: CompletedWindow,

    rounds: Vec<Round>,
}

impl LeaderState {
    /// Create the leader state. The default leader starts an election at once.
    pub fn new(
        membership: Membership,
        messenger: Messenger,
        resend_interval: Duration,
        completed_window: usize,
        now: Duration,
    ) -> Self {
        let mut leader = Self {
            membership,
            messenger,
            resend_interval,
            view: ViewNumber::ZERO,
            elected: false,
            last_seq: 0,
            proposals: BTreeMap::new(),
            decided: BTreeMap::new(),
            circulating: HashSet::new(),
            completed: CompletedWindow::new(completed_window),
            rounds: Vec::new(),
        };
        if leader.membership.is_default_leader() {
            leader.start_election(now);
        }
        leader
    }

    /// Feed an inbound protocol message.
    pub fn handle(&mut self, msg: &Message, now: Duration) {
        match msg {
            Message::NewView { leader, view } => self.on_new_view(*leader, *view),
            Message::Abort { view, seq_no } => self.on_abort(*view, *seq_no),
            Message::BroadcastRequest { value, msg_id } => {
                self.on_broadcast_request(value.clone(), *msg_id, now)
            }
            Message::ViewAccepted { .. } | Message::Accepted { .. } | Message::SuccessAck { .. } => {
                self.dispatch_response(msg, now)
            }
            Message::Accept { .. } | Message::Success { .. } | Message::Heartbeat { .. } => {}
        }
    }

    /// Resend every in-flight round that is due.
    pub fn tick(&mut self, now: Duration) {
        for round in &mut self.rounds {
            round.quorum().tick(now, &self.messenger);
        }
    }

    /// React to the failure detector declaring a member failed.
    ///
    /// Starts an election if this member is the highest alive member and is
    /// not already elected.
    pub fn on_member_failed<'a>(
        &mut self,
        failed: Member,
        alive: impl IntoIterator<Item = &'a Member>,
        now: Duration,
    ) {
        let me = self.membership.me();
        if self.membership.select_leader(alive) != Some(me) {
            return;
        }
        if self.elected {
            debug!(failed = %failed, view = %self.view, "already elected, keeping view");
            return;
        }
        info!(me = %me, failed = %failed, "taking leadership");
        self.start_election(now);
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Whether this member believes it is the elected leader.
    pub fn is_elected(&self) -> bool {
        self.elected
    }

    /// Highest view observed or proposed.
    pub fn view(&self) -> ViewNumber {
        self.view
    }

    /// Last allocated sequence number, if any.
    pub fn last_seq_no(&self) -> Option<SeqNo> {
        (self.last_seq > 0).then_some(SeqNo(self.last_seq))
    }

    /// Current proposal for `seq_no`.
    pub fn proposal(&self, seq_no: SeqNo) -> Option<&Proposal> {
        self.proposals.get(&seq_no)
    }

    /// Bookkeeping counters.
    pub fn stats(&self) -> LeaderStats {
        let mut stats = LeaderStats {
            proposals: self.proposals.len(),
            decided: self.decided.len(),
            circulating: self.circulating.len(),
            ..LeaderStats::default()
        };
        for round in &self.rounds {
            match round {
                Round::Election { .. } => stats.elections += 1,
                Round::Accept { .. } => stats.accepts += 1,
                Round::Success { .. } => stats.successes += 1,
            }
        }
        stats
    }

    // ========================================================================
    // Message handlers
    // ========================================================================

    fn on_new_view(&mut self, leader: Member, view: ViewNumber) {
        if view <= self.view {
            return;
        }
        self.view = view;
        if leader != self.membership.me() {
            if self.elected {
                info!(new_leader = %leader, view = %view, "stepping down");
            }
            self.elected = false;
        }
        // elections for older views can never reach quorum now
        for round in &mut self.rounds {
            if let Round::Election { view: v, round } = round {
                if *v < view {
                    round.finish();
                }
            }
        }
        self.rounds.retain(|r| !r.is_finished());
    }

    fn on_abort(&mut self, view: ViewNumber, seq_no: SeqNo) {
        warn!(view = %view, seq_no = %seq_no, "accept aborted by newer view");
        if view == self.view {
            self.proposals.remove(&seq_no);
        }
        let mut aborted = Vec::new();
        for round in &mut self.rounds {
            if let Round::Accept {
                view: v,
                seq_no: s,
                msg_id,
                round,
                ..
            } = round
            {
                if *v == view && *s == seq_no && !round.is_finished() {
                    round.finish();
                    aborted.push(*msg_id);
                }
            }
        }
        self.rounds.retain(|r| !r.is_finished());

        // a resend of an aborted request is a new proposal, not a duplicate
        let decided: HashSet<MsgId> = self.decided.values().map(|(_, id)| *id).collect();
        for msg_id in aborted {
            if !decided.contains(&msg_id) {
                self.circulating.remove(&msg_id);
            }
        }
    }

    fn on_broadcast_request(&mut self, value: Value, msg_id: MsgId, now: Duration) {
        if !self.elected {
            debug!(msg_id = %msg_id, "not the leader, dropping broadcast request");
            return;
        }
        if self.circulating.contains(&msg_id) || self.completed.contains(&msg_id) {
            debug!(msg_id = %msg_id, "duplicate broadcast request");
            return;
        }
        self.circulating.insert(msg_id);
        self.last_seq += 1;
        let seq_no = SeqNo(self.last_seq);
        debug!(seq_no = %seq_no, msg_id = %msg_id, view = %self.view, "proposing");
        self.proposals
            .insert(seq_no, Proposal::new(self.view, value.clone(), msg_id));
        self.start_accept(seq_no, value, msg_id, now);
    }

    // ========================================================================
    // Round dispatch
    // ========================================================================

    fn dispatch_response(&mut self, msg: &Message, now: Duration) {
        let mut rounds = std::mem::take(&mut self.rounds);
        for round in &mut rounds {
            if !round.is_finished() {
                self.feed(round, msg, now);
            }
        }
        rounds.retain(|r| !r.is_finished());
        // rounds started by the hooks above
        rounds.append(&mut self.rounds);
        self.rounds = rounds;
    }

    fn feed(&mut self, round: &mut Round, msg: &Message, now: Duration) {
        match (round, msg) {
            (
                Round::Election { view, round },
                Message::ViewAccepted {
                    view: v,
                    accepted,
                    sender,
                },
            ) if *v == *view && *v == self.view => {
                self.register_view_acceptance(accepted);
                let progress = round.record(*sender, ());
                if progress.quorum_reached {
                    self.on_elected(now);
                }
                if progress.all_replied {
                    round.finish();
                }
            }

            (
                Round::Accept {
                    view,
                    seq_no,
                    value,
                    msg_id,
                    round,
                },
                Message::Accepted {
                    view: v,
                    seq_no: s,
                    missing,
                    sender,
                    ..
                },
            ) if *v == *view && *v == self.view && *s == *seq_no => {
                if let Some(proposal) = self.proposals.get_mut(&*seq_no) {
                    proposal.accept_outcome(*view, value.clone(), *msg_id);
                }
                self.send_missing_successes(missing.iter(), *sender);
                let progress: RoundProgress = round.record(*sender, ());
                if progress.quorum_reached {
                    info!(seq_no = %seq_no, msg_id = %msg_id, view = %view, "decided");
                    self.decided.insert(*seq_no, (value.clone(), *msg_id));
                    self.start_success(*seq_no, value.clone(), *msg_id, now);
                }
                if progress.all_replied {
                    round.finish();
                }
            }

            (
                Round::Success {
                    seq_no,
                    msg_id,
                    round,
                },
                Message::SuccessAck { msg_id: m, sender },
            ) if *m == *msg_id => {
                if round.record(*sender, ()).all_replied {
                    self.collect_garbage(*seq_no, *msg_id);
                    round.finish();
                }
            }

            _ => {}
        }
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    fn start_election(&mut self, now: Duration) {
        let view = self
            .view
            .next_for(self.membership.position(), self.membership.size());
        self.view = view;
        self.elected = false;
        info!(me = %self.membership.me(), view = %view, "starting election");

        // only the newest own election can still win
        for round in &mut self.rounds {
            if let Round::Election { round, .. } = round {
                round.finish();
            }
        }
        self.rounds.retain(|r| !r.is_finished());

        let request = Message::NewView {
            leader: self.membership.me(),
            view,
        };
        let round = QuorumRound::start(
            request,
            &self.membership,
            &self.messenger,
            self.resend_interval,
            now,
        );
        self.rounds.push(Round::Election { view, round });
    }

    fn register_view_acceptance(&mut self, accepted: &[(SeqNo, Acceptance)]) {
        for (seq_no, acceptance) in accepted {
            match self.proposals.get_mut(seq_no) {
                Some(proposal) => {
                    proposal.accept_outcome(
                        acceptance.view,
                        acceptance.value.clone(),
                        acceptance.msg_id,
                    );
                }
                None => {
                    self.proposals.insert(
                        *seq_no,
                        Proposal::new(acceptance.view, acceptance.value.clone(), acceptance.msg_id),
                    );
                }
            }
        }
    }

    fn on_elected(&mut self, now: Duration) {
        self.elected = true;
        let highest = self.proposals.keys().next_back().map_or(0, |s| s.0);
        self.last_seq = self.last_seq.max(highest);
        info!(
            me = %self.membership.me(),
            view = %self.view,
            recovered = self.proposals.len(),
            last_seq = self.last_seq,
            "elected leader"
        );

        let recovered: Vec<(SeqNo, Value, MsgId)> = self
            .proposals
            .iter()
            .map(|(seq, p)| (*seq, p.outcome().clone(), p.msg_id()))
            .collect();
        self.circulating = self
            .decided
            .values()
            .map(|(_, id)| *id)
            .filter(|id| !id.is_no_op())
            .collect();
        for (seq_no, value, msg_id) in recovered {
            if !msg_id.is_no_op() {
                self.circulating.insert(msg_id);
            }
            self.start_accept(seq_no, value, msg_id, now);
        }

        // own numbers that were aborted in an earlier term are gaps too
        for seq in SeqNo::FIRST.0..=self.last_seq {
            let seq_no = SeqNo(seq);
            if self.proposals.contains_key(&seq_no) {
                continue;
            }
            let msg_id = MsgId::for_no_op(seq_no);
            debug!(seq_no = %seq_no, "filling gap with no-op");
            self.proposals
                .insert(seq_no, Proposal::new(self.view, Value::NoOp, msg_id));
            self.start_accept(seq_no, Value::NoOp, msg_id, now);
        }
    }

    fn start_accept(&mut self, seq_no: SeqNo, value: Value, msg_id: MsgId, now: Duration) {
        let request = Message::Accept {
            view: self.view,
            seq_no,
            value: value.clone(),
            msg_id,
            sender: self.membership.me(),
        };
        let round = QuorumRound::start(
            request,
            &self.membership,
            &self.messenger,
            self.resend_interval,
            now,
        );
        self.rounds.push(Round::Accept {
            view: self.view,
            seq_no,
            value,
            msg_id,
            round,
        });
    }

    fn start_success(&mut self, seq_no: SeqNo, value: Value, msg_id: MsgId, now: Duration) {
        let request = Message::Success {
            seq_no,
            value,
            msg_id,
        };
        let round = QuorumRound::start(
            request,
            &self.membership,
            &self.messenger,
            self.resend_interval,
            now,
        );
        self.rounds.push(Round::Success {
            seq_no,
            msg_id,
            round,
        });
    }

    fn send_missing_successes<'a>(&self, missing: impl Iterator<Item = &'a SeqNo>, to: Member) {
        for seq_no in missing {
            if let Some((value, msg_id)) = self.decided.get(seq_no) {
                debug!(seq_no = %seq_no, to = %to, "resending missed success");
                self.messenger.send(
                    to,
                    &Message::Success {
                        seq_no: *seq_no,
                        value: value.clone(),
                        msg_id: *msg_id,
                    },
                );
            }
        }
    }

    fn collect_garbage(&mut self, seq_no: SeqNo, msg_id: MsgId) {
        debug!(seq_no = %seq_no, msg_id = %msg_id, "all members acknowledged, forgetting");
        self.decided.remove(&seq_no);
        self.proposals.remove(&seq_no);
        if self.circulating.remove(&msg_id) {
            self.completed.insert(msg_id);
        }
    }
}

impl std::fmt::Debug for LeaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderState")
            .field("me", &self.membership.me())
            .field("view", &self.view)
            .field("elected", &self.elected)
            .field("last_seq", &self.last_seq)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
