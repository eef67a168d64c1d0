//! Generic majority-then-all request/response round.
//!
//! Elections, accept rounds and success rounds share one shape: send a
//! request to every member, collect one response per sender, react when a
//! majority has answered and again when everyone has, and resend to the
//! silent members on a fixed interval until the owner finishes the round.
//!
//! [`QuorumRound`] holds that bookkeeping. Reactions live with the owner:
//! [`QuorumRound::record`] reports a [`RoundProgress`] and the owner applies
//! its hooks.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use crate::membership::{Member, Membership};
use crate::message::Message;
use crate::transport::Messenger;

/// Thresholds crossed by a single recorded response.
///
/// Each flag is set only on the response that crosses the threshold for the
/// first time. With a single-member group both flags fire together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundProgress {
    /// A majority has just been reached.
    pub quorum_reached: bool,
    /// Every member has just replied.
    pub all_replied: bool,
}

/// One in-flight request/response round.
///
/// `R` is whatever the owner wants to keep per response.
#[derive(Debug)]
pub struct QuorumRound<R> {
    request: Message,
    members: Vec<Member>,
    responses: BTreeMap<Member, R>,
    resend_interval: Duration,
    last_resend: Duration,
    quorum_reached: bool,
    all_replied: bool,
    finished: bool,
}

impl<R> QuorumRound<R> {
    /// Start a round: send `request` to every member.
    pub fn start(
        request: Message,
        membership: &Membership,
        messenger: &Messenger,
        resend_interval: Duration,
        now: Duration,
    ) -> Self {
        messenger.send_all(membership.members(), &request);
        Self {
            request,
            members: membership.members().to_vec(),
            responses: BTreeMap::new(),
            resend_interval,
            last_resend: now,
            quorum_reached: false,
            all_replied: false,
            finished: false,
        }
    }

    /// Record `sender`'s response, replacing any earlier one.
    ///
    /// Responses from outside the membership are ignored.
    pub fn record(&mut self, sender: Member, response: R) -> RoundProgress {
        if self.finished || !self.members.contains(&sender) {
            return RoundProgress::default();
        }
        self.responses.insert(sender, response);

        let count = self.responses.len();
        let mut progress = RoundProgress::default();
        if !self.quorum_reached && count > self.members.len() / 2 {
            self.quorum_reached = true;
            progress.quorum_reached = true;
        }
        if !self.all_replied && count == self.members.len() {
            self.all_replied = true;
            progress.all_replied = true;
        }
        progress
    }

    /// Resend the request to silent members once the interval has elapsed.
    ///
    /// Returns how many members were re-sent to.
    pub fn tick(&mut self, now: Duration, messenger: &Messenger) -> usize {
        if self.finished || now <= self.last_resend + self.resend_interval {
            return 0;
        }
        self.last_resend = now;

        let silent: Vec<Member> = self
            .members
            .iter()
            .filter(|m| !self.responses.contains_key(m))
            .copied()
            .collect();
        if !silent.is_empty() {
            debug!(
                kind = self.request.kind(),
                silent = silent.len(),
                "resending to non-responders"
            );
            messenger.send_all(&silent, &self.request);
        }
        silent.len()
    }

    /// Mark the round as done. A finished round ignores further input.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    /// Whether the round is done.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether a majority has answered.
    pub fn is_quorum_reached(&self) -> bool {
        self.quorum_reached
    }

    /// Whether every member has answered.
    pub fn is_all_replied(&self) -> bool {
        self.all_replied
    }

    /// The request this round circulates.
    pub fn request(&self) -> &Message {
        &self.request
    }

    /// Responses received so far, keyed by sender.
    pub fn responses(&self) -> &BTreeMap<Member, R> {
        &self.responses
    }
}
