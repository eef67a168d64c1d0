//! Heartbeat-based failure detection.
//!
//! Every member probes every other member each `heartbeat_interval` with a
//! fire-and-forget [`Message::Heartbeat`]. Any probe received refreshes the
//! sender's last-seen time. On each probe tick, a member silent for longer
//! than `failure_timeout` is declared failed, once; a probe from a failed
//! member brings it back.
//!
//! ```text
//! M0                    M2 (leader)
//!  │<──── Heartbeat ─────│   every heartbeat_interval
//!  │                     │
//!  │          ✗ (M2 crashes)
//!  │   ... failure_timeout elapses ...
//!  │ → Failed(M2, alive = {M0, M1})
//!  │ → leader re-election if M1 is now the highest alive member
//! ```
//!
//! The detector only reports [`MembershipChange`]s; acting on them is the
//! node's job.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{info, trace};

use crate::membership::{Member, Membership};
use crate::message::Message;
use crate::transport::Messenger;

/// A liveness transition of one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    /// `member` has been silent for longer than the failure timeout.
    Failed {
        /// The silent member.
        member: Member,
        /// Members still considered alive, the local member included.
        alive: BTreeSet<Member>,
    },
    /// `member` was failed and has been heard from again.
    Recovered {
        /// The member heard from again.
        member: Member,
        /// Members considered alive after the transition.
        alive: BTreeSet<Member>,
    },
}

/// Per-member liveness tracker.
#[derive(Debug)]
pub struct FailureDetector {
    me: Member,
    last_seen: BTreeMap<Member, Duration>,
    failed: BTreeSet<Member>,
    heartbeat_interval: Duration,
    failure_timeout: Duration,
    last_probe: Option<Duration>,
}

impl FailureDetector {
    /// Create a detector that considers every member alive as of `now`.
    pub fn new(
        membership: &Membership,
        heartbeat_interval: Duration,
        failure_timeout: Duration,
        now: Duration,
    ) -> Self {
        let last_seen = membership
            .members()
            .iter()
            .filter(|m| **m != membership.me())
            .map(|m| (*m, now))
            .collect();
        Self {
            me: membership.me(),
            last_seen,
            failed: BTreeSet::new(),
            heartbeat_interval,
            failure_timeout,
            last_probe: None,
        }
    }

    /// Record a probe from `sender`.
    pub fn on_heartbeat(&mut self, sender: Member, now: Duration) -> Option<MembershipChange> {
        let seen = self.last_seen.get_mut(&sender)?;
        *seen = now;
        trace!(member = %sender, "heartbeat");

        if self.failed.remove(&sender) {
            info!(member = %sender, "member recovered");
            Some(MembershipChange::Recovered {
                member: sender,
                alive: self.alive(),
            })
        } else {
            None
        }
    }

    /// Probe everyone and check for timeouts, once per heartbeat interval.
    pub fn tick(&mut self, now: Duration, messenger: &Messenger) -> Vec<MembershipChange> {
        let due = self
            .last_probe
            .map_or(true, |last| now >= last + self.heartbeat_interval);
        if !due {
            return Vec::new();
        }
        self.last_probe = Some(now);

        messenger.send_all(self.last_seen.keys(), &Message::Heartbeat { sender: self.me });

        let newly_failed: Vec<Member> = self
            .last_seen
            .iter()
            .filter(|(m, seen)| {
                !self.failed.contains(m) && now.saturating_sub(**seen) > self.failure_timeout
            })
            .map(|(m, _)| *m)
            .collect();

        newly_failed
            .into_iter()
            .map(|member| {
                self.failed.insert(member);
                info!(member = %member, timeout = ?self.failure_timeout, "member failed");
                MembershipChange::Failed {
                    member,
                    alive: self.alive(),
                }
            })
            .collect()
    }

    /// Members currently considered alive, the local member included.
    pub fn alive(&self) -> BTreeSet<Member> {
        self.last_seen
            .keys()
            .filter(|m| !self.failed.contains(m))
            .copied()
            .chain(std::iter::once(self.me))
            .collect()
    }

    /// Whether `member` is currently considered failed.
    pub fn is_failed(&self, member: &Member) -> bool {
        self.failed.contains(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use std::net::SocketAddr;

    const INTERVAL: Duration = Duration::from_secs(1);
    const TIMEOUT: Duration = Duration::from_secs(3);

    fn member(port: u16) -> Member {
        Member::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn setup() -> (FailureDetector, Messenger, std::sync::Arc<RecordingTransport>) {
        let membership =
            Membership::new([member(0), member(1), member(2)], member(0)).expect("membership");
        let transport = RecordingTransport::new();
        let detector = FailureDetector::new(&membership, INTERVAL, TIMEOUT, Duration::ZERO);
        (detector, Messenger::new(transport.clone()), transport)
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_probes_other_members_every_interval() {
        let (mut fd, messenger, transport) = setup();

        fd.tick(Duration::ZERO, &messenger);
        let sent = transport.take();
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|(_, m)| *m == Message::Heartbeat { sender: member(0) }));

        // not due yet
        fd.tick(Duration::from_millis(500), &messenger);
        assert!(transport.take().is_empty());

        fd.tick(secs(1), &messenger);
        assert_eq!(transport.take().len(), 2);
    }

    #[test]
    fn test_silent_member_fails_once() {
        let (mut fd, messenger, _transport) = setup();

        for t in 0..=3 {
            fd.on_heartbeat(member(1), secs(t));
            assert!(fd.tick(secs(t), &messenger).is_empty(), "t={t}");
        }

        fd.on_heartbeat(member(1), secs(4));
        let changes = fd.tick(secs(4), &messenger);
        assert_eq!(
            changes,
            vec![MembershipChange::Failed {
                member: member(2),
                alive: [member(0), member(1)].into_iter().collect(),
            }]
        );
        assert!(fd.is_failed(&member(2)));

        // no repeated notification
        fd.on_heartbeat(member(1), secs(5));
        assert!(fd.tick(secs(5), &messenger).is_empty());
    }

    #[test]
    fn test_probe_from_failed_member_recovers_it() {
        let (mut fd, messenger, _transport) = setup();
        fd.on_heartbeat(member(1), secs(4));
        assert_eq!(fd.tick(secs(4), &messenger).len(), 1);

        let change = fd.on_heartbeat(member(2), secs(5)).expect("recovery");
        assert_eq!(
            change,
            MembershipChange::Recovered {
                member: member(2),
                alive: [member(0), member(1), member(2)].into_iter().collect(),
            }
        );
        assert!(fd.on_heartbeat(member(2), secs(6)).is_none());
    }

    #[test]
    fn test_unknown_sender_ignored() {
        let (mut fd, _messenger, _transport) = setup();
        assert!(fd.on_heartbeat(member(99), secs(1)).is_none());
        assert_eq!(fd.alive().len(), 3);
    }
}
