//! # Simulated cluster
//!
//! [`SimCluster`] runs N [`Node`]s over one [`SimNetwork`] under a virtual
//! clock. There is no async runtime: the driver pops the next event (a due
//! datagram or the periodic tick), advances the clock to it, and hands it to
//! the node. Runs are fully deterministic for a seed.
//!
//! Client workloads mirror `Group::broadcast`: a broadcast is started on a
//! node and resent every `broadcast_wait` until the node's waiting room
//! reports it complete.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use paxcast::{GroupConfig, Member, Membership, MsgId, Node, PaxcastError, SeqNo, Value};
use tracing::{debug, info};

use crate::invariants::{self, DeliveryLog, InvariantViolation};
use crate::network::{NetworkConfig, SimNetwork};

type SharedLog = Arc<Mutex<DeliveryLog>>;

#[derive(Debug)]
struct PendingBroadcast {
    node: usize,
    value: Value,
    msg_id: MsgId,
    next_resend: Duration,
}

/// N members driven by a virtual clock.
pub struct SimCluster {
    network: SimNetwork,
    config: GroupConfig,
    members: Vec<Member>,
    nodes: Vec<Node>,
    logs: Vec<SharedLog>,
    pending: Vec<PendingBroadcast>,
    completed: Vec<MsgId>,
    now: Duration,
    next_tick: Duration,
}

/// Address of the `index`th simulated member.
pub fn sim_member(index: usize) -> Member {
    let port = 7000u16.saturating_add(u16::try_from(index).unwrap_or(u16::MAX));
    Member::new(SocketAddr::from(([10, 0, 0, 1], port)))
}

impl SimCluster {
    /// Start `size` members with the simulation timings.
    pub fn new(size: usize, seed: u64, network: NetworkConfig) -> Result<Self, PaxcastError> {
        Self::with_config(size, seed, network, GroupConfig::for_simulation())
    }

    /// Start `size` members with explicit group timings.
    pub fn with_config(
        size: usize,
        seed: u64,
        network: NetworkConfig,
        config: GroupConfig,
    ) -> Result<Self, PaxcastError> {
        let network = SimNetwork::new(seed, network);
        let members: Vec<Member> = (0..size).map(sim_member).collect();

        let mut nodes = Vec::with_capacity(size);
        let mut logs = Vec::with_capacity(size);
        for (index, &me) in members.iter().enumerate() {
            let membership = Membership::new(members.iter().copied(), me)?;
            let log: SharedLog = Arc::default();
            let sink = log.clone();
            let app = move |seq_no: SeqNo, payload: Vec<u8>| {
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((seq_no, payload));
            };
            let node = Node::seeded(
                membership,
                &config,
                Arc::new(network.transport(me)),
                Box::new(app),
                Duration::ZERO,
                seed.wrapping_add(index as u64),
            )?;
            nodes.push(node);
            logs.push(log);
        }
        info!(size, seed, "simulated cluster started");

        Ok(Self {
            network,
            next_tick: config.tick_interval,
            config,
            members,
            nodes,
            logs,
            pending: Vec::new(),
            completed: Vec::new(),
            now: Duration::ZERO,
        })
    }

    // ========================================================================
    // Driving
    // ========================================================================

    /// Time of the next event: a due datagram or the next tick.
    fn next_event_time(&self) -> Duration {
        match self.network.next_delivery_time() {
            Some(at) if at < self.next_tick => at,
            _ => self.next_tick,
        }
    }

    /// Advance to the next event and handle it.
    pub fn step(&mut self) {
        let at = self.next_event_time().max(self.now);
        self.now = at;
        self.network.advance_to(at);

        if let Some((to, frame)) = self.network.pop_due(at) {
            if let Some(index) = self.index_of(to) {
                self.nodes[index].handle_datagram(&frame, at);
            }
            return;
        }

        for (index, node) in self.nodes.iter_mut().enumerate() {
            if !self.network.is_killed(self.members[index]) {
                node.tick(at);
            }
        }
        self.drive_clients();
        self.next_tick = at + self.config.tick_interval;
    }

    /// Run every event up to `now + duration`.
    pub fn run_for(&mut self, duration: Duration) {
        let end = self.now + duration;
        while self.next_event_time() <= end {
            self.step();
        }
        self.now = end;
        self.network.advance_to(end);
    }

    /// Step until `done` holds or `limit` of virtual time passes.
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&SimCluster) -> bool) -> bool {
        let deadline = self.now + limit;
        while self.now <= deadline {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// Run until every client broadcast has completed.
    pub fn run_until_quiet(&mut self, limit: Duration) -> bool {
        self.run_until(limit, |c| c.pending.is_empty())
    }

    fn drive_clients(&mut self) {
        let now = self.now;
        let wait = self.config.broadcast_wait;
        let nodes = &mut self.nodes;
        let completed = &mut self.completed;
        self.pending.retain_mut(|p| {
            let node = &mut nodes[p.node];
            if node.waiting_room().try_complete(p.msg_id) {
                debug!(msg_id = %p.msg_id, member = %node.me(), "client broadcast complete");
                completed.push(p.msg_id);
                return false;
            }
            if now >= p.next_resend {
                node.resend_broadcast(p.value.clone(), p.msg_id);
                p.next_resend = now + wait;
            }
            true
        });
    }

    // ========================================================================
    // Workload and faults
    // ========================================================================

    /// Start a client broadcast of `payload` on node `index`.
    pub fn broadcast(&mut self, index: usize, payload: impl Into<Vec<u8>>) -> MsgId {
        let value = Value::App(payload.into());
        let msg_id = self.nodes[index].begin_broadcast(value.clone());
        self.pending.push(PendingBroadcast {
            node: index,
            value,
            msg_id,
            next_resend: self.now + self.config.broadcast_wait,
        });
        msg_id
    }

    /// Crash node `index`. Its pending broadcasts are abandoned.
    pub fn kill(&mut self, index: usize) {
        let member = self.members[index];
        info!(%member, at = ?self.now, "killing member");
        self.network.kill(member);
        self.pending.retain(|p| p.node != index);
    }

    /// Whether node `index` has been crashed.
    pub fn is_killed(&self, index: usize) -> bool {
        self.network.is_killed(self.members[index])
    }

    // ========================================================================
    // Observation
    // ========================================================================

    fn index_of(&self, member: Member) -> Option<usize> {
        self.members.iter().position(|m| *m == member)
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// The member addresses, in roster order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Node `index`.
    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    /// The shared network, for partitions and stats.
    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    /// Index of the live node that is elected in the highest view.
    pub fn elected_leader(&self) -> Option<usize> {
        (0..self.nodes.len())
            .filter(|&i| !self.is_killed(i) && self.nodes[i].leader().is_elected())
            .max_by_key(|&i| self.nodes[i].leader().view())
    }

    /// What node `index` has delivered so far.
    pub fn deliveries(&self, index: usize) -> DeliveryLog {
        self.logs[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every node's deliveries, killed nodes included.
    pub fn delivery_logs(&self) -> Vec<(Member, DeliveryLog)> {
        (0..self.nodes.len())
            .map(|i| (self.members[i], self.deliveries(i)))
            .collect()
    }

    /// Client broadcasts still waiting for their Success.
    pub fn pending_broadcasts(&self) -> usize {
        self.pending.len()
    }

    /// Client broadcasts completed so far, in completion order.
    pub fn completed(&self) -> &[MsgId] {
        &self.completed
    }

    /// Check agreement, total order and exactly-once delivery.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let logs = self.delivery_logs();
        invariants::check_agreement(&logs)?;
        invariants::check_total_order(&logs)?;
        invariants::check_exactly_once(&logs)
    }
}

impl std::fmt::Debug for SimCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimCluster")
            .field("members", &self.members)
            .field("now", &self.now)
            .field("pending", &self.pending.len())
            .field("in_flight", &self.network.in_flight())
            .finish()
    }
}
