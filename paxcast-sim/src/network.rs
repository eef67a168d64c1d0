//! # Simulated datagram network
//!
//! An in-memory network with per-datagram latency, loss, duplication,
//! partitions and crashed members. Every random choice comes from one
//! `ChaCha8Rng`, so a seed replays the same schedule.
//!
//! | Fault | Config field | `reliable()` | `lossy()` |
//! |-------|--------------|--------------|-----------|
//! | Latency | `min_latency`..=`max_latency` | 1-5 ms | 1-20 ms |
//! | Loss | `drop_probability` | 0 | 10% |
//! | Duplication | `duplicate_probability` | 0 | 5% |
//! | Partition | [`SimNetwork::partition`] | manual | manual |
//! | Crash | [`SimNetwork::kill`] | manual | manual |

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use paxcast::{Member, Transport, TransportError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Fault parameters of a [`SimNetwork`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Smallest one-way latency.
    pub min_latency: Duration,
    /// Largest one-way latency.
    pub max_latency: Duration,
    /// Chance that a datagram is lost.
    pub drop_probability: f64,
    /// Chance that a delivered datagram arrives twice.
    pub duplicate_probability: f64,
}

impl NetworkConfig {
    /// No loss, no duplication, small latencies.
    pub fn reliable() -> Self {
        Self {
            min_latency: Duration::from_millis(1),
            max_latency: Duration::from_millis(5),
            drop_probability: 0.0,
            duplicate_probability: 0.0,
        }
    }

    /// Loses and duplicates datagrams, with wider latency spread so that
    /// reordering is common.
    pub fn lossy() -> Self {
        Self {
            min_latency: Duration::from_millis(1),
            max_latency: Duration::from_millis(20),
            drop_probability: 0.1,
            duplicate_probability: 0.05,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::reliable()
    }
}

/// Counters over the lifetime of a network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Datagrams handed to the network.
    pub sent: u64,
    /// Datagrams lost to random drops, partitions or crashed members.
    pub dropped: u64,
    /// Extra copies injected.
    pub duplicated: u64,
    /// Datagrams handed to a receiver.
    pub delivered: u64,
}

#[derive(Debug)]
struct InFlight {
    deliver_at: Duration,
    id: u64,
    from: Member,
    to: Member,
    bytes: Vec<u8>,
}

// Min-heap on (deliver_at, id): earliest first, ties in send order.
impl Ord for InFlight {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deliver_at, other.id).cmp(&(self.deliver_at, self.id))
    }
}

impl PartialOrd for InFlight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for InFlight {
    fn eq(&self, other: &Self) -> bool {
        self.deliver_at == other.deliver_at && self.id == other.id
    }
}

impl Eq for InFlight {}

#[derive(Debug)]
struct NetworkState {
    config: NetworkConfig,
    rng: ChaCha8Rng,
    now: Duration,
    next_id: u64,
    in_flight: BinaryHeap<InFlight>,
    killed: BTreeSet<Member>,
    partitions: BTreeSet<(Member, Member)>,
    stats: NetworkStats,
}

impl NetworkState {
    fn is_blocked(&self, from: Member, to: Member) -> bool {
        self.killed.contains(&from)
            || self.killed.contains(&to)
            || self.partitions.contains(&(from, to))
    }

    fn latency(&mut self) -> Duration {
        let (min, max) = (self.config.min_latency, self.config.max_latency);
        if max <= min {
            return min;
        }
        self.rng.random_range(min..=max)
    }

    fn enqueue(&mut self, from: Member, to: Member, bytes: Vec<u8>) {
        let deliver_at = self.now + self.latency();
        let id = self.next_id;
        self.next_id += 1;
        self.in_flight.push(InFlight {
            deliver_at,
            id,
            from,
            to,
            bytes,
        });
    }

    fn submit(&mut self, from: Member, to: Member, bytes: &[u8]) {
        self.stats.sent += 1;
        if self.is_blocked(from, to) || self.rng.random_bool(self.config.drop_probability) {
            self.stats.dropped += 1;
            trace!(%from, %to, "datagram dropped");
            return;
        }
        if self.rng.random_bool(self.config.duplicate_probability) {
            self.stats.duplicated += 1;
            self.enqueue(from, to, bytes.to_vec());
        }
        self.enqueue(from, to, bytes.to_vec());
    }
}

/// Shared handle to a simulated network.
#[derive(Debug, Clone)]
pub struct SimNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl SimNetwork {
    /// Create a network whose randomness is fixed by `seed`.
    pub fn new(seed: u64, config: NetworkConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                config,
                rng: ChaCha8Rng::seed_from_u64(seed),
                now: Duration::ZERO,
                next_id: 0,
                in_flight: BinaryHeap::new(),
                killed: BTreeSet::new(),
                partitions: BTreeSet::new(),
                stats: NetworkStats::default(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A transport that sends as `from`.
    pub fn transport(&self, from: Member) -> SimTransport {
        SimTransport {
            network: self.clone(),
            from,
        }
    }

    /// Set the network clock. Sends are scheduled relative to it.
    pub fn advance_to(&self, now: Duration) {
        let mut state = self.state();
        if now > state.now {
            state.now = now;
        }
    }

    /// Delivery time of the earliest in-flight datagram.
    pub fn next_delivery_time(&self) -> Option<Duration> {
        self.state().in_flight.peek().map(|d| d.deliver_at)
    }

    /// Pop the earliest datagram due at or before `now`.
    ///
    /// Datagrams whose path was cut while in flight are discarded.
    pub fn pop_due(&self, now: Duration) -> Option<(Member, Vec<u8>)> {
        let mut state = self.state();
        loop {
            if state.in_flight.peek()?.deliver_at > now {
                return None;
            }
            let datagram = state.in_flight.pop()?;
            if state.is_blocked(datagram.from, datagram.to) {
                state.stats.dropped += 1;
                continue;
            }
            state.stats.delivered += 1;
            return Some((datagram.to, datagram.bytes));
        }
    }

    /// Number of datagrams in flight.
    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    /// Crash `member`: nothing it sends or is sent arrives any more.
    pub fn kill(&self, member: Member) {
        self.state().killed.insert(member);
    }

    /// Whether `member` has been crashed.
    pub fn is_killed(&self, member: Member) -> bool {
        self.state().killed.contains(&member)
    }

    /// Block traffic between `a` and `b` in both directions.
    pub fn partition(&self, a: Member, b: Member) {
        let mut state = self.state();
        state.partitions.insert((a, b));
        state.partitions.insert((b, a));
    }

    /// Restore traffic between `a` and `b`.
    pub fn heal(&self, a: Member, b: Member) {
        let mut state = self.state();
        state.partitions.remove(&(a, b));
        state.partitions.remove(&(b, a));
    }

    /// Remove every partition.
    pub fn heal_all(&self) {
        self.state().partitions.clear();
    }

    /// Counters so far.
    pub fn stats(&self) -> NetworkStats {
        self.state().stats
    }
}

/// One member's sending side of a [`SimNetwork`].
#[derive(Debug, Clone)]
pub struct SimTransport {
    network: SimNetwork,
    from: Member,
}

impl Transport for SimTransport {
    fn send_to(&self, to: Member, bytes: &[u8]) -> Result<(), TransportError> {
        self.network.state().submit(self.from, to, bytes);
        Ok(())
    }
}
