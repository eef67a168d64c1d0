//! # Paxcast simulation harness
//!
//! Deterministic simulation of paxcast groups. A whole cluster runs in one
//! thread over a seeded in-memory network and a virtual clock, so a failing
//! seed replays exactly.
//!
//! ## Core Components
//!
//! - [`SimNetwork`]: latency, loss, duplication, partitions and crashes
//! - [`SimCluster`]: N nodes, the clock, client workloads and fault injection
//! - [`invariants`]: agreement, total order and exactly-once checks
//!
//! ## Quick Start
//!
//! ```
//! use std::time::Duration;
//! use paxcast_sim::{NetworkConfig, SimCluster};
//!
//! let mut cluster = SimCluster::new(3, 42, NetworkConfig::reliable()).expect("cluster");
//! cluster.run_for(Duration::from_secs(1));
//! cluster.broadcast(0, b"hello".to_vec());
//! assert!(cluster.run_until_quiet(Duration::from_secs(30)));
//! cluster.check_invariants().expect("safe");
//! ```
//!
//! ## Multi-Seed Testing
//!
//! Scenarios run the same workload across many seeds. Debugging a failing
//! seed means running that one seed with `RUST_LOG=paxcast=debug`.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Cluster driver under a virtual clock.
pub mod cluster;

/// Safety checks over delivery logs.
pub mod invariants;

/// Seeded in-memory datagram network.
pub mod network;

pub use cluster::{SimCluster, sim_member};
pub use invariants::{DeliveryLog, InvariantViolation};
pub use network::{NetworkConfig, NetworkStats, SimNetwork, SimTransport};
