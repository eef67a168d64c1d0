//! Simulation test infrastructure for paxcast.
//!
//! Every scenario builds a [`SimCluster`](paxcast_sim::SimCluster), injects a
//! workload and faults, and checks the safety invariants at the end:
//!
//! ```text
//! ┌──────────┐  ┌──────────┐  ┌──────────┐
//! │ member 0 │  │ member 1 │  │ member 2 │   ← member 2 is the default leader
//! └────┬─────┘  └────┬─────┘  └────┬─────┘
//!      └─────────────┼─────────────┘
//!              SimNetwork (seeded)
//! ```

#![allow(dead_code)]

#[cfg(test)]
pub mod test_scenarios;
pub mod workloads;
