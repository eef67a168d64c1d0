//! Shared setup and workloads for the scenarios.

use std::time::Duration;

use paxcast::GroupConfig;
use paxcast_sim::invariants::check_all_delivered;
use paxcast_sim::{NetworkConfig, SimCluster};

/// Virtual time allowed for the startup election.
pub const ELECTION_TIME: Duration = Duration::from_secs(1);

/// Upper bound for any workload to complete.
pub const WORKLOAD_LIMIT: Duration = Duration::from_secs(120);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Simulation timings with a failure timeout long enough that lost
/// heartbeats on a lossy network never look like a crash.
pub fn patient_config() -> GroupConfig {
    GroupConfig {
        failure_timeout: Duration::from_secs(2),
        ..GroupConfig::for_simulation()
    }
}

/// A three-member cluster whose startup election has finished.
pub fn elected_cluster(seed: u64, network: NetworkConfig, config: GroupConfig) -> SimCluster {
    let mut cluster = SimCluster::with_config(3, seed, network, config).expect("cluster");
    assert!(
        cluster.run_until(ELECTION_TIME * 10, |c| c.elected_leader().is_some()),
        "seed {seed}: no leader elected"
    );
    cluster
}

pub fn payload(tag: &str, i: usize) -> Vec<u8> {
    format!("{tag}-{i}").into_bytes()
}

/// Start `count` broadcasts spread round-robin over the members, all at once.
pub fn concurrent_broadcasts(cluster: &mut SimCluster, tag: &str, count: usize) -> Vec<Vec<u8>> {
    let size = cluster.members().len();
    (0..count)
        .map(|i| {
            let p = payload(tag, i);
            cluster.broadcast(i % size, p.clone());
            p
        })
        .collect()
}

/// Broadcast from `from`, one at a time, each waiting for completion.
pub fn sequential_broadcasts(
    cluster: &mut SimCluster,
    from: usize,
    tag: &str,
    count: usize,
) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let p = payload(tag, i);
            cluster.broadcast(from, p.clone());
            assert!(
                cluster.run_until_quiet(WORKLOAD_LIMIT),
                "broadcast {i} from {from} never completed"
            );
            p
        })
        .collect()
}

/// Let success rounds finish, then check every safety property and that the
/// live members delivered everything in `expected`.
pub fn settle_and_check(cluster: &mut SimCluster, expected: &[Vec<u8>]) {
    cluster.run_for(Duration::from_secs(5));
    cluster.check_invariants().expect("safety invariants");

    let live: Vec<_> = cluster
        .delivery_logs()
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !cluster.is_killed(*i))
        .map(|(_, log)| log)
        .collect();
    check_all_delivered(&live, expected).expect("every live member delivered everything");
}
