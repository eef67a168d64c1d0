//! Simulation scenarios.
//!
//! ## Test Organization
//!
//! - happy path: the three-member `Hello` exchange on a reliable network
//! - lossy: concurrent broadcasts over many seeds with loss and duplication
//! - crashes: leader failure with a half-decided sequence number, and a
//!   five-member group losing two leaders in a row
//! - competing leaders: a partitioned old leader keeps believing it leads
//! - fragmentation: payloads several fragments long through the full stack

use std::time::Duration;

use paxcast::{GroupConfig, SeqNo, Value, ViewNumber};
use paxcast_sim::{NetworkConfig, SimCluster};

use super::workloads::{
    WORKLOAD_LIMIT, concurrent_broadcasts, elected_cluster, init_tracing, patient_config,
    sequential_broadcasts, settle_and_check,
};

// ============================================================================
// Happy path
// ============================================================================

#[test]
fn test_hello_three_members() {
    init_tracing();
    let mut cluster = elected_cluster(1, NetworkConfig::reliable(), GroupConfig::for_simulation());
    assert_eq!(cluster.elected_leader(), Some(2));
    assert_eq!(cluster.node(2).leader().view(), ViewNumber(5));

    let id = cluster.broadcast(0, b"Hello".to_vec());
    assert!(cluster.run_until_quiet(WORKLOAD_LIMIT));
    assert_eq!(cluster.completed(), &[id]);

    cluster.run_for(Duration::from_secs(1));
    for i in 0..3 {
        assert_eq!(cluster.deliveries(i), vec![(SeqNo(1), b"Hello".to_vec())]);
    }

    // Every round ended and the decided value was garbage collected.
    let stats = cluster.node(2).leader().stats();
    assert_eq!(stats.accepts + stats.successes + stats.elections, 0);
    assert_eq!((stats.proposals, stats.decided, stats.circulating), (0, 0, 0));
}

#[test]
fn test_same_seed_replays() {
    let run = || {
        let mut cluster = elected_cluster(7, NetworkConfig::lossy(), patient_config());
        concurrent_broadcasts(&mut cluster, "replay", 6);
        assert!(cluster.run_until_quiet(WORKLOAD_LIMIT));
        cluster.run_for(Duration::from_secs(2));
        (cluster.delivery_logs(), cluster.network().stats(), cluster.now())
    };
    assert_eq!(run(), run());
}

// ============================================================================
// Lossy network
// ============================================================================

#[test]
fn test_lossy_network_many_seeds() {
    init_tracing();
    for seed in 0..20 {
        let mut cluster = elected_cluster(seed, NetworkConfig::lossy(), patient_config());
        let expected = concurrent_broadcasts(&mut cluster, "lossy", 12);

        assert!(
            cluster.run_until_quiet(WORKLOAD_LIMIT),
            "seed {seed}: {} broadcasts still pending",
            cluster.pending_broadcasts()
        );
        assert_eq!(cluster.completed().len(), 12, "seed {seed}");
        settle_and_check(&mut cluster, &expected);

        let stats = cluster.network().stats();
        assert!(stats.dropped > 0 && stats.duplicated > 0, "seed {seed}: {stats:?}");
        for i in 0..3 {
            assert_eq!(cluster.deliveries(i).len(), 12, "seed {seed}, member {i}");
        }
    }
}

// ============================================================================
// Crashes
// ============================================================================

#[test]
fn test_leader_crash_redrives_half_decided_value() {
    init_tracing();
    for seed in 0..5 {
        let mut cluster =
            elected_cluster(seed, NetworkConfig::reliable(), GroupConfig::for_simulation());
        let mut expected = sequential_broadcasts(&mut cluster, 0, "before", 4);

        // Crash the leader once both followers hold an Accept for seq 5.
        cluster.broadcast(0, b"five".to_vec());
        let followers_accepted = |c: &SimCluster| {
            (0..2).all(|i| c.node(i).acceptor().accepted().contains_key(&SeqNo(5)))
        };
        assert!(cluster.run_until(Duration::from_secs(1), followers_accepted));
        let accepted = &cluster.node(0).acceptor().accepted()[&SeqNo(5)];
        assert_eq!(accepted.value, Value::App(b"five".to_vec()));
        cluster.kill(2);

        // The next member in rank takes over with its own view.
        assert!(
            cluster.run_until(Duration::from_secs(5), |c| c.elected_leader() == Some(1)),
            "seed {seed}: member 1 never took over"
        );
        assert_eq!(cluster.node(1).leader().view(), ViewNumber(7));
        assert_eq!(cluster.node(0).acceptor().leader(), cluster.members()[1]);

        assert!(cluster.run_until_quiet(WORKLOAD_LIMIT), "seed {seed}");
        cluster.run_for(Duration::from_secs(1));
        for i in 0..2 {
            let log = cluster.deliveries(i);
            assert_eq!(log.len(), 5, "seed {seed}, member {i}");
            assert_eq!(log[4], (SeqNo(5), b"five".to_vec()));
        }
        expected.push(b"five".to_vec());

        // The new leader keeps ordering after the recovered value.
        expected.extend(sequential_broadcasts(&mut cluster, 1, "after", 2));
        settle_and_check(&mut cluster, &expected);
        assert_eq!(cluster.deliveries(0).last().map(|(s, _)| *s), Some(SeqNo(7)));
    }
}

#[test]
fn test_five_members_lose_two_leaders() {
    init_tracing();
    let mut cluster = SimCluster::new(5, 11, NetworkConfig::reliable()).expect("cluster");
    assert!(cluster.run_until(Duration::from_secs(5), |c| c.elected_leader() == Some(4)));
    assert_eq!(cluster.node(4).leader().view(), ViewNumber(9));
    let mut expected = concurrent_broadcasts(&mut cluster, "first", 5);
    assert!(cluster.run_until_quiet(WORKLOAD_LIMIT));

    cluster.kill(4);
    assert!(cluster.run_until(Duration::from_secs(5), |c| c.elected_leader() == Some(3)));
    assert_eq!(cluster.node(3).leader().view(), ViewNumber(13));
    expected.extend(concurrent_broadcasts(&mut cluster, "second", 4));
    assert!(cluster.run_until_quiet(WORKLOAD_LIMIT));

    cluster.kill(3);
    assert!(cluster.run_until(Duration::from_secs(5), |c| c.elected_leader() == Some(2)));
    assert_eq!(cluster.node(2).leader().view(), ViewNumber(17));
    expected.extend(concurrent_broadcasts(&mut cluster, "third", 3));
    assert!(cluster.run_until_quiet(WORKLOAD_LIMIT));

    settle_and_check(&mut cluster, &expected);
}

// ============================================================================
// Competing leaders
// ============================================================================

#[test]
fn test_partitioned_old_leader_is_superseded() {
    init_tracing();
    for seed in 0..5 {
        let mut cluster =
            elected_cluster(seed, NetworkConfig::reliable(), GroupConfig::for_simulation());
        let (m1, m2) = (cluster.members()[1], cluster.members()[2]);
        let mut expected = sequential_broadcasts(&mut cluster, 0, "before", 2);

        // Member 1 loses sight of the leader and takes over; member 2 never
        // hears the new view and keeps believing it leads view 5.
        cluster.network().partition(m1, m2);
        assert!(
            cluster.run_until(Duration::from_secs(5), |c| c.node(1).leader().is_elected()),
            "seed {seed}"
        );
        assert_eq!(cluster.node(1).leader().view(), ViewNumber(7));
        assert!(cluster.node(2).leader().is_elected());
        assert_eq!(cluster.node(2).leader().view(), ViewNumber(5));

        let stale = cluster.broadcast(2, b"via-stale".to_vec());
        let fresh = cluster.broadcast(0, b"via-new".to_vec());
        cluster.run_for(Duration::from_secs(3));
        assert!(cluster.completed().contains(&fresh), "seed {seed}");
        assert!(!cluster.completed().contains(&stale), "seed {seed}");
        assert_eq!(cluster.node(2).leader().proposal(SeqNo(3)), None);

        // Once the partition heals the old leader steps down and its client
        // reaches the new one.
        cluster.network().heal(m1, m2);
        assert!(cluster.run_until_quiet(WORKLOAD_LIMIT), "seed {seed}");
        assert!(!cluster.node(2).leader().is_elected());
        assert_eq!(cluster.node(2).acceptor().leader(), m1);

        expected.extend([b"via-stale".to_vec(), b"via-new".to_vec()]);
        settle_and_check(&mut cluster, &expected);
        assert_eq!(cluster.deliveries(2)[2], (SeqNo(3), b"via-new".to_vec()));
    }
}

// ============================================================================
// Fragmentation
// ============================================================================

#[test]
fn test_oversized_payloads_cross_fragmentation() {
    init_tracing();
    let network = NetworkConfig {
        min_latency: Duration::from_millis(1),
        max_latency: Duration::from_millis(20),
        drop_probability: 0.02,
        duplicate_probability: 0.1,
    };
    for seed in 0..5 {
        let mut cluster = elected_cluster(seed, network.clone(), patient_config());
        let payloads: Vec<Vec<u8>> = (1..=3usize)
            .map(|k| (0..8_000usize).map(|b| (b * k % 251) as u8).collect())
            .collect();
        for (i, p) in payloads.iter().enumerate() {
            cluster.broadcast(i, p.clone());
        }

        assert!(cluster.run_until_quiet(WORKLOAD_LIMIT), "seed {seed}");
        settle_and_check(&mut cluster, &payloads);
        for i in 0..3 {
            assert_eq!(cluster.deliveries(i).len(), 3, "seed {seed}, member {i}");
        }
    }
}
