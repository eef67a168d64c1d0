//! Timing and sizing knobs for a group.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::PaxcastError;

/// Configuration shared by every member of a group.
///
/// ## Tuning Guidelines
///
/// - `failure_timeout` must exceed `heartbeat_interval`; three intervals
///   tolerates two lost probes before a member is declared failed.
/// - `tick_interval` bounds the resolution of every other timer. Keep it
///   well below `resend_interval`.
/// - `fragment_size` must fit in one datagram together with the fragment
///   header and the encoded message envelope.
/// - `max_message_size` caps what a receiver reassembles. Every member must
///   use a value at least as large as the biggest encoded message the group
///   sends, or that message is never delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// How long a quorum round waits before resending to silent members.
    pub resend_interval: Duration,
    /// How often liveness probes are sent.
    pub heartbeat_interval: Duration,
    /// Silence after which a member is declared failed.
    pub failure_timeout: Duration,
    /// Period of the runtime timer driving resends and probes.
    pub tick_interval: Duration,
    /// How long a client broadcast waits before resending its request.
    pub broadcast_wait: Duration,
    /// Largest payload slice carried by one datagram.
    pub fragment_size: usize,
    /// How many garbage-collected client message ids the leader remembers.
    pub completed_window: usize,
    /// Idle time after which a partially reassembled payload is dropped.
    pub reassembly_timeout: Duration,
    /// Largest encoded message a receiver reassembles.
    pub max_message_size: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            failure_timeout: Duration::from_secs(3),
            tick_interval: Duration::from_millis(100),
            broadcast_wait: Duration::from_secs(1),
            fragment_size: 64_000,
            completed_window: 10_000,
            reassembly_timeout: Duration::from_secs(30),
            max_message_size: 64 * 1024 * 1024,
        }
    }
}

impl GroupConfig {
    /// Shorter timings for virtual-time simulation.
    pub fn for_simulation() -> Self {
        Self {
            resend_interval: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(100),
            failure_timeout: Duration::from_millis(300),
            tick_interval: Duration::from_millis(10),
            broadcast_wait: Duration::from_millis(200),
            fragment_size: 1_024,
            completed_window: 1_000,
            reassembly_timeout: Duration::from_secs(5),
            max_message_size: 4 * 1024 * 1024,
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), PaxcastError> {
        if self.failure_timeout <= self.heartbeat_interval {
            return Err(PaxcastError::InvalidConfig(format!(
                "failure_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.failure_timeout, self.heartbeat_interval
            )));
        }
        if self.tick_interval.is_zero() {
            return Err(PaxcastError::InvalidConfig(
                "tick_interval must be non-zero".into(),
            ));
        }
        if self.fragment_size == 0 {
            return Err(PaxcastError::InvalidConfig(
                "fragment_size must be non-zero".into(),
            ));
        }
        if self.max_message_size < self.fragment_size {
            return Err(PaxcastError::InvalidConfig(format!(
                "max_message_size ({}) must be at least fragment_size ({})",
                self.max_message_size, self.fragment_size
            )));
        }
        Ok(())
    }

    /// Most fragments one message may declare, derived from
    /// `max_message_size` and `fragment_size`.
    pub fn max_fragments(&self) -> u32 {
        let count = self.max_message_size.div_ceil(self.fragment_size.max(1)).max(1);
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}
