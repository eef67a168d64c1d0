//! Time source abstraction.
//!
//! The protocol state machines never read a clock: every handler takes the
//! current time as a `Duration` since an arbitrary epoch. The runtime gets
//! that value from a [`TimeProvider`], which is either wall-clock
//! ([`TokioTimeProvider`]) or manually driven ([`ManualClock`]) for
//! deterministic tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

/// Provider trait for time operations.
///
/// - `now()`: monotonic time since the provider's epoch. Used for resend,
///   heartbeat and reassembly bookkeeping.
/// - `sleep()`: wait for `duration` of this provider's time.
#[async_trait]
pub trait TimeProvider: Clone + Send + Sync + 'static {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Current time since the provider's epoch.
    fn now(&self) -> Duration;
}

/// Real time provider using Tokio's time facilities.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: tokio::time::Instant,
}

impl TokioTimeProvider {
    /// Create a provider whose epoch is now.
    pub fn new() -> Self {
        Self {
            start_time: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Manually driven clock.
///
/// Time only moves through [`ManualClock::advance`] or `sleep`, which
/// advances the clock by the requested amount and yields.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// A clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    /// Jump to `to`. Never moves backwards.
    pub fn set(&self, to: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = (*now).max(to);
    }
}

#[async_trait]
impl TimeProvider for ManualClock {
    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }

    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
