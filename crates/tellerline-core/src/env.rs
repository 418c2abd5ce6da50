//! Environment abstraction for deterministic testing.
//!
//! Decouples link timing (settle delays, read timeouts, hot-plug poll
//! intervals) from the system clock. Production uses [`SystemEnv`]; tests
//! run under Tokio's paused clock so every delay is virtual.

use std::time::Duration;

/// Abstract clock and timer source.
///
/// # Invariants
///
/// - `now()` never goes backwards within one execution context.
pub trait Environment: Clone + Send + Sync + 'static {
    /// The instant type used by this environment.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleep for the specified duration.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;
}

/// Production environment backed by the Tokio clock.
///
/// Under `#[tokio::test(start_paused = true)]` the Tokio clock is virtual
/// and auto-advancing, so this same implementation serves deterministic
/// tests without wall-clock waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}
