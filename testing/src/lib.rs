//! # Ticket Sync Testing
//!
//! Testing utilities for the shared ticket counter.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - [`ReducerTest`], a Given-When-Then harness for reducers
//! - In-memory store, broadcast bus and device tab storage with fault
//!   injection ([`memory`])
//! - Async wait helpers and proptest strategies
//!
//! ## Example
//!
//! ```ignore
//! use ticket_sync_testing::memory::{InMemoryCounterStore, StoreOperation};
//!
//! #[tokio::test]
//! async fn commit_failure_is_reported() {
//!     let store = Arc::new(InMemoryCounterStore::new());
//!     store.set_failing(StoreOperation::Write, true);
//!     let session = connect(store.clone()).await;
//!
//!     session.increment().await?;
//!     assert!(session.error_message().await.is_some());
//! }
//! ```

use chrono::{DateTime, Utc};
use ticket_sync_core::environment::Clock;

/// In-memory transports with fault injection
pub mod memory;


/// Deterministic clocks.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::TimeDelta;
    use std::sync::{Arc, PoisonError, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// # Example
    ///
    /// ```
    /// use ticket_sync_testing::mocks::FixedClock;
    /// use ticket_sync_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to. Clones share the same time.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move forward by `delta`
        pub fn advance(&self, delta: TimeDelta) {
            let mut time = self.time.write().unwrap_or_else(PoisonError::into_inner);
            *time += delta;
        }

        /// Jump to `time`
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.write().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// Never in practice; the timestamp is hardcoded.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Async test helpers.
pub mod helpers {
    use std::future::Future;
    use std::time::Duration;

    /// Re-check `condition` every 10 ms until it holds or `timeout` passes.
    ///
    /// Returns whether the condition held.
    pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Install a test-friendly tracing subscriber once. Later calls are no-ops.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Proptest strategies for domain types.
pub mod properties {
    use proptest::prelude::*;
    use ticket_sync_core::counter::{MAX_TICKET, Mutation};

    /// Any mutation, including out-of-range direct entries
    pub fn mutation() -> impl Strategy<Value = Mutation> {
        prop_oneof![
            4 => Just(Mutation::Increment),
            3 => Just(Mutation::Decrement),
            1 => Just(Mutation::Reset),
            1 => (-100.0..f64::from(MAX_TICKET) + 100.0).prop_map(Mutation::SetTo),
        ]
    }

    /// A sequence of up to `max_len` mutations
    pub fn mutations(max_len: usize) -> impl Strategy<Value = Vec<Mutation>> {
        proptest::collection::vec(mutation(), 0..=max_len)
    }
}

pub use helpers::{init_test_tracing, wait_until};
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use reducer_test::ReducerTest;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn fixed_clock_never_moves() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn manual_clock_advances_for_every_clone() {
        let clock = ManualClock::new(test_clock().now());
        let shared = clock.clone();
        clock.advance(TimeDelta::days(1));
        assert_eq!(shared.now(), test_clock().now() + TimeDelta::days(1));
    }

    #[tokio::test]
    async fn wait_until_times_out() {
        let held = wait_until(std::time::Duration::from_millis(30), || async { false }).await;
        assert!(!held);
    }
}
