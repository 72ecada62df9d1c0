//! Sliding-window failure tracking with temporary lockout.
//!
//! One tracker serves every call site; each supplies its own [`LockoutPolicy`].

use super::store::{BoundedStore, StoreLimits};
use std::sync::Arc;
use std::time::Duration;
use tokio::{task::JoinHandle, time::Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockoutPolicy {
    /// Failures inside the window that trigger a lockout.
    pub threshold: u32,
    /// Failures further apart than this start a fresh count.
    pub window: Duration,
    pub lockout: Duration,
}

impl LockoutPolicy {
    pub const LOGIN: Self = Self::new(3, Duration::from_secs(10 * 60), Duration::from_secs(15 * 60));

    #[must_use]
    pub const fn new(threshold: u32, window: Duration, lockout: Duration) -> Self {
        Self {
            threshold,
            window,
            lockout,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.threshold > 0 && !self.window.is_zero() && !self.lockout.is_zero()
    }
}

#[derive(Debug, Default)]
struct AttemptRecord {
    failures: u32,
    last_failure: Option<Instant>,
    locked_until: Option<Instant>,
}

/// Result of recording one failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailureOutcome {
    pub failures: u32,
    /// Set when this failure reached the threshold.
    pub locked_for: Option<Duration>,
}

#[derive(Debug)]
pub struct AttemptTracker {
    policy: LockoutPolicy,
    store: Arc<BoundedStore<AttemptRecord>>,
}

impl AttemptTracker {
    #[must_use]
    pub fn new(name: &'static str, policy: LockoutPolicy, limits: StoreLimits) -> Self {
        let limits = limits.with_min_idle_ttl(policy.window.max(policy.lockout));
        Self {
            policy,
            store: Arc::new(BoundedStore::new(name, limits)),
        }
    }

    #[must_use]
    pub fn policy(&self) -> LockoutPolicy {
        self.policy
    }

    pub fn record_failure(&self, identifier: &str) -> FailureOutcome {
        let now = Instant::now();
        let policy = self.policy;

        self.store.update(identifier, AttemptRecord::default, |record| {
            if record.locked_until.is_some_and(|until| now >= until) {
                *record = AttemptRecord::default();
            }
            if record
                .last_failure
                .is_some_and(|last| now.saturating_duration_since(last) > policy.window)
            {
                record.failures = 0;
            }

            record.failures = record.failures.saturating_add(1);
            record.last_failure = Some(now);

            let locked_for = (record.failures >= policy.threshold).then(|| {
                record.locked_until = Some(now + policy.lockout);
                policy.lockout
            });

            FailureOutcome {
                failures: record.failures,
                locked_for,
            }
        })
    }

    #[must_use]
    pub fn is_locked(&self, identifier: &str) -> bool {
        !self.remaining_lockout(identifier).is_zero()
    }

    #[must_use]
    pub fn remaining_lockout(&self, identifier: &str) -> Duration {
        let now = Instant::now();
        self.store
            .read(identifier, |record| {
                record
                    .locked_until
                    .map(|until| until.saturating_duration_since(now))
            })
            .flatten()
            .unwrap_or_default()
    }

    /// Remaining lockout rounded up to whole seconds.
    #[must_use]
    pub fn remaining_lockout_seconds(&self, identifier: &str) -> u64 {
        let remaining = self.remaining_lockout(identifier);
        remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
    }

    /// Forget every failure recorded for `identifier`.
    pub fn record_success(&self, identifier: &str) {
        self.store.remove(identifier);
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        self.store.spawn_sweeper(every)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    const EMAIL: &str = "a@b.com";

    fn tracker() -> AttemptTracker {
        AttemptTracker::new("test", LockoutPolicy::LOGIN, StoreLimits::default())
    }

    #[tokio::test(start_paused = true)]
    async fn locks_exactly_on_threshold() {
        let tracker = tracker();
        assert_eq!(tracker.record_failure(EMAIL).locked_for, None);
        assert!(!tracker.is_locked(EMAIL));
        assert_eq!(tracker.record_failure(EMAIL).locked_for, None);
        assert!(!tracker.is_locked(EMAIL));

        let third = tracker.record_failure(EMAIL);
        assert_eq!(third.failures, 3);
        assert_eq!(third.locked_for, Some(Duration::from_secs(15 * 60)));
        assert!(tracker.is_locked(EMAIL));
        assert_eq!(tracker.remaining_lockout_seconds(EMAIL), 15 * 60);
    }

    #[tokio::test(start_paused = true)]
    async fn success_before_threshold_resets_count() {
        let tracker = tracker();
        tracker.record_failure(EMAIL);
        tracker.record_failure(EMAIL);
        tracker.record_success(EMAIL);

        assert_eq!(tracker.record_failure(EMAIL).failures, 1);
        assert!(!tracker.is_locked(EMAIL));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_window_starts_fresh() {
        let tracker = tracker();
        tracker.record_failure(EMAIL);
        tracker.record_failure(EMAIL);

        advance(Duration::from_secs(10 * 60 + 1)).await;

        let outcome = tracker.record_failure(EMAIL);
        assert_eq!(outcome.failures, 1);
        assert!(!tracker.is_locked(EMAIL));
    }

    #[tokio::test(start_paused = true)]
    async fn lockout_expires_and_count_restarts() {
        let tracker = tracker();
        for _ in 0..3 {
            tracker.record_failure(EMAIL);
        }
        advance(Duration::from_secs(5 * 60)).await;
        assert_eq!(tracker.remaining_lockout_seconds(EMAIL), 10 * 60);

        advance(Duration::from_secs(10 * 60)).await;
        assert!(!tracker.is_locked(EMAIL));
        assert_eq!(tracker.remaining_lockout_seconds(EMAIL), 0);

        assert_eq!(tracker.record_failure(EMAIL).failures, 1);
        assert!(!tracker.is_locked(EMAIL));
    }

    #[tokio::test(start_paused = true)]
    async fn identifiers_are_tracked_separately() {
        let tracker = tracker();
        for _ in 0..3 {
            tracker.record_failure(EMAIL);
        }
        assert!(tracker.is_locked(EMAIL));
        assert!(!tracker.is_locked("other@b.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn per_site_policy_thresholds() {
        let policy = LockoutPolicy::new(5, Duration::from_secs(60 * 60), Duration::from_secs(15 * 60));
        let tracker = AttemptTracker::new("account", policy, StoreLimits::default());
        for _ in 0..4 {
            tracker.record_failure(EMAIL);
        }
        assert!(!tracker.is_locked(EMAIL));
        tracker.record_failure(EMAIL);
        assert!(tracker.is_locked(EMAIL));
    }

    #[test]
    fn idle_ttl_outlives_lockout() {
        let tracker = AttemptTracker::new(
            "test",
            LockoutPolicy::LOGIN,
            StoreLimits::new(10, Duration::from_secs(1)),
        );
        assert_eq!(tracker.store.limits().idle_ttl, Duration::from_secs(15 * 60));
    }
}
