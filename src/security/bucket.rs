//! Token-bucket rate limiting keyed by an arbitrary string (IP, email, endpoint).

use super::store::{BoundedStore, StoreLimits};
use std::sync::Arc;
use std::time::Duration;
use tokio::{task::JoinHandle, time::Instant};

/// Capacity and refill rate of one bucket.
///
/// Refill is interval-based: `refill_tokens` are added once per whole `interval` elapsed,
/// never spread across it, so at most `capacity` calls succeed inside one interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub capacity: u32,
    pub refill_tokens: u32,
    pub interval: Duration,
}

impl RateLimitPolicy {
    /// Login policy applied to every login endpoint.
    pub const LOGIN_BY_IP: Self = Self::per_interval(5, Duration::from_secs(60));
    pub const REGISTRATION_BY_IP: Self = Self::per_interval(3, Duration::from_secs(5 * 60));
    pub const FORGOT_PASSWORD_BY_IP: Self = Self::per_interval(3, Duration::from_secs(15 * 60));
    pub const FORGOT_PASSWORD_BY_EMAIL: Self =
        Self::per_interval(2, Duration::from_secs(30 * 60));

    #[must_use]
    pub const fn new(capacity: u32, refill_tokens: u32, interval: Duration) -> Self {
        Self {
            capacity,
            refill_tokens,
            interval,
        }
    }

    /// `limit` requests per `interval`.
    #[must_use]
    pub const fn per_interval(limit: u32, interval: Duration) -> Self {
        Self::new(limit, limit, interval)
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.capacity > 0 && self.refill_tokens > 0 && !self.interval.is_zero()
    }

    /// Time for an empty bucket to fill up again.
    #[must_use]
    pub fn full_refill(&self) -> Duration {
        self.interval
            .saturating_mul(self.periods_for(self.capacity))
    }

    // Whole intervals needed to earn `tokens`.
    fn periods_for(&self, tokens: u32) -> u32 {
        if self.refill_tokens == 0 {
            return 1;
        }
        tokens.div_ceil(self.refill_tokens).max(1)
    }
}

/// Outcome of a [`TokenBucket::consume`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    allowed: bool,
    remaining: u32,
    wait: Duration,
}

impl Decision {
    #[must_use]
    pub const fn allowed(&self) -> bool {
        self.allowed
    }

    /// Whole tokens left after this call.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.remaining
    }

    #[must_use]
    pub const fn wait(&self) -> Duration {
        self.wait
    }

    /// Wait rounded up to whole seconds; never zero for a denied call.
    #[must_use]
    pub fn wait_seconds(&self) -> u64 {
        if self.allowed {
            return 0;
        }
        let seconds = self.wait.as_secs() + u64::from(self.wait.subsec_nanos() > 0);
        seconds.max(1)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    // Start of the current refill interval.
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, policy: RateLimitPolicy, now: Instant) {
        let interval = policy.interval.as_nanos();
        if interval == 0 {
            self.tokens = policy.capacity;
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();
        let periods = elapsed / interval;
        if periods == 0 {
            return;
        }

        let earned = periods.saturating_mul(u128::from(policy.refill_tokens));
        let tokens = u128::from(self.tokens).saturating_add(earned);
        self.tokens =
            u32::try_from(tokens.min(u128::from(policy.capacity))).unwrap_or(policy.capacity);

        // Keep interval boundaries aligned to the first refill.
        let into_interval = u64::try_from(elapsed % interval).unwrap_or(0);
        self.last_refill = now
            .checked_sub(Duration::from_nanos(into_interval))
            .unwrap_or(now);
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    policy: RateLimitPolicy,
    store: Arc<BoundedStore<Bucket>>,
}

impl TokenBucket {
    /// The store's idle TTL is raised to the policy's full-refill time, so evicting an
    /// idle bucket never hands out tokens it would not have earned.
    #[must_use]
    pub fn new(name: &'static str, policy: RateLimitPolicy, limits: StoreLimits) -> Self {
        let limits = limits.with_min_idle_ttl(policy.full_refill());
        Self {
            policy,
            store: Arc::new(BoundedStore::new(name, limits)),
        }
    }

    #[must_use]
    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.store.name()
    }

    /// Refill the bucket for `key`, then try to take `cost` tokens from it.
    ///
    /// A denied call waits for the interval boundary that brings enough tokens.
    pub fn consume(&self, key: &str, cost: u32) -> Decision {
        let now = Instant::now();
        let policy = self.policy;

        self.store.update(
            key,
            || Bucket {
                tokens: policy.capacity,
                last_refill: now,
            },
            |bucket| {
                bucket.refill(policy, now);

                if bucket.tokens >= cost {
                    bucket.tokens -= cost;
                    return Decision {
                        allowed: true,
                        remaining: bucket.tokens,
                        wait: Duration::ZERO,
                    };
                }

                let periods = policy.periods_for(cost - bucket.tokens);
                let ready_at = bucket.last_refill + policy.interval.saturating_mul(periods);
                Decision {
                    allowed: false,
                    remaining: bucket.tokens,
                    wait: ready_at.saturating_duration_since(now),
                }
            },
        )
    }

    /// Forget the bucket for `key`.
    pub fn reset(&self, key: &str) {
        self.store.remove(key);
    }

    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        self.store.spawn_sweeper(every)
    }
}
