//! Per-subscription-key admission gate.
//!
//! One token bucket per distinct license key, created lazily on first use.
//! Refill is greedy: the full `refill_count` lands at each interval
//! boundary, and a request arriving exactly on the boundary sees the refill
//! applied. The bucket cache is bounded; buckets idle past a TTL are evicted
//! on the write path once the cache reaches capacity.

mod plan;

pub use plan::{PlanLimit, SubscriptionPlan};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::config::{Config, DEFAULT_BUCKET_CACHE_CAPACITY, DEFAULT_BUCKET_IDLE_TTL};

/// License key used when the caller supplied none.
pub const FREEMIUM_LICENSE_KEY: &str = "FREE000-000";

/// Quota exhausted; retry once the next refill lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request quota exhausted, retry in {retry_after_seconds}s")]
pub struct LimitExceededError {
    pub retry_after_seconds: u64,
}

struct BucketState {
    tokens: u64,
    last_refill: Instant,
    last_access: Instant,
}

/// A single token bucket with greedy interval refill.
pub(crate) struct Bucket {
    capacity: u64,
    refill_count: u64,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new(limit: PlanLimit, now: Instant) -> Self {
        Self {
            capacity: limit.capacity,
            refill_count: limit.refill_count,
            refill_interval: limit.refill_interval,
            state: Mutex::new(BucketState {
                tokens: limit.capacity,
                last_refill: now,
                last_access: now,
            }),
        }
    }

    fn try_consume_at(&self, now: Instant) -> bool {
        let mut state = self.lock_state();
        let (tokens, last_refill) = self.refilled(&state, now);
        state.tokens = tokens;
        state.last_refill = last_refill;
        state.last_access = now;

        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Remaining tokens and seconds until the next refill boundary, without
    /// consuming or mutating anything.
    fn probe_at(&self, now: Instant) -> (u64, u64) {
        let state = self.lock_state();
        let (tokens, last_refill) = self.refilled(&state, now);
        let retry_after = if tokens > 0 {
            0
        } else {
            (last_refill + self.refill_interval)
                .saturating_duration_since(now)
                .as_secs()
        };
        (tokens, retry_after)
    }

    fn is_idle(&self, now: Instant, idle_ttl: Duration) -> bool {
        let state = self.lock_state();
        now.saturating_duration_since(state.last_access) > idle_ttl
    }

    /// Project the bucket forward to `now`: whole elapsed intervals each
    /// contribute `refill_count` tokens, capped at capacity.
    fn refilled(&self, state: &BucketState, now: Instant) -> (u64, Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        let intervals = elapsed.as_nanos() / self.refill_interval.as_nanos();
        if intervals == 0 {
            return (state.tokens, state.last_refill);
        }

        let refilled = u64::try_from(intervals)
            .unwrap_or(u64::MAX)
            .saturating_mul(self.refill_count);
        let tokens = state.tokens.saturating_add(refilled).min(self.capacity);

        // Advance to the latest boundary at or before `now`.
        let remainder_nanos = elapsed.as_nanos() % self.refill_interval.as_nanos();
        let last_refill = now - Duration::from_nanos(u64::try_from(remainder_nanos).unwrap_or(0));

        (tokens, last_refill)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Thread-safe admission gate over a bounded bucket cache.
///
/// Reads (existing buckets) take a read lock; the write lock is only held to
/// create a bucket for a never-seen key, so concurrent first callers get
/// exactly one bucket per key.
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
    cache_capacity: usize,
    idle_ttl: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_CACHE_CAPACITY, DEFAULT_BUCKET_IDLE_TTL)
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(cache_capacity: usize, idle_ttl: Duration) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            cache_capacity,
            idle_ttl,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.bucket_cache_capacity, config.bucket_idle_ttl)
    }

    /// Consume one permit for `subscription_key`.
    ///
    /// Returns `true` when a permit was consumed, `false` when the bucket is
    /// exhausted. Missing or empty keys are treated as Freemium.
    #[must_use]
    pub fn admit(&self, subscription_key: &str) -> bool {
        self.admit_at(subscription_key, Instant::now())
    }

    pub(crate) fn admit_at(&self, subscription_key: &str, now: Instant) -> bool {
        self.bucket_for(subscription_key, now).try_consume_at(now)
    }

    /// Consume one permit, reporting the remaining count on success and the
    /// retry delay on exhaustion.
    ///
    /// # Errors
    ///
    /// Returns [`LimitExceededError`] with `retry_after_seconds` when the
    /// bucket has no permits left.
    pub fn try_admit(&self, subscription_key: &str) -> Result<u64, LimitExceededError> {
        self.try_admit_at(subscription_key, Instant::now())
    }

    pub(crate) fn try_admit_at(
        &self,
        subscription_key: &str,
        now: Instant,
    ) -> Result<u64, LimitExceededError> {
        let bucket = self.bucket_for(subscription_key, now);
        if bucket.try_consume_at(now) {
            Ok(bucket.probe_at(now).0)
        } else {
            let (_, retry_after_seconds) = bucket.probe_at(now);
            Err(LimitExceededError {
                retry_after_seconds,
            })
        }
    }

    /// Remaining permits and seconds until the next refill, for response
    /// headers. Never consumes a permit.
    #[must_use]
    pub fn remaining_and_retry_after(&self, subscription_key: &str) -> (u64, u64) {
        self.remaining_and_retry_after_at(subscription_key, Instant::now())
    }

    pub(crate) fn remaining_and_retry_after_at(
        &self,
        subscription_key: &str,
        now: Instant,
    ) -> (u64, u64) {
        self.bucket_for(subscription_key, now).probe_at(now)
    }

    fn bucket_for(&self, subscription_key: &str, now: Instant) -> Arc<Bucket> {
        let key = if subscription_key.is_empty() {
            FREEMIUM_LICENSE_KEY
        } else {
            subscription_key
        };

        {
            let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(bucket) = buckets.get(key) {
                return bucket.clone();
            }
        }

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        if !buckets.contains_key(key) && buckets.len() >= self.cache_capacity {
            self.evict_idle(&mut buckets, now);
        }
        buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                let plan = SubscriptionPlan::for_license_key(key);
                debug!(subscription_key = key, ?plan, "created rate limit bucket");
                Arc::new(Bucket::new(plan.limit(), now))
            })
            .clone()
    }

    fn evict_idle(&self, buckets: &mut HashMap<String, Arc<Bucket>>, now: Instant) {
        let before = buckets.len();
        buckets.retain(|_, bucket| !bucket.is_idle(now, self.idle_ttl));
        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle rate limit buckets");
        }
    }
}
