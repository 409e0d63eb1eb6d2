//! Caller-side retry bookkeeping for FUOTA work items.
//!
//! The store persists whatever `retry_after`/`retry_count` it is given. Workers use these helpers
//! to compute the next values after an attempt and then write them back with `update`.

use std::time::Duration;

use crate::fuota_store::{FragmentationSession, MulticastSetup, Timestamp};

/// Delay before the next attempt of a work item.
pub trait BackoffPolicy {
    /// `retry_count` is the number of attempts already made, including the one just recorded.
    /// `key_hash` identifies the work item so concurrent workers spread their retries.
    fn delay_for(&self, retry_count: i32, key_hash: u64) -> Duration;
}

/// Same delay after every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedInterval(pub Duration);

impl BackoffPolicy for FixedInterval {
    fn delay_for(&self, _retry_count: i32, _key_hash: u64) -> Duration {
        self.0
    }
}

/// Doubling delay capped at `max`, plus up to `jitter` of per-item spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(60 * 60),
            jitter: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay_for(&self, retry_count: i32, key_hash: u64) -> Duration {
        if self.initial.is_zero() && self.jitter.is_zero() {
            return Duration::ZERO;
        }

        let attempt = u32::try_from(retry_count.max(1)).unwrap_or(1);
        let shift = u32::min(attempt - 1, 20);
        let exponential_ms = self.initial.as_millis().saturating_mul(1u128 << shift);
        let capped_ms = exponential_ms.min(self.max.as_millis());
        let jitter_ms = deterministic_jitter(key_hash, attempt, self.jitter.as_millis());

        let total_ms = capped_ms.saturating_add(jitter_ms);
        Duration::from_millis(u64::try_from(total_ms).unwrap_or(u64::MAX))
    }
}

fn deterministic_jitter(key_hash: u64, attempt: u32, jitter_cap: u128) -> u128 {
    if jitter_cap == 0 {
        return 0;
    }

    let mut x = key_hash ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;

    u128::from(x) % (jitter_cap + 1)
}

/// True once a work item has used its whole retry budget.
pub fn is_exhausted(retry_count: i32, max_retry_count: i32) -> bool {
    retry_count >= max_retry_count
}

/// Work items whose next attempt is scheduled through `retry_after`/`retry_count`.
pub trait RetrySchedule {
    fn retry_count(&self) -> i32;
    fn key_hash(&self) -> u64;
    fn schedule(&mut self, retry_count: i32, retry_after: Timestamp);

    /// Counts one more attempt and pushes `retry_after` out by the policy's delay from `now`.
    fn record_attempt<P>(&mut self, policy: &P, now: Timestamp)
    where
        P: BackoffPolicy + ?Sized,
    {
        let retry_count = self.retry_count().saturating_add(1);
        let delay = policy.delay_for(retry_count, self.key_hash());
        self.schedule(retry_count, now.saturating_add(delay));
    }
}

impl RetrySchedule for FragmentationSession {
    fn retry_count(&self) -> i32 {
        self.retry_count
    }

    fn key_hash(&self) -> u64 {
        self.dev_eui.as_u64() ^ (self.frag_index as u64)
    }

    fn schedule(&mut self, retry_count: i32, retry_after: Timestamp) {
        self.retry_count = retry_count;
        self.retry_after = retry_after;
    }
}

impl RetrySchedule for MulticastSetup {
    fn retry_count(&self) -> i32 {
        self.retry_count
    }

    fn key_hash(&self) -> u64 {
        self.dev_eui.as_u64() ^ ((self.mc_group_id as u64) << 8)
    }

    fn schedule(&mut self, retry_count: i32, retry_after: Timestamp) {
        self.retry_count = retry_count;
        self.retry_after = retry_after;
    }
}
