// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Rate Limiter / Lockout
//!
//! Fixed-window counters in the shared store, per identifier (`user:{id}`,
//! `ip:{origin}`, or `{action}:{actor}`).
//!
//! ```text
//!            failures ≥ max_failures
//!   Active ─────────────────────────→ Locked(until)
//!     ↑                                    │
//!     └──────────── now ≥ until ───────────┘
//! ```
//!
//! - **Attempts** (`rate:attempts:{id}`) throttle: the first increment opens
//!   the window, attempt `max_attempts + 1` is refused.
//! - **Failures** (`rate:failures:{id}`) escalate: reaching `max_failures`
//!   within `failure_window` writes `rate:lockout:{id}`.
//! - While locked nothing is counted, so counters cannot grow without bound.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{info, warn};

use crate::clock::{add_duration, elapsed_between, Clock};
use crate::error::{OperationError, RateLimitReason};
use crate::storage::SharedStore;

/// Thresholds of the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Attempts allowed per window.
    pub max_attempts: u64,
    pub window: Duration,
    /// Failures within `failure_window` that trigger a lockout.
    pub max_failures: u64,
    pub failure_window: Duration,
    /// Cool-down once locked.
    pub lockout: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            window: Duration::from_secs(60),
            max_failures: 4,
            failure_window: Duration::from_secs(15 * 60),
            lockout: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockoutState {
    Active,
    Locked { until: DateTime<Utc> },
}

impl LockoutState {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockoutState::Locked { .. })
    }
}

/// What [`RateLimiter::record_failure`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Failure counted; still active.
    Counted { failures: u64 },
    /// This failure crossed the threshold.
    LockoutEntered { until: DateTime<Utc> },
    /// Already locked; nothing was counted.
    AlreadyLocked { until: DateTime<Utc> },
}

pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    policy: RateLimitPolicy,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn attempts_key(identifier: &str) -> String {
    format!("rate:attempts:{identifier}")
}

fn failures_key(identifier: &str) -> String {
    format!("rate:failures:{identifier}")
}

fn lockout_key(identifier: &str) -> String {
    format!("rate:lockout:{identifier}")
}

/// Lockout records store millisecond timestamps; keep returned values equal
/// to what a later read produces.
fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(at.timestamp_millis())
        .single()
        .unwrap_or(at)
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        policy: RateLimitPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Current lockout state of an identifier.
    pub fn state(&self, identifier: &str) -> Result<LockoutState, OperationError> {
        let Some(raw) = self.store.get(&lockout_key(identifier))? else {
            return Ok(LockoutState::Active);
        };
        let until = std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        match until {
            Some(until) if self.clock.now() < until => Ok(LockoutState::Locked { until }),
            Some(_) => Ok(LockoutState::Active),
            None => {
                // Unreadable lockout record: stay locked for a full period.
                warn!(identifier, "Unreadable lockout record, re-locking");
                let until = self.lock(identifier, self.policy.lockout)?;
                Ok(LockoutState::Locked { until })
            }
        }
    }

    fn locked_out(&self, until: DateTime<Utc>) -> OperationError {
        OperationError::RateLimited {
            reason: RateLimitReason::LockedOut,
            retry_after: elapsed_between(self.clock.now(), until),
        }
    }

    /// Fail with `LockedOut` if the identifier is locked.
    pub fn ensure_active(&self, identifier: &str) -> Result<(), OperationError> {
        match self.state(identifier)? {
            LockoutState::Active => Ok(()),
            LockoutState::Locked { until } => Err(self.locked_out(until)),
        }
    }

    /// Count one attempt. Returns the attempt number within the window.
    pub fn check(&self, identifier: &str) -> Result<u64, OperationError> {
        self.ensure_active(identifier)?;

        let key = attempts_key(identifier);
        let count = self.store.increment(&key, self.policy.window)?;
        if count > self.policy.max_attempts {
            let retry_after = self.store.ttl(&key)?.unwrap_or(self.policy.window);
            warn!(identifier, count, "Rate limit window exceeded");
            return Err(OperationError::RateLimited {
                reason: RateLimitReason::WindowExceeded,
                retry_after,
            });
        }
        Ok(count)
    }

    /// Count one failure; enter lockout when the threshold is reached.
    pub fn record_failure(&self, identifier: &str) -> Result<FailureOutcome, OperationError> {
        if let LockoutState::Locked { until } = self.state(identifier)? {
            return Ok(FailureOutcome::AlreadyLocked { until });
        }

        let key = failures_key(identifier);
        let failures = self.store.increment(&key, self.policy.failure_window)?;
        if failures < self.policy.max_failures {
            return Ok(FailureOutcome::Counted { failures });
        }

        let until = self.lock(identifier, self.policy.lockout)?;
        self.store.delete(&key)?;
        warn!(identifier, failures, %until, "Lockout entered");
        Ok(FailureOutcome::LockoutEntered { until })
    }

    /// Forget counted failures. An active lockout is left alone.
    pub fn record_success(&self, identifier: &str) -> Result<(), OperationError> {
        self.store.delete(&failures_key(identifier))?;
        Ok(())
    }

    /// Lock an identifier for `duration`. Extends an existing lockout but
    /// never shortens it. Returns the effective `until`.
    pub fn lock(
        &self,
        identifier: &str,
        duration: Duration,
    ) -> Result<DateTime<Utc>, OperationError> {
        let now = self.clock.now();
        let mut until = truncate_to_millis(add_duration(now, duration));

        let key = lockout_key(identifier);
        if let Some(existing) = self
            .store
            .get(&key)?
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        {
            until = until.max(existing);
        }

        let ttl = elapsed_between(now, until);
        self.store.set(
            &key,
            until.timestamp_millis().to_string().as_bytes(),
            Some(ttl),
        )?;
        info!(identifier, %until, "Identifier locked");
        Ok(until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;

    fn limiter(policy: RateLimitPolicy) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone(), 0));
        (clock.clone(), RateLimiter::new(store, clock, policy))
    }

    fn policy() -> RateLimitPolicy {
        RateLimitPolicy {
            max_attempts: 3,
            window: Duration::from_secs(60),
            max_failures: 4,
            failure_window: Duration::from_secs(300),
            lockout: Duration::from_secs(900),
        }
    }

    #[test]
    fn window_boundary() {
        let (clock, limiter) = limiter(policy());
        assert_eq!(limiter.check("content.create:user:1").unwrap(), 1);
        assert_eq!(limiter.check("content.create:user:1").unwrap(), 2);
        assert_eq!(limiter.check("content.create:user:1").unwrap(), 3);

        clock.advance(Duration::from_secs(20));
        match limiter.check("content.create:user:1").unwrap_err() {
            OperationError::RateLimited {
                reason,
                retry_after,
            } => {
                assert_eq!(reason, RateLimitReason::WindowExceeded);
                assert_eq!(retry_after, Duration::from_secs(40));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        clock.advance(Duration::from_secs(40));
        assert_eq!(limiter.check("content.create:user:1").unwrap(), 1);
    }

    #[test]
    fn identifiers_are_independent() {
        let (_clock, limiter) = limiter(policy());
        for _ in 0..3 {
            limiter.check("a").unwrap();
        }
        assert!(limiter.check("a").is_err());
        assert_eq!(limiter.check("b").unwrap(), 1);
    }

    #[test]
    fn four_failures_lock_until_cooldown() {
        let (clock, limiter) = limiter(policy());
        let id = "ip:1.2.3.4";

        for expected in 1..=3 {
            assert_eq!(
                limiter.record_failure(id).unwrap(),
                FailureOutcome::Counted { failures: expected }
            );
        }
        let until = match limiter.record_failure(id).unwrap() {
            FailureOutcome::LockoutEntered { until } => until,
            other => panic!("expected lockout, got {other:?}"),
        };
        assert_eq!(limiter.state(id).unwrap(), LockoutState::Locked { until });

        clock.advance(Duration::from_secs(899));
        assert!(matches!(
            limiter.check(id),
            Err(OperationError::RateLimited {
                reason: RateLimitReason::LockedOut,
                ..
            })
        ));

        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.state(id).unwrap(), LockoutState::Active);
        assert_eq!(limiter.check(id).unwrap(), 1);
    }

    #[test]
    fn locked_identifier_counts_nothing() {
        let (_clock, limiter) = limiter(policy());
        let until = limiter.lock("user:9", Duration::from_secs(60)).unwrap();

        assert_eq!(
            limiter.record_failure("user:9").unwrap(),
            FailureOutcome::AlreadyLocked { until }
        );
        assert!(limiter.check("user:9").is_err());
        assert_eq!(limiter.store.counter("rate:attempts:user:9").unwrap(), 0);
        assert_eq!(limiter.store.counter("rate:failures:user:9").unwrap(), 0);
    }

    #[test]
    fn success_clears_failures_but_not_lockout() {
        let (_clock, limiter) = limiter(policy());
        limiter.record_failure("u").unwrap();
        limiter.record_failure("u").unwrap();
        limiter.record_success("u").unwrap();
        assert_eq!(
            limiter.record_failure("u").unwrap(),
            FailureOutcome::Counted { failures: 1 }
        );

        limiter.lock("u", Duration::from_secs(60)).unwrap();
        limiter.record_success("u").unwrap();
        assert!(limiter.state("u").unwrap().is_locked());
    }

    #[test]
    fn lock_extends_but_never_shortens() {
        let (_clock, limiter) = limiter(policy());
        let long = limiter.lock("u", Duration::from_secs(600)).unwrap();
        let after_short = limiter.lock("u", Duration::from_secs(10)).unwrap();
        assert_eq!(after_short, long);

        let longer = limiter.lock("u", Duration::from_secs(1200)).unwrap();
        assert!(longer > long);
        assert_eq!(limiter.state("u").unwrap(), LockoutState::Locked { until: longer });
    }

    #[test]
    fn failure_window_expires() {
        let (clock, limiter) = limiter(policy());
        for _ in 0..3 {
            limiter.record_failure("u").unwrap();
        }
        clock.advance(Duration::from_secs(300));
        assert_eq!(
            limiter.record_failure("u").unwrap(),
            FailureOutcome::Counted { failures: 1 }
        );
    }
}
