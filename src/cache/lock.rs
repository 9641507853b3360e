// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Token-owned mutex over the shared store.
//!
//! ```text
//! (unlocked) ── set_if_absent(lock:{key}, owner, ttl) ──→ held by owner
//!     ↑                                                      │
//!     └──── delete_if_equals(lock:{key}, owner) ─────────────┤
//!     └──── ttl expiry ──────────────────────────────────────┘
//! ```
//!
//! Release is a compare-and-delete on the owner token, so a holder whose TTL
//! already ran out can never free a lock that someone else re-acquired.

use std::convert::Infallible;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{add_duration, Clock};
use crate::error::OperationError;
use crate::storage::{SharedStore, StoreResult};

const LOCK_PREFIX: &str = "lock:";

/// Tuning for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// Lifetime of a lock record; bounds how long a stuck holder blocks others.
    pub ttl: Duration,
    /// Pause between acquisition attempts.
    pub retry_delay: Duration,
    /// Attempts before giving up with `LockAcquisition`.
    pub max_attempts: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            retry_delay: Duration::from_millis(50),
            max_attempts: 100,
        }
    }
}

/// Proof of ownership of one lock record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    owner: String,
    expires_at: DateTime<Utc>,
}

impl LockToken {
    /// Build a token by hand. Only the token that created a lock can release it,
    /// so a forged token is inert.
    pub fn new(
        key: impl Into<String>,
        owner: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.into(),
            owner: owner.into(),
            expires_at,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Result of waiting on a contended lock.
#[derive(Debug)]
pub enum Contended<'a, T> {
    /// The lock is now held by the caller.
    Acquired(LockGuard<'a>),
    /// The poll produced a value while waiting; the lock was never taken.
    Resolved(T),
}

/// Distributed lock over a [`SharedStore`].
pub struct DistributedLock {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, config: LockConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn record_key(key: &str) -> String {
        format!("{LOCK_PREFIX}{key}")
    }

    /// Single acquisition attempt.
    pub fn try_acquire(&self, key: &str) -> StoreResult<Option<LockToken>> {
        let owner = uuid::Uuid::new_v4().to_string();
        let acquired =
            self.store
                .set_if_absent(&Self::record_key(key), owner.as_bytes(), self.config.ttl)?;
        if !acquired {
            return Ok(None);
        }
        Ok(Some(LockToken {
            key: key.to_string(),
            owner,
            expires_at: add_duration(self.clock.now(), self.config.ttl),
        }))
    }

    /// Acquire the lock, retrying up to `max_attempts` times.
    pub fn acquire(&self, key: &str) -> Result<LockGuard<'_>, OperationError> {
        match self.acquire_or_resolve(key, || None::<Infallible>)? {
            Contended::Acquired(guard) => Ok(guard),
            Contended::Resolved(never) => match never {},
        }
    }

    /// Acquire the lock, calling `poll` before each retry. If `poll` returns a
    /// value the wait ends without taking the lock.
    pub fn acquire_or_resolve<T>(
        &self,
        key: &str,
        mut poll: impl FnMut() -> Option<T>,
    ) -> Result<Contended<'_, T>, OperationError> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(token) = self.try_acquire(key)? {
                if attempt > 1 {
                    tracing::debug!(key, attempt, "Acquired contended lock");
                }
                return Ok(Contended::Acquired(LockGuard {
                    lock: self,
                    token: Some(token),
                }));
            }
            if attempt == attempts {
                break;
            }
            thread::sleep(self.config.retry_delay);
            if let Some(value) = poll() {
                return Ok(Contended::Resolved(value));
            }
        }

        tracing::warn!(key, attempts, "Lock acquisition exhausted");
        Err(OperationError::LockAcquisition {
            key: key.to_string(),
            attempts,
        })
    }

    /// Release a lock if and only if `token` still owns it.
    ///
    /// Returns `false` (and changes nothing) when the token does not match the
    /// current holder, e.g. because its TTL expired and another caller took over.
    pub fn release(&self, token: &LockToken) -> StoreResult<bool> {
        let released = self
            .store
            .delete_if_equals(&Self::record_key(&token.key), token.owner.as_bytes())?;
        if !released {
            tracing::debug!(
                key = %token.key,
                "Lock release ignored: token no longer owns the lock"
            );
        }
        Ok(released)
    }

    pub fn is_locked(&self, key: &str) -> StoreResult<bool> {
        Ok(self.store.get(&Self::record_key(key))?.is_some())
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a DistributedLock,
    token: Option<LockToken>,
}

impl LockGuard<'_> {
    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    /// Release now and report whether this guard still owned the lock.
    pub fn release(mut self) -> StoreResult<bool> {
        match self.token.take() {
            Some(token) => self.lock.release(&token),
            None => Ok(false),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.lock.release(&token) {
                tracing::warn!(key = %token.key, error = %e, "Failed to release lock");
            }
        }
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;

    fn lock_with(config: LockConfig) -> (Arc<ManualClock>, DistributedLock) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone(), 0));
        (clock.clone(), DistributedLock::new(store, clock, config))
    }

    fn fast_config() -> LockConfig {
        LockConfig {
            ttl: Duration::from_secs(10),
            retry_delay: Duration::from_millis(1),
            max_attempts: 3,
        }
    }

    #[test]
    fn only_one_holder_per_key() {
        let (_clock, lock) = lock_with(fast_config());
        let token = lock.try_acquire("user:42").unwrap().unwrap();
        assert!(lock.try_acquire("user:42").unwrap().is_none());
        assert!(lock.try_acquire("user:43").unwrap().is_some());

        assert!(lock.release(&token).unwrap());
        assert!(lock.try_acquire("user:42").unwrap().is_some());
    }

    #[test]
    fn foreign_token_release_is_noop_until_expiry() {
        let (clock, lock) = lock_with(fast_config());
        let real = lock.try_acquire("k").unwrap().unwrap();

        let forged = LockToken::new("k", "not-the-owner", real.expires_at());
        assert!(!lock.release(&forged).unwrap());
        assert!(lock.is_locked("k").unwrap());
        assert!(lock.try_acquire("k").unwrap().is_none());

        clock.advance(Duration::from_secs(10));
        assert!(!lock.is_locked("k").unwrap());
        assert!(lock.try_acquire("k").unwrap().is_some());
    }

    #[test]
    fn expired_holder_cannot_release_successor() {
        let (clock, lock) = lock_with(fast_config());
        let stale = lock.try_acquire("k").unwrap().unwrap();

        clock.advance(Duration::from_secs(11));
        let successor = lock.try_acquire("k").unwrap().unwrap();

        assert!(!lock.release(&stale).unwrap());
        assert!(lock.is_locked("k").unwrap());
        assert!(lock.release(&successor).unwrap());
    }

    #[test]
    fn acquire_exhausts_attempts() {
        let (_clock, lock) = lock_with(fast_config());
        let _held = lock.try_acquire("k").unwrap().unwrap();

        let err = lock.acquire("k").unwrap_err();
        assert_eq!(
            err,
            OperationError::LockAcquisition {
                key: "k".to_string(),
                attempts: 3
            }
        );
    }

    #[test]
    fn guard_releases_on_drop() {
        let (_clock, lock) = lock_with(fast_config());
        {
            let guard = lock.acquire("k").unwrap();
            assert!(guard.token().is_some());
            assert!(lock.is_locked("k").unwrap());
        }
        assert!(!lock.is_locked("k").unwrap());
    }

    #[test]
    fn poll_resolves_wait_without_locking() {
        let (_clock, lock) = lock_with(fast_config());
        let _held = lock.try_acquire("k").unwrap().unwrap();

        let outcome = lock.acquire_or_resolve("k", || Some("cached")).unwrap();
        match outcome {
            Contended::Resolved(value) => assert_eq!(value, "cached"),
            Contended::Acquired(_) => panic!("lock should still be held"),
        }
    }
}
