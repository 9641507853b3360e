// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared key-value store contract.
//!
//! The cache, the distributed lock, the tag index and the rate limiter all
//! coordinate through this interface. Implementations must make every method
//! atomic with respect to concurrent callers; in particular
//! [`SharedStore::set_if_absent`], [`SharedStore::increment`] and
//! [`SharedStore::delete_if_equals`] are the synchronization points of the
//! whole framework.

use std::time::Duration;

/// Error type for shared and transactional store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Lock contention, deadlock or timeout. Safe to retry.
    #[error("transient storage contention: {0}")]
    Transient(String),

    /// Backend cannot be reached or is misconfigured.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be decoded.
    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    /// Operation applied to a value of the wrong kind (e.g. incrementing bytes).
    #[error("wrong value type for key '{0}'")]
    WrongType(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Memory accounting reported by a shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreUsage {
    pub used_bytes: usize,
    pub max_bytes: usize,
    pub keys: usize,
}

impl StoreUsage {
    /// Fraction of the configured budget in use (0.0 when unbounded).
    pub fn pressure(&self) -> f64 {
        if self.max_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.max_bytes as f64
        }
    }
}

/// Atomic primitives over a store shared by every worker.
pub trait SharedStore: Send + Sync {
    /// Read a byte value. Expired keys read as absent.
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Unconditionally write a byte value.
    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()>;

    /// Write only if the key is absent (or expired). Returns whether it was written.
    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool>;

    /// Increment a counter, creating it at 1. The expiry is set only by the
    /// increment that creates the counter, which makes the window fixed.
    fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64>;

    /// Current value of a counter (0 when absent).
    fn counter(&self, key: &str) -> StoreResult<u64>;

    fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete only if the current value equals `expected`.
    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool>;

    /// Add a member to the set stored at `key`. With a `ttl`, the set lives
    /// at least that long from now; an existing later expiry is kept.
    fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Remove members from the set at `key`, deleting the set once empty.
    /// Returns the number of members removed.
    fn set_remove(&self, key: &str, members: &[String]) -> StoreResult<usize>;

    fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Remaining time to live, `None` if the key is absent or never expires.
    fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Live keys starting with `prefix`.
    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    fn usage(&self) -> StoreResult<StoreUsage>;

    /// Evict least-recently-used keys starting with `prefix` until usage is at
    /// or below `target_bytes`. Keys outside the prefix are never touched.
    /// Returns the number of evicted keys.
    fn evict_lru(&self, prefix: &str, target_bytes: usize) -> StoreResult<usize>;
}
