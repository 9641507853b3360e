// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Secure Cache
//!
//! Encrypted, checksummed, stampede-safe cache over a [`SharedStore`].
//!
//! ## Read path (`cached_get`)
//!
//! ```text
//! lookup ── hit ──────────────────────────────────────────────→ value
//!   │ miss
//!   ▼
//! lock(key) ── contended: sleep, lookup again ── hit ─────────→ value
//!   │ acquired
//!   ▼
//! lookup again ── hit ── release ─────────────────────────────→ value
//!   │ miss
//!   ▼
//! supplier() → encrypt → checksum → store → register tags → release → value
//! ```
//!
//! The supplier therefore runs once per miss no matter how many callers
//! arrive at the same time.
//!
//! ## Entry lifetime
//!
//! An entry is fresh for its TTL. The store keeps it physically for
//! `ttl * hard_expiry_factor` so the stale sweep has something to collect
//! under memory pressure; a stale entry always reads as a miss.
//!
//! ## Integrity
//!
//! Entries are AES-256-GCM encrypted with the cache key as associated data,
//! and carry an HMAC over key, ciphertext, timestamps and tags. An entry that
//! fails either check is deleted, audited as a warning and treated as a miss.

pub mod cipher;
pub mod eviction;
pub mod lock;
pub mod tags;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::audit::{AuditRecorder, AuditSubject, SecurityEvent, SecurityEventKind};
use crate::clock::{elapsed_between, Clock};
use crate::error::{OperationError, Severity};
use crate::storage::SharedStore;

pub use cipher::{Cipher, CipherError};
pub use eviction::CacheSweeper;
pub use lock::{Contended, DistributedLock, LockConfig, LockGuard, LockToken};
pub use tags::TagIndex;

const ENTRY_PREFIX: &str = "cache:";

/// Cache tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    /// Physical lifetime in the store as a multiple of the TTL.
    pub hard_expiry_factor: f64,
    /// Age, as a multiple of the TTL, past which the sweep removes an entry.
    pub stale_factor: f64,
    /// Memory pressure (`used / max`) that triggers a sweep.
    pub memory_pressure_threshold: f64,
    pub lock: LockConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hard_expiry_factor: 2.0,
            stale_factor: 1.5,
            memory_pressure_threshold: 0.8,
            lock: LockConfig::default(),
        }
    }
}

/// Freshness and integrity metadata of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
    /// Hex HMAC-SHA256 over key, ciphertext, created_at, ttl and tags.
    pub checksum: String,
}

/// Envelope stored at `cache:{key}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Hex of `nonce || ciphertext || tag`.
    pub ciphertext: String,
    pub tags: Vec<String>,
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.metadata.ttl_ms)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.metadata.created_at, now)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.age(now) < self.ttl()
    }
}

/// What to invalidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Every key registered under the tag.
    Tag(String),
    /// A single key.
    Key(String),
}

/// Result of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale_removed: usize,
    pub corrupt_removed: usize,
    pub lru_evicted: usize,
    /// Tag index members dropped because their entry was gone.
    pub tag_members_pruned: usize,
}

fn internal(context: &'static str, err: impl fmt::Display) -> OperationError {
    error!(error = %err, "{context}");
    OperationError::Internal
}

/// `ttl * factor`, saturating.
fn scale(ttl: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(ttl.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

enum Lookup {
    Hit(Vec<u8>),
    Miss,
}

pub struct SecureCache {
    store: Arc<dyn SharedStore>,
    cipher: Cipher,
    lock: DistributedLock,
    tags: TagIndex,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<dyn AuditRecorder>>,
    config: CacheConfig,
}

impl fmt::Debug for SecureCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SecureCache {
    pub fn new(
        store: Arc<dyn SharedStore>,
        cipher: Cipher,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        Self {
            lock: DistributedLock::new(store.clone(), clock.clone(), config.lock),
            tags: TagIndex::new(store.clone()),
            store,
            cipher,
            clock,
            audit: None,
            config,
        }
    }

    /// Report integrity mismatches to an audit trail.
    pub fn with_audit(mut self, audit: Arc<dyn AuditRecorder>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn entry_key(key: &str) -> String {
        format!("{ENTRY_PREFIX}{key}")
    }

    /// Typed get-or-compute. Values are stored as JSON.
    pub fn cached_get<T, F>(
        &self,
        key: &str,
        ttl: Duration,
        tags: &[&str],
        supplier: F,
    ) -> Result<T, OperationError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, OperationError>,
    {
        let bytes = self.cached_get_bytes(key, ttl, tags, || {
            let value = supplier()?;
            serde_json::to_vec(&value).map_err(|e| internal("Failed to encode cache value", e))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| internal("Failed to decode cache value", e))
    }

    /// Raw get-or-compute.
    pub fn cached_get_bytes<F>(
        &self,
        key: &str,
        ttl: Duration,
        tags: &[&str],
        supplier: F,
    ) -> Result<Vec<u8>, OperationError>
    where
        F: FnOnce() -> Result<Vec<u8>, OperationError>,
    {
        if key.is_empty() {
            return Err(OperationError::validation("key", "cache key must not be empty"));
        }
        if ttl.is_zero() {
            return Err(OperationError::validation("ttl", "cache ttl must be positive"));
        }

        if let Lookup::Hit(value) = self.lookup(key)? {
            return Ok(value);
        }

        let guard = match self.lock.acquire_or_resolve(key, || match self.lookup(key) {
            Ok(Lookup::Hit(value)) => Some(value),
            _ => None,
        })? {
            Contended::Resolved(value) => {
                debug!(key, "Cache populated while waiting for lock");
                return Ok(value);
            }
            Contended::Acquired(guard) => guard,
        };

        if let Lookup::Hit(value) = self.lookup(key)? {
            return Ok(value);
        }

        // The guard releases the lock on every exit path, supplier errors included.
        let value = supplier()?;
        self.populate(key, &value, ttl, tags)?;
        drop(guard);

        if let Err(e) = self.sweep_if_pressured() {
            warn!(key, error = %e, "Opportunistic cache sweep failed");
        }
        Ok(value)
    }

    fn lookup(&self, key: &str) -> Result<Lookup, OperationError> {
        let store_key = Self::entry_key(key);
        let Some(raw) = self.store.get(&store_key)? else {
            return Ok(Lookup::Miss);
        };

        let entry = match self.verified_entry(key, &raw) {
            Some(entry) => entry,
            None => {
                self.discard(key, "checksum mismatch")?;
                return Ok(Lookup::Miss);
            }
        };
        if !entry.is_fresh(self.clock.now()) {
            return Ok(Lookup::Miss);
        }

        let sealed = match hex::decode(&entry.ciphertext) {
            Ok(sealed) => sealed,
            Err(_) => {
                self.discard(key, "ciphertext encoding")?;
                return Ok(Lookup::Miss);
            }
        };
        match self.cipher.decrypt(&sealed, key.as_bytes()) {
            Ok(plaintext) => Ok(Lookup::Hit(plaintext)),
            Err(_) => {
                self.discard(key, "decryption failed")?;
                Ok(Lookup::Miss)
            }
        }
    }

    /// Parse an envelope and check that it belongs to `key` and verifies.
    fn verified_entry(&self, key: &str, raw: &[u8]) -> Option<CacheEntry> {
        let entry: CacheEntry = serde_json::from_slice(raw).ok()?;
        if entry.key != key {
            return None;
        }
        let sealed = hex::decode(&entry.ciphertext).ok()?;
        let created_ms = entry.metadata.created_at.timestamp_millis().to_be_bytes();
        let ttl_ms = entry.metadata.ttl_ms.to_be_bytes();
        let tags = entry.tags.join("\n");
        let parts: [&[u8]; 5] = [
            key.as_bytes(),
            &sealed,
            &created_ms,
            &ttl_ms,
            tags.as_bytes(),
        ];
        self.cipher
            .verify_checksum(&parts, &entry.metadata.checksum)
            .then_some(entry)
    }

    /// Delete a tampered entry and report it.
    fn discard(&self, key: &str, reason: &'static str) -> Result<(), OperationError> {
        self.store.delete(&Self::entry_key(key))?;
        warn!(key, reason, "Cache integrity mismatch, entry discarded");
        if let Some(audit) = &self.audit {
            let event = SecurityEvent::new(
                SecurityEventKind::IntegrityMismatch,
                Severity::Warning,
                AuditSubject::new("cache.read"),
            )
            .with_error(&OperationError::Integrity {
                key: key.to_string(),
            })
            .with_details(serde_json::json!({ "key": key, "reason": reason }));
            audit.log_security_event(event);
        }
        Ok(())
    }

    fn populate(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        tags: &[&str],
    ) -> Result<(), OperationError> {
        let sealed = self
            .cipher
            .encrypt(value, key.as_bytes())
            .map_err(|e| internal("Failed to encrypt cache value", e))?;

        let mut tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        tags.sort();
        tags.dedup();

        let created_at = self.clock.now();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let created_bytes = created_at.timestamp_millis().to_be_bytes();
        let ttl_bytes = ttl_ms.to_be_bytes();
        let joined_tags = tags.join("\n");
        let parts: [&[u8]; 5] = [
            key.as_bytes(),
            &sealed,
            &created_bytes,
            &ttl_bytes,
            joined_tags.as_bytes(),
        ];
        let checksum = self.cipher.checksum(&parts);

        let entry = CacheEntry {
            key: key.to_string(),
            ciphertext: hex::encode(&sealed),
            tags,
            metadata: EntryMetadata {
                created_at,
                ttl_ms,
                checksum,
            },
        };
        let envelope =
            serde_json::to_vec(&entry).map_err(|e| internal("Failed to encode cache entry", e))?;

        let store_key = Self::entry_key(key);
        let physical_ttl = scale(ttl, self.config.hard_expiry_factor.max(1.0));
        // Index before the entry becomes visible to readers.
        for tag in &entry.tags {
            self.tags.register(tag, &store_key, physical_ttl)?;
        }
        self.store.set(&store_key, &envelope, Some(physical_ttl))?;
        debug!(key, ttl_ms, tags = entry.tags.len(), "Cache entry stored");
        Ok(())
    }

    /// Invalidate a tag or a single key. Returns the number of entries removed.
    pub fn invalidate(&self, target: Invalidation) -> Result<usize, OperationError> {
        match target {
            Invalidation::Tag(tag) => Ok(self.tags.invalidate(&tag)?),
            Invalidation::Key(key) => Ok(usize::from(self.store.delete(&Self::entry_key(&key))?)),
        }
    }

    /// Invalidate several tags; returns the number of entries removed.
    pub fn invalidate_tags(&self, tags: &[String]) -> Result<usize, OperationError> {
        let mut removed = 0;
        for tag in tags {
            removed += self.tags.invalidate(tag)?;
        }
        Ok(removed)
    }

    /// Remove entries older than `stale_factor * ttl` and entries that no
    /// longer verify, then drop tag members whose entry is gone.
    pub fn evict_stale(&self) -> Result<SweepReport, OperationError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for store_key in self.store.keys_with_prefix(ENTRY_PREFIX)? {
            let key = &store_key[ENTRY_PREFIX.len()..];
            let Some(raw) = self.store.get(&store_key)? else {
                continue;
            };
            match self.verified_entry(key, &raw) {
                None => {
                    self.discard(key, "checksum mismatch")?;
                    report.corrupt_removed += 1;
                }
                Some(entry) => {
                    if entry.age(now) > scale(entry.ttl(), self.config.stale_factor)
                        && self.store.delete(&store_key)?
                    {
                        report.stale_removed += 1;
                    }
                }
            }
        }
        report.tag_members_pruned = self.prune_tags()?;
        Ok(report)
    }

    fn prune_tags(&self) -> Result<usize, OperationError> {
        let mut pruned = 0;
        for tag in self.tags.tags()? {
            pruned += self.tags.prune(&tag)?;
        }
        Ok(pruned)
    }

    /// Sweep when memory pressure reaches the threshold: stale entries first,
    /// then LRU eviction of cache entries down to the threshold.
    pub fn sweep_if_pressured(&self) -> Result<SweepReport, OperationError> {
        let threshold = self.config.memory_pressure_threshold;
        let usage = self.store.usage()?;
        if usage.max_bytes == 0 || usage.pressure() < threshold {
            return Ok(SweepReport::default());
        }

        let mut report = self.evict_stale()?;
        let usage = self.store.usage()?;
        if usage.pressure() >= threshold {
            let target = (usage.max_bytes as f64 * threshold) as usize;
            report.lru_evicted = self.store.evict_lru(ENTRY_PREFIX, target)?;
            if report.lru_evicted > 0 {
                report.tag_members_pruned += self.prune_tags()?;
            }
        }
        debug!(
            stale = report.stale_removed,
            corrupt = report.corrupt_removed,
            lru = report.lru_evicted,
            pruned = report.tag_members_pruned,
            "Cache sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditTrail, LogEscalation};
    use crate::clock::ManualClock;
    use crate::storage::{MemoryAuditStore, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        audit: Arc<MemoryAuditStore>,
        cache: SecureCache,
    }

    fn fixture_with_budget(max_bytes: usize) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone(), max_bytes));
        let audit = Arc::new(MemoryAuditStore::new());
        let trail = AuditTrail::new(audit.clone(), Arc::new(LogEscalation), clock.clone());
        let config = CacheConfig {
            lock: LockConfig {
                ttl: Duration::from_secs(30),
                retry_delay: Duration::from_millis(2),
                max_attempts: 2_000,
            },
            ..CacheConfig::default()
        };
        let cache = SecureCache::new(
            store.clone(),
            Cipher::from_secret(&[3u8; 32]).unwrap(),
            clock.clone(),
            config,
        )
        .with_audit(Arc::new(trail));
        Fixture {
            clock,
            store,
            audit,
            cache,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_budget(0)
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u64,
        name: String,
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn miss_then_hit() {
        let fx = fixture();
        let calls = AtomicUsize::new(0);
        let load = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(User {
                id: 42,
                name: "Ada".into(),
            })
        };

        let first: User = fx.cache.cached_get("user:42", HOUR, &[], load).unwrap();
        let second: User = fx.cache.cached_get("user:42", HOUR, &[], load).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stored_value_is_encrypted() {
        let fx = fixture();
        fx.cache
            .cached_get_bytes("secret", HOUR, &[], || Ok(b"plain-text-value".to_vec()))
            .unwrap();
        let raw = fx.store.get("cache:secret").unwrap().unwrap();
        let raw = String::from_utf8(raw).unwrap();
        assert!(!raw.contains("plain-text-value"));
        assert!(!raw.contains(&hex::encode(b"plain-text-value")));
    }

    #[test]
    fn fifty_concurrent_callers_share_one_computation() {
        let fx = fixture();
        let calls = AtomicUsize::new(0);

        let results: Vec<Vec<u8>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..50)
                .map(|_| {
                    scope.spawn(|| {
                        fx.cache
                            .cached_get_bytes("report:2026", HOUR, &["reports"], || {
                                calls.fetch_add(1, Ordering::SeqCst);
                                thread::sleep(Duration::from_millis(50));
                                Ok(uuid::Uuid::new_v4().as_bytes().to_vec())
                            })
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 50);
        assert!(results.iter().all(|r| r == &results[0]));
        assert!(fx.store.keys_with_prefix("lock:").unwrap().is_empty());
    }

    #[test]
    fn ten_workers_then_tag_invalidation_recomputes() {
        let fx = fixture();
        let calls = AtomicUsize::new(0);
        let load_user = || {
            calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            Ok(User {
                id: 42,
                name: "Ada".into(),
            })
        };

        thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    let user: User = fx
                        .cache
                        .cached_get("user:42", HOUR, &["users"], load_user)
                        .unwrap();
                    assert_eq!(user.id, 42);
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            fx.cache
                .invalidate(Invalidation::Tag("users".into()))
                .unwrap(),
            1
        );
        let _: User = fx
            .cache
            .cached_get("user:42", HOUR, &["users"], load_user)
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn tag_invalidation_misses_every_tagged_key() {
        let fx = fixture();
        for key in ["post:1", "post:2", "post:3"] {
            fx.cache
                .cached_get_bytes(key, HOUR, &["content"], || Ok(key.as_bytes().to_vec()))
                .unwrap();
        }
        fx.cache
            .cached_get_bytes("user:1", HOUR, &["users"], || Ok(b"u".to_vec()))
            .unwrap();

        assert_eq!(
            fx.cache
                .invalidate(Invalidation::Tag("content".into()))
                .unwrap(),
            3
        );

        let recomputed = AtomicUsize::new(0);
        for key in ["post:1", "post:2", "post:3", "user:1"] {
            fx.cache
                .cached_get_bytes(key, HOUR, &["content"], || {
                    recomputed.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                })
                .unwrap();
        }
        assert_eq!(recomputed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn invalidate_single_key() {
        let fx = fixture();
        fx.cache
            .cached_get_bytes("k", HOUR, &[], || Ok(b"v".to_vec()))
            .unwrap();
        assert_eq!(fx.cache.invalidate(Invalidation::Key("k".into())).unwrap(), 1);
        assert_eq!(fx.cache.invalidate(Invalidation::Key("k".into())).unwrap(), 0);
    }

    #[test]
    fn repeated_reads_are_byte_identical() {
        let fx = fixture();
        let first = fx
            .cache
            .cached_get_bytes("k", HOUR, &[], || Ok(uuid::Uuid::new_v4().as_bytes().to_vec()))
            .unwrap();
        for _ in 0..5 {
            let again = fx
                .cache
                .cached_get_bytes("k", HOUR, &[], || Ok(b"different".to_vec()))
                .unwrap();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn entries_expire_after_ttl() {
        let fx = fixture();
        fx.cache
            .cached_get_bytes("k", Duration::from_secs(60), &[], || Ok(b"old".to_vec()))
            .unwrap();

        fx.clock.advance(Duration::from_secs(59));
        let value = fx
            .cache
            .cached_get_bytes("k", Duration::from_secs(60), &[], || Ok(b"new".to_vec()))
            .unwrap();
        assert_eq!(value, b"old");

        fx.clock.advance(Duration::from_secs(1));
        let value = fx
            .cache
            .cached_get_bytes("k", Duration::from_secs(60), &[], || Ok(b"new".to_vec()))
            .unwrap();
        assert_eq!(value, b"new");
    }

    #[test]
    fn tampered_entry_is_discarded_audited_and_recomputed() {
        let fx = fixture();
        fx.cache
            .cached_get_bytes("user:42", HOUR, &[], || Ok(b"original".to_vec()))
            .unwrap();

        let raw = fx.store.get("cache:user:42").unwrap().unwrap();
        let mut envelope: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        envelope["metadata"]["ttl_ms"] = serde_json::json!(999_999_999u64);
        fx.store
            .set("cache:user:42", &serde_json::to_vec(&envelope).unwrap(), None)
            .unwrap();

        let value = fx
            .cache
            .cached_get_bytes("user:42", HOUR, &[], || Ok(b"recomputed".to_vec()))
            .unwrap();
        assert_eq!(value, b"recomputed");

        let records = fx.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "integrity_mismatch");
        assert_eq!(records[0].severity, Severity::Warning);
        assert_eq!(records[0].error_code.as_deref(), Some("integrity_error"));
    }

    #[test]
    fn entry_copied_to_another_key_is_rejected() {
        let fx = fixture();
        fx.cache
            .cached_get_bytes("a", HOUR, &[], || Ok(b"alpha".to_vec()))
            .unwrap();
        let raw = fx.store.get("cache:a").unwrap().unwrap();
        fx.store.set("cache:b", &raw, None).unwrap();

        let value = fx
            .cache
            .cached_get_bytes("b", HOUR, &[], || Ok(b"beta".to_vec()))
            .unwrap();
        assert_eq!(value, b"beta");
    }

    #[test]
    fn supplier_error_releases_lock_and_caches_nothing() {
        let fx = fixture();
        let err = fx
            .cache
            .cached_get_bytes("k", HOUR, &[], || Err(OperationError::TransientStorage))
            .unwrap_err();
        assert_eq!(err, OperationError::TransientStorage);
        assert!(fx.store.get("lock:k").unwrap().is_none());
        assert!(fx.store.get("cache:k").unwrap().is_none());
    }

    #[test]
    fn held_lock_exhausts_into_lock_acquisition() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock.clone(), 0));
        let config = CacheConfig {
            lock: LockConfig {
                ttl: Duration::from_secs(30),
                retry_delay: Duration::from_millis(1),
                max_attempts: 3,
            },
            ..CacheConfig::default()
        };
        let cache = SecureCache::new(
            store.clone(),
            Cipher::from_secret(&[3u8; 32]).unwrap(),
            clock,
            config,
        );
        store
            .set_if_absent("lock:k", b"someone-else", Duration::from_secs(30))
            .unwrap();

        let err = cache
            .cached_get_bytes("k", HOUR, &[], || Ok(b"v".to_vec()))
            .unwrap_err();
        assert!(matches!(err, OperationError::LockAcquisition { attempts: 3, .. }));
    }

    #[test]
    fn rejects_empty_key_and_zero_ttl() {
        let fx = fixture();
        assert!(matches!(
            fx.cache.cached_get_bytes("", HOUR, &[], || Ok(Vec::new())),
            Err(OperationError::Validation(_))
        ));
        assert!(matches!(
            fx.cache.cached_get_bytes("k", Duration::ZERO, &[], || Ok(Vec::new())),
            Err(OperationError::Validation(_))
        ));
    }

    #[test]
    fn stale_sweep_removes_old_entries_only() {
        let fx = fixture();
        fx.cache
            .cached_get_bytes("short", Duration::from_secs(10), &[], || Ok(b"s".to_vec()))
            .unwrap();
        fx.cache
            .cached_get_bytes("long", HOUR, &[], || Ok(b"l".to_vec()))
            .unwrap();

        fx.clock.advance(Duration::from_secs(16));
        let report = fx.cache.evict_stale().unwrap();
        assert_eq!(report.stale_removed, 1);
        assert!(fx.store.get("cache:short").unwrap().is_none());
        assert!(fx.store.get("cache:long").unwrap().is_some());
    }

    #[test]
    fn pressure_sweep_evicts_down_to_threshold() {
        let fx = fixture_with_budget(4_000);
        for i in 0..12 {
            let key = format!("item:{i}");
            fx.cache
                .cached_get_bytes(&key, HOUR, &[], || Ok(vec![0u8; 200]))
                .unwrap();
        }

        let usage = fx.store.usage().unwrap();
        assert!(usage.pressure() <= fx.cache.config().memory_pressure_threshold);
        assert!(fx.store.keys_with_prefix("cache:").unwrap().len() < 12);
    }

    #[test]
    fn short_lived_keys_do_not_grow_the_tag_index() {
        let fx = fixture_with_budget(20_000);
        for i in 0..2_000 {
            let key = format!("user:{i}");
            fx.cache
                .cached_get_bytes(&key, Duration::from_secs(1), &["users"], || {
                    Ok(b"profile".to_vec())
                })
                .unwrap();
            fx.clock.advance(Duration::from_secs(5));
        }
        assert!(fx.cache.tags.members("users").unwrap().len() <= 1);
        assert!(fx.store.usage().unwrap().pressure() < 0.5);

        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            fx.cache
                .cached_get_bytes("hot", HOUR, &[], || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(b"hot".to_vec())
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_sweep_prunes_tag_members_of_removed_entries() {
        let fx = fixture();
        for key in ["page:1", "page:2"] {
            fx.cache
                .cached_get_bytes(key, HOUR, &["pages"], || Ok(b"p".to_vec()))
                .unwrap();
        }
        fx.cache
            .invalidate(Invalidation::Key("page:1".to_string()))
            .unwrap();

        let report = fx.cache.evict_stale().unwrap();
        assert_eq!(report.tag_members_pruned, 1);
        assert_eq!(fx.cache.tags.members("pages").unwrap(), vec!["cache:page:2"]);

        fx.cache
            .invalidate(Invalidation::Key("page:2".to_string()))
            .unwrap();
        fx.cache.evict_stale().unwrap();
        assert!(fx.store.keys_with_prefix("tags:").unwrap().is_empty());
    }

    #[test]
    fn tag_is_indexed_once_the_entry_is_visible() {
        let fx = fixture();
        fx.cache
            .cached_get_bytes("page:9", HOUR, &["pages"], || Ok(b"p".to_vec()))
            .unwrap();
        assert_eq!(fx.cache.tags.members("pages").unwrap(), vec!["cache:page:9"]);
        assert!(fx.store.ttl("tags:pages").unwrap().is_some());
    }
}
