// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process [`SharedStore`] backed by an LRU map.
//!
//! All operations take a single mutex, which makes each of them atomic for
//! every thread sharing the store. Expiry is lazy: an expired key is dropped
//! the next time it is touched, and keeps counting toward memory usage until
//! then (or until an LRU eviction removes it).

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;

use super::shared::{SharedStore, StoreError, StoreResult, StoreUsage};
use crate::clock::{add_duration, elapsed_between, Clock};

/// Fixed bookkeeping overhead charged per key.
const SLOT_OVERHEAD: usize = 48;

#[derive(Debug, Clone)]
enum StoredValue {
    Bytes(Vec<u8>),
    Counter(u64),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: StoredValue,
    expires_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn footprint(&self, key: &str) -> usize {
        let value = match &self.value {
            StoredValue::Bytes(bytes) => bytes.len(),
            StoredValue::Counter(_) => 8,
            StoredValue::Set(members) => members.iter().map(String::len).sum(),
        };
        key.len() + value + SLOT_OVERHEAD
    }
}

/// Shared store living in this process.
#[derive(Debug)]
pub struct MemoryStore {
    slots: Mutex<LruCache<String, Slot>>,
    clock: Arc<dyn Clock>,
    max_bytes: usize,
}

impl MemoryStore {
    /// Create a store with a memory budget (0 = unbounded accounting).
    pub fn new(clock: Arc<dyn Clock>, max_bytes: usize) -> Self {
        Self {
            slots: Mutex::new(LruCache::unbounded()),
            clock,
            max_bytes,
        }
    }

    fn slots(&self) -> StoreResult<MutexGuard<'_, LruCache<String, Slot>>> {
        self.slots
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Fetch a live slot, dropping it if it has expired.
    fn live<'a>(
        slots: &'a mut LruCache<String, Slot>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a mut Slot> {
        if slots.peek(key).is_some_and(|slot| slot.is_expired(now)) {
            slots.pop(key);
            return None;
        }
        slots.get_mut(key)
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| add_duration(self.clock.now(), ttl))
    }
}

impl SharedStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = self.clock.now();
        let mut slots = self.slots()?;
        match Self::live(&mut slots, key, now) {
            Some(Slot {
                value: StoredValue::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = self.expiry(ttl);
        let mut slots = self.slots()?;
        slots.put(
            key.to_string(),
            Slot {
                value: StoredValue::Bytes(value.to_vec()),
                expires_at,
            },
        );
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut slots = self.slots()?;
        if Self::live(&mut slots, key, now).is_some() {
            return Ok(false);
        }
        slots.put(
            key.to_string(),
            Slot {
                value: StoredValue::Bytes(value.to_vec()),
                expires_at: Some(add_duration(now, ttl)),
            },
        );
        Ok(true)
    }

    fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let now = self.clock.now();
        let mut slots = self.slots()?;
        match Self::live(&mut slots, key, now) {
            Some(Slot {
                value: StoredValue::Counter(count),
                ..
            }) => {
                *count = count.saturating_add(1);
                Ok(*count)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => {
                slots.put(
                    key.to_string(),
                    Slot {
                        value: StoredValue::Counter(1),
                        expires_at: Some(add_duration(now, ttl)),
                    },
                );
                Ok(1)
            }
        }
    }

    fn counter(&self, key: &str) -> StoreResult<u64> {
        let now = self.clock.now();
        let mut slots = self.slots()?;
        match Self::live(&mut slots, key, now) {
            Some(Slot {
                value: StoredValue::Counter(count),
                ..
            }) => Ok(*count),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(0),
        }
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut slots = self.slots()?;
        Ok(slots
            .pop(key)
            .is_some_and(|slot| !slot.is_expired(now)))
    }

    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut slots = self.slots()?;
        let matches = matches!(
            Self::live(&mut slots, key, now),
            Some(Slot { value: StoredValue::Bytes(current), .. }) if current.as_slice() == expected
        );
        if matches {
            slots.pop(key);
        }
        Ok(matches)
    }

    fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = self.clock.now();
        let wanted = ttl.map(|ttl| add_duration(now, ttl));
        let mut slots = self.slots()?;
        match Self::live(&mut slots, key, now) {
            Some(Slot {
                value: StoredValue::Set(members),
                expires_at,
            }) => {
                members.insert(member.to_string());
                if let (Some(current), Some(wanted)) = (*expires_at, wanted) {
                    *expires_at = Some(current.max(wanted));
                }
                Ok(())
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => {
                let mut members = BTreeSet::new();
                members.insert(member.to_string());
                slots.put(
                    key.to_string(),
                    Slot {
                        value: StoredValue::Set(members),
                        expires_at: wanted,
                    },
                );
                Ok(())
            }
        }
    }

    fn set_remove(&self, key: &str, members: &[String]) -> StoreResult<usize> {
        let now = self.clock.now();
        let mut slots = self.slots()?;
        let (removed, empty) = match Self::live(&mut slots, key, now) {
            Some(Slot {
                value: StoredValue::Set(set),
                ..
            }) => {
                let removed = members.iter().filter(|m| set.remove(m.as_str())).count();
                (removed, set.is_empty())
            }
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
            None => return Ok(0),
        };
        if empty {
            slots.pop(key);
        }
        Ok(removed)
    }

    fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now();
        let mut slots = self.slots()?;
        match Self::live(&mut slots, key, now) {
            Some(Slot {
                value: StoredValue::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = self.clock.now();
        let slots = self.slots()?;
        Ok(slots
            .peek(key)
            .filter(|slot| !slot.is_expired(now))
            .and_then(|slot| slot.expires_at)
            .map(|at| elapsed_between(now, at)))
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now();
        let slots = self.slots()?;
        Ok(slots
            .iter()
            .filter(|(key, slot)| key.starts_with(prefix) && !slot.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn usage(&self) -> StoreResult<StoreUsage> {
        let now = self.clock.now();
        let slots = self.slots()?;
        let (used_bytes, keys) = slots
            .iter()
            .filter(|(_, slot)| !slot.is_expired(now))
            .fold((0, 0), |(bytes, keys), (key, slot)| {
                (bytes + slot.footprint(key), keys + 1)
            });
        Ok(StoreUsage {
            used_bytes,
            max_bytes: self.max_bytes,
            keys,
        })
    }

    fn evict_lru(&self, prefix: &str, target_bytes: usize) -> StoreResult<usize> {
        let now = self.clock.now();
        let mut slots = self.slots()?;
        let expired: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| slot.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            slots.pop(key);
        }
        let mut used: usize = slots.iter().map(|(key, slot)| slot.footprint(key)).sum();
        if used <= target_bytes {
            return Ok(0);
        }

        // Least recently used first.
        let candidates: Vec<(String, usize)> = slots
            .iter()
            .rev()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, slot)| (key.clone(), slot.footprint(key)))
            .collect();

        let mut evicted = 0;
        for (key, footprint) in candidates {
            if used <= target_bytes {
                break;
            }
            slots.pop(&key);
            used = used.saturating_sub(footprint);
            evicted += 1;
        }
        if evicted > 0 {
            tracing::debug!(prefix, evicted, used_bytes = used, "LRU eviction");
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = MemoryStore::new(clock.clone(), 0);
        (clock, store)
    }

    #[test]
    fn set_and_get_until_expiry() {
        let (clock, store) = store();
        store.set("k", b"v", Some(Duration::from_secs(10))).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn set_if_absent_respects_live_values() {
        let (clock, store) = store();
        assert!(store.set_if_absent("lock", b"a", Duration::from_secs(5)).unwrap());
        assert!(!store.set_if_absent("lock", b"b", Duration::from_secs(5)).unwrap());
        assert_eq!(store.get("lock").unwrap(), Some(b"a".to_vec()));

        clock.advance(Duration::from_secs(6));
        assert!(store.set_if_absent("lock", b"b", Duration::from_secs(5)).unwrap());
        assert_eq!(store.get("lock").unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn increment_window_is_fixed_by_first_increment() {
        let (clock, store) = store();
        assert_eq!(store.increment("c", Duration::from_secs(60)).unwrap(), 1);
        clock.advance(Duration::from_secs(30));
        assert_eq!(store.increment("c", Duration::from_secs(60)).unwrap(), 2);

        // Later increments do not push the window out.
        clock.advance(Duration::from_secs(30));
        assert_eq!(store.counter("c").unwrap(), 0);
        assert_eq!(store.increment("c", Duration::from_secs(60)).unwrap(), 1);
    }

    #[test]
    fn delete_if_equals_compares_value() {
        let (_clock, store) = store();
        store.set("lock", b"owner-a", None).unwrap();

        assert!(!store.delete_if_equals("lock", b"owner-b").unwrap());
        assert!(store.get("lock").unwrap().is_some());

        assert!(store.delete_if_equals("lock", b"owner-a").unwrap());
        assert!(store.get("lock").unwrap().is_none());
    }

    #[test]
    fn sets_collect_unique_members() {
        let (_clock, store) = store();
        store.set_add("tag", "a", None).unwrap();
        store.set_add("tag", "b", None).unwrap();
        store.set_add("tag", "a", None).unwrap();
        assert_eq!(store.set_members("tag").unwrap(), vec!["a", "b"]);
        assert!(store.set_members("missing").unwrap().is_empty());
    }

    #[test]
    fn set_expiry_only_grows() {
        let (clock, store) = store();
        store.set_add("tag", "a", Some(Duration::from_secs(10))).unwrap();
        store.set_add("tag", "b", Some(Duration::from_secs(2))).unwrap();
        assert_eq!(store.ttl("tag").unwrap(), Some(Duration::from_secs(10)));

        clock.advance(Duration::from_secs(10));
        assert!(store.set_members("tag").unwrap().is_empty());
    }

    #[test]
    fn set_remove_deletes_emptied_set() {
        let (_clock, store) = store();
        store.set_add("tag", "a", None).unwrap();
        store.set_add("tag", "b", None).unwrap();

        let gone = vec!["a".to_string(), "missing".to_string()];
        assert_eq!(store.set_remove("tag", &gone).unwrap(), 1);
        assert_eq!(store.set_members("tag").unwrap(), vec!["b"]);

        assert_eq!(store.set_remove("tag", &["b".to_string()]).unwrap(), 1);
        assert_eq!(store.usage().unwrap().keys, 0);
        assert_eq!(store.set_remove("tag", &["b".to_string()]).unwrap(), 0);
    }

    #[test]
    fn usage_ignores_expired_slots() {
        let (clock, store) = store();
        store.set("cache:a", b"1", Some(Duration::from_secs(1))).unwrap();
        store.set("cache:b", b"2", None).unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(store.usage().unwrap().keys, 1);
    }

    #[test]
    fn wrong_type_is_reported() {
        let (_clock, store) = store();
        store.set("bytes", b"x", None).unwrap();
        assert!(matches!(
            store.increment("bytes", Duration::from_secs(1)),
            Err(StoreError::WrongType(_))
        ));
    }

    #[test]
    fn keys_with_prefix_skips_expired() {
        let (clock, store) = store();
        store.set("cache:a", b"1", Some(Duration::from_secs(1))).unwrap();
        store.set("cache:b", b"2", None).unwrap();
        store.set("other", b"3", None).unwrap();

        let mut keys = store.keys_with_prefix("cache:").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cache:a", "cache:b"]);

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.keys_with_prefix("cache:").unwrap(), vec!["cache:b"]);
    }

    #[test]
    fn ttl_reports_remaining_time() {
        let (clock, store) = store();
        store.set("k", b"v", Some(Duration::from_secs(10))).unwrap();
        clock.advance(Duration::from_secs(4));
        assert_eq!(store.ttl("k").unwrap(), Some(Duration::from_secs(6)));
        store.set("forever", b"v", None).unwrap();
        assert_eq!(store.ttl("forever").unwrap(), None);
    }

    #[test]
    fn evict_lru_removes_least_recent_first() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = MemoryStore::new(clock, 1_000);
        store.set("c:a", &[0u8; 100], None).unwrap();
        store.set("c:b", &[0u8; 100], None).unwrap();
        store.set("c:c", &[0u8; 100], None).unwrap();

        // Touch "c:a" so "c:b" becomes the least recently used.
        store.get("c:a").unwrap();

        let one_slot = 3 + 100 + SLOT_OVERHEAD;
        let evicted = store.evict_lru("c:", 2 * one_slot).unwrap();
        assert_eq!(evicted, 1);
        assert!(store.get("c:b").unwrap().is_none());
        assert!(store.get("c:a").unwrap().is_some());
        assert!(store.get("c:c").unwrap().is_some());
    }

    #[test]
    fn evict_lru_spares_keys_outside_prefix() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = MemoryStore::new(clock, 1_000);
        store.set("rate:lockout:ip:1", &[0u8; 100], None).unwrap();
        store.set("c:a", &[0u8; 100], None).unwrap();

        assert_eq!(store.evict_lru("c:", 0).unwrap(), 1);
        assert!(store.get("rate:lockout:ip:1").unwrap().is_some());
        assert!(store.get("c:a").unwrap().is_none());
    }

    #[test]
    fn concurrent_increments_are_atomic() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(clock, 0));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let store = store.clone();
                scope.spawn(move || {
                    for _ in 0..100 {
                        store.increment("hits", Duration::from_secs(60)).unwrap();
                    }
                });
            }
        });

        assert_eq!(store.counter("hits").unwrap(), 800);
    }
}
