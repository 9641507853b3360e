// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Tag → cache key index.
//!
//! Each tag is a set in the shared store at `tags:{tag}` holding the cache keys
//! registered under it. Invalidating a tag deletes every member entry first and
//! the index last, so a crash mid-way leaves a re-runnable invalidation rather
//! than orphaned entries.
//!
//! A tag set expires together with its longest-lived member, and
//! [`TagIndex::prune`] drops members whose entry is already gone.

use std::sync::Arc;
use std::time::Duration;

use crate::storage::{SharedStore, StoreResult};

const TAG_PREFIX: &str = "tags:";

pub struct TagIndex {
    store: Arc<dyn SharedStore>,
}

impl TagIndex {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    fn index_key(tag: &str) -> String {
        format!("{TAG_PREFIX}{tag}")
    }

    /// Register `store_key` (the full shared-store key) under `tag`, keeping
    /// the tag alive for at least `ttl`.
    pub fn register(&self, tag: &str, store_key: &str, ttl: Duration) -> StoreResult<()> {
        self.store.set_add(&Self::index_key(tag), store_key, Some(ttl))
    }

    /// Every tag with a live index.
    pub fn tags(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .store
            .keys_with_prefix(TAG_PREFIX)?
            .into_iter()
            .map(|key| key[TAG_PREFIX.len()..].to_string())
            .collect())
    }

    /// Drop members of `tag` whose entry no longer exists. Returns how many
    /// were dropped.
    pub fn prune(&self, tag: &str) -> StoreResult<usize> {
        let mut gone = Vec::new();
        for key in self.members(tag)? {
            if self.store.get(&key)?.is_none() {
                gone.push(key);
            }
        }
        if gone.is_empty() {
            return Ok(0);
        }
        self.store.set_remove(&Self::index_key(tag), &gone)
    }

    pub fn members(&self, tag: &str) -> StoreResult<Vec<String>> {
        self.store.set_members(&Self::index_key(tag))
    }

    /// Delete every key registered under `tag`, then the tag itself.
    ///
    /// Returns the number of entries that were still live.
    pub fn invalidate(&self, tag: &str) -> StoreResult<usize> {
        let mut removed = 0;
        for key in self.members(tag)? {
            if self.store.delete(&key)? {
                removed += 1;
            }
        }
        self.store.delete(&Self::index_key(tag))?;
        tracing::debug!(tag, removed, "Invalidated cache tag");
        Ok(removed)
    }
}

impl std::fmt::Debug for TagIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagIndex").finish_non_exhaustive()
    }
}
