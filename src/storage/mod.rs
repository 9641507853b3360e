// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Module
//!
//! The three stores the framework coordinates through:
//!
//! - **Shared key-value store** ([`SharedStore`]): cache entries, lock
//!   records, tag index sets and rate counters. Must provide atomic
//!   set-if-absent, increment-with-expiry and delete-if-equals.
//!   [`MemoryStore`] is the in-process implementation.
//! - **Transactional store** ([`TransactionalStore`]): side effects of
//!   operation bodies, committed or rolled back as a unit. [`RedbStore`] is
//!   the embedded implementation.
//! - **Audit store** ([`AuditStore`]): append-only record of every outcome.
//!
//! ## Layout
//!
//! ```text
//! shared store keys:
//!   cache:{key}            # encrypted cache entry (JSON envelope)
//!   lock:{key}             # owner token of the stampede lock
//!   tags:{tag}             # set of cache keys registered under a tag
//!   rate:attempts:{id}     # attempt counter for the current window
//!   rate:failures:{id}     # failure counter for the current window
//!   rate:lockout:{id}      # lockout-until timestamp (millis)
//! ```

pub mod audit;
pub mod memory;
pub mod paths;
pub mod shared;
pub mod tx_database;

pub use audit::{
    AuditOutcome, AuditRecord, AuditStore, AuditStoreError, AuditStoreResult, JsonlAuditStore,
    MemoryAuditStore,
};
pub use memory::MemoryStore;
pub use paths::StoragePaths;
pub use shared::{SharedStore, StoreError, StoreResult, StoreUsage};
pub use tx_database::{RedbStore, StoreTransaction, TransactionalStore};
