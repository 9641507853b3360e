// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! opguard - Protected Operation Framework
//!
//! Wraps every state-changing action of a content backend in the same
//! discipline: admission by a security gate, transactional execution with
//! bounded retries, result validation, and an audit record per outcome.
//! Read paths share an encrypted, tamper-evident cache that computes each
//! value once under concurrent load.
//!
//! ## Modules
//!
//! - `operation` - Executor, operation contract, retry policy, metrics
//! - `auth` - Identity, permissions, security gate, rate limiting/lockout
//! - `cache` - Secure cache, distributed lock, tag index, stale sweep
//! - `audit` - Audit trail, redaction, escalation (channel, webhook)
//! - `storage` - Shared key-value store, redb transactional store, audit stores
//! - `config` / `telemetry` / `state` - Environment config, logging, wiring

pub mod audit;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod operation;
pub mod state;
pub mod storage;
pub mod telemetry;

pub use error::{OperationError, Severity, Violation};
pub use operation::{
    CriticalOperation, OperationExecutor, OperationResult, OperationScope, ValidationRules,
};
pub use state::{Framework, FrameworkError};
