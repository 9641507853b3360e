// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Protected Operations
//!
//! A [`CriticalOperation`] is a command object: it names itself, declares the
//! permissions it needs and the rules its result must satisfy, and carries a
//! body. The [`OperationExecutor`] runs the body inside a transaction through
//! an [`OperationScope`]:
//!
//! ```text
//! gate ─► validate_input ─► begin ─► body ─► result rules ─► commit ─► audit
//!                                     ▲         │
//!                                     └─retry───┘ (transient storage only)
//! ```
//!
//! Bodies read and write through the scope only. Anything written is visible
//! to other callers after commit, never before.

pub mod executor;
pub mod metrics;
pub mod retry;

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::auth::{OperationContext, PermissionSet};
use crate::cache::SecureCache;
use crate::error::{OperationError, Violation};
use crate::storage::StoreTransaction;

pub use executor::{ExecutorConfig, OperationExecutor};
pub use metrics::{MetricsRecorder, MetricsSpan, OperationStats, SpanOutcome};
pub use retry::RetryPolicy;

// =============================================================================
// Results & Validation
// =============================================================================

/// What a body produced, plus its own verdict about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult<T> {
    pub value: T,
    pub valid: bool,
    pub diagnostics: BTreeMap<String, String>,
}

impl<T> OperationResult<T> {
    pub fn valid(value: T) -> Self {
        Self {
            value,
            valid: true,
            diagnostics: BTreeMap::new(),
        }
    }

    /// A result the body itself considers unacceptable; it is never committed.
    pub fn invalid(value: T, diagnostics: BTreeMap<String, String>) -> Self {
        Self {
            value,
            valid: false,
            diagnostics,
        }
    }

    pub fn with_diagnostic(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.diagnostics.insert(key.into(), value.into());
        self
    }
}

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Rule<T> {
    field: String,
    message: String,
    predicate: Predicate<T>,
}

/// Named domain rules checked against a body's result before commit.
pub struct ValidationRules<T> {
    rules: Vec<Rule<T>>,
}

impl<T> Default for ValidationRules<T> {
    fn default() -> Self {
        Self { rules: Vec::new() }
    }
}

impl<T> std::fmt::Debug for ValidationRules<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| &r.field))
            .finish()
    }
}

impl<T> ValidationRules<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule; `predicate` returns whether the result is acceptable.
    pub fn rule(
        mut self,
        field: impl Into<String>,
        message: impl Into<String>,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.rules.push(Rule {
            field: field.into(),
            message: message.into(),
            predicate: Box::new(predicate),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Every rule the value breaks, in declaration order.
    pub fn check(&self, value: &T) -> Vec<Violation> {
        self.rules
            .iter()
            .filter(|rule| !(rule.predicate)(value))
            .map(|rule| Violation::new(rule.field.clone(), rule.message.clone()))
            .collect()
    }
}

// =============================================================================
// Operation Contract
// =============================================================================

/// A state-changing action run by the [`OperationExecutor`].
pub trait CriticalOperation {
    type Output: Serialize;

    /// Stable name, used for auditing, metrics and the default rate key.
    fn operation_type(&self) -> &str;

    /// Input summary recorded (redacted) with the audit record.
    fn payload(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn required_permissions(&self) -> PermissionSet;

    fn validation_rules(&self) -> ValidationRules<Self::Output> {
        ValidationRules::new()
    }

    fn rate_limit_key(&self) -> String {
        self.operation_type().to_string()
    }

    /// Checked before any transaction is opened.
    fn validate_input(&self) -> Result<(), OperationError> {
        Ok(())
    }

    /// The body. May run more than once when storage is contended, each time
    /// against a fresh transaction.
    fn execute(
        &self,
        scope: &mut OperationScope<'_>,
    ) -> Result<OperationResult<Self::Output>, OperationError>;
}

// =============================================================================
// Scope
// =============================================================================

/// What a body sees of the world during one attempt.
pub struct OperationScope<'a> {
    txn: &'a mut dyn StoreTransaction,
    context: &'a OperationContext,
    operation_id: &'a str,
    attempt: u32,
    cache: Option<&'a SecureCache>,
    invalidations: Vec<String>,
    writes: usize,
}

/// Side effects an attempt asked for, applied only when it commits.
#[derive(Debug, Default)]
pub(crate) struct ScopeEffects {
    pub invalidations: Vec<String>,
    pub writes: usize,
}

impl std::fmt::Debug for OperationScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationScope")
            .field("operation_id", &self.operation_id)
            .field("attempt", &self.attempt)
            .field("writes", &self.writes)
            .finish_non_exhaustive()
    }
}

impl<'a> OperationScope<'a> {
    pub(crate) fn new(
        txn: &'a mut dyn StoreTransaction,
        context: &'a OperationContext,
        operation_id: &'a str,
        attempt: u32,
        cache: Option<&'a SecureCache>,
    ) -> Self {
        Self {
            txn,
            context,
            operation_id,
            attempt,
            cache,
            invalidations: Vec::new(),
            writes: 0,
        }
    }

    pub fn context(&self) -> &OperationContext {
        self.context
    }

    pub fn operation_id(&self) -> &str {
        self.operation_id
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The secure cache, when the executor was given one.
    pub fn cache(&self) -> Option<&SecureCache> {
        self.cache
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn get_raw(
        &mut self,
        collection: &str,
        key: &str,
    ) -> Result<Option<Vec<u8>>, OperationError> {
        Ok(self.txn.get(collection, key)?)
    }

    pub fn put_raw(
        &mut self,
        collection: &str,
        key: &str,
        value: &[u8],
    ) -> Result<(), OperationError> {
        self.txn.put(collection, key, value)?;
        self.writes += 1;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(
        &mut self,
        collection: &str,
        key: &str,
    ) -> Result<Option<T>, OperationError> {
        match self.get_raw(collection, key)? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                warn!(collection, key, error = %e, "Stored record does not decode");
                OperationError::Internal
            }),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(
        &mut self,
        collection: &str,
        key: &str,
        value: &T,
    ) -> Result<(), OperationError> {
        let bytes = serde_json::to_vec(value).map_err(|e| {
            warn!(collection, key, error = %e, "Record does not serialize");
            OperationError::Internal
        })?;
        self.put_raw(collection, key, &bytes)
    }

    /// Returns whether a record was removed.
    pub fn delete(&mut self, collection: &str, key: &str) -> Result<bool, OperationError> {
        let removed = self.txn.delete(collection, key)?;
        if removed {
            self.writes += 1;
        }
        Ok(removed)
    }

    /// Invalidate a cache tag once this attempt commits. Dropped on rollback.
    pub fn invalidate_tag_on_commit(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.invalidations.contains(&tag) {
            self.invalidations.push(tag);
        }
    }

    pub(crate) fn into_effects(self) -> ScopeEffects {
        ScopeEffects {
            invalidations: self.invalidations,
            writes: self.writes,
        }
    }
}
