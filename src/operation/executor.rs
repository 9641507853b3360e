// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! The single entry point for protected operations.
//!
//! ## Flow
//!
//! 1. Nested invocations on the same thread are refused outright.
//! 2. The [`SecurityGate`] admits or rejects the context. A rejection has
//!    already been audited by the gate and is returned as is.
//! 3. `validate_input()`.
//! 4. The body runs inside a fresh transaction. Transient storage errors
//!    roll back and re-run the whole body with exponential backoff.
//! 5. The result is checked against the body's own verdict and the
//!    operation's rules; a rejected result is rolled back.
//! 6. Commit, then deferred cache invalidations, then one audit record.
//!
//! A `CriticalSecurity` failure is audited as critical (and therefore
//! escalated). With lockdown enabled the actor and origin are locked out.

use std::cell::Cell;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::metrics::{MetricsRecorder, MetricsSpan, SpanOutcome};
use super::retry::RetryPolicy;
use super::{CriticalOperation, OperationResult, OperationScope, ScopeEffects};
use crate::audit::{AuditRecorder, AuditSubject};
use crate::auth::{GateRequest, OperationContext, RateLimiter, SecurityGate};
use crate::cache::SecureCache;
use crate::error::{OperationError, Violation};
use crate::storage::{StoreError, StoreTransaction, TransactionalStore};

thread_local! {
    static ACTIVE_OPERATION: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a protected operation.
struct ActiveOperation;

impl ActiveOperation {
    fn enter() -> Option<Self> {
        ACTIVE_OPERATION.with(|active| {
            if active.replace(true) {
                None
            } else {
                Some(ActiveOperation)
            }
        })
    }
}

impl Drop for ActiveOperation {
    fn drop(&mut self) {
        ACTIVE_OPERATION.with(|active| active.set(false));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Lock out the actor and origin after a `CriticalSecurity` failure.
    pub lockdown_on_critical: bool,
    pub lockdown_duration: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            lockdown_on_critical: false,
            lockdown_duration: Duration::from_secs(15 * 60),
        }
    }
}

struct Committed<T> {
    result: OperationResult<T>,
    invalidations: Vec<String>,
    attempts: u32,
}

pub struct OperationExecutor {
    store: Arc<dyn TransactionalStore>,
    gate: Arc<dyn SecurityGate>,
    audit: Arc<dyn AuditRecorder>,
    metrics: Arc<MetricsRecorder>,
    cache: Option<Arc<SecureCache>>,
    limiter: Option<Arc<RateLimiter>>,
    retry: RetryPolicy,
    config: ExecutorConfig,
}

impl std::fmt::Debug for OperationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationExecutor")
            .field("retry", &self.retry)
            .field("config", &self.config)
            .field("cache", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

fn storage_error(operation_id: &str, action: &str, err: StoreError) -> OperationError {
    if err.is_transient() {
        debug!(operation_id, action, error = %err, "Transient storage error");
    } else {
        error!(operation_id, action, error = %err, "Storage error");
    }
    err.into()
}

fn rollback(txn: Box<dyn StoreTransaction>, operation_id: &str) {
    if let Err(e) = txn.rollback() {
        error!(operation_id, error = %e, "Rollback failed");
    }
}

impl OperationExecutor {
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        gate: Arc<dyn SecurityGate>,
        audit: Arc<dyn AuditRecorder>,
    ) -> Self {
        Self {
            store,
            gate,
            audit,
            metrics: Arc::new(MetricsRecorder::new()),
            cache: None,
            limiter: None,
            retry: RetryPolicy::default(),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Cache handed to bodies and invalidated after commit.
    pub fn with_cache(mut self, cache: Arc<SecureCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Rate limiter used for lockdown after critical failures.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    /// Run a protected operation on behalf of `context`.
    pub fn execute<O>(
        &self,
        operation: &O,
        context: &OperationContext,
    ) -> Result<OperationResult<O::Output>, OperationError>
    where
        O: CriticalOperation + ?Sized,
    {
        let operation_type = operation.operation_type();
        let Some(_active) = ActiveOperation::enter() else {
            warn!(operation_type, "Rejected nested protected operation");
            return Err(OperationError::NestedOperation);
        };

        let started = Instant::now();
        let operation_id = Uuid::new_v4().to_string();
        let required = operation.required_permissions();
        let rate_limit_key = operation.rate_limit_key();

        self.gate.validate(
            context,
            &GateRequest {
                operation_id: &operation_id,
                operation_type,
                required: &required,
                rate_limit_key: &rate_limit_key,
            },
        )?;

        let subject = AuditSubject::for_operation(&operation_id, operation_type, context);
        if let Err(err) = operation.validate_input() {
            debug!(operation_id = %operation_id, operation_type, error = %err, "Input rejected");
            self.audit.log_failure(&subject, &err, started.elapsed());
            return Err(err);
        }

        let mut span = self.metrics.start(operation_type);
        match self.run(operation, context, &operation_id, &mut span, started) {
            Ok(committed) => {
                self.apply_invalidations(&operation_id, &committed.invalidations);
                let writes = span.writes();
                let duration = span.finish(SpanOutcome::Success);
                let result = serde_json::to_value(&committed.result.value).unwrap_or_else(|e| {
                    warn!(
                        operation_id = %operation_id,
                        error = %e,
                        "Result does not serialize for audit"
                    );
                    serde_json::Value::Null
                });
                self.audit.log_success(
                    &subject,
                    duration,
                    serde_json::json!({
                        "payload": operation.payload(),
                        "result": result,
                        "attempts": committed.attempts,
                        "writes": writes,
                    }),
                );
                info!(
                    operation_id = %operation_id,
                    operation_type,
                    attempts = committed.attempts,
                    duration_ms = duration.as_millis() as u64,
                    "Operation committed"
                );
                Ok(committed.result)
            }
            Err(err) => {
                let duration = span.finish(SpanOutcome::Failure);
                self.audit.log_failure(&subject, &err, duration);
                if matches!(err, OperationError::CriticalSecurity(_)) {
                    self.lockdown(context);
                }
                warn!(
                    operation_id = %operation_id,
                    operation_type,
                    error_code = err.error_code(),
                    duration_ms = duration.as_millis() as u64,
                    "Operation failed"
                );
                Err(err)
            }
        }
    }

    /// Attempt loop: re-runs the body on transient storage errors.
    fn run<O>(
        &self,
        operation: &O,
        context: &OperationContext,
        operation_id: &str,
        span: &mut MetricsSpan<'_>,
        started: Instant,
    ) -> Result<Committed<O::Output>, OperationError>
    where
        O: CriticalOperation + ?Sized,
    {
        let mut attempt = 1;
        loop {
            match self.attempt(operation, context, operation_id, attempt) {
                Ok((result, effects)) => {
                    span.add_writes(effects.writes);
                    return Ok(Committed {
                        result,
                        invalidations: effects.invalidations,
                        attempts: attempt,
                    });
                }
                Err(err) if err.is_retryable() && self.retry.allows_retry_after(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    if self.retry.exceeds_ceiling(started.elapsed(), delay) {
                        warn!(operation_id, attempt, "Retry would exceed the maximum duration");
                        return Err(OperationError::DeadlineExceeded);
                    }
                    debug!(
                        operation_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after transient storage error"
                    );
                    span.record_retry();
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One transaction: body, result checks, commit or rollback.
    fn attempt<O>(
        &self,
        operation: &O,
        context: &OperationContext,
        operation_id: &str,
        attempt: u32,
    ) -> Result<(OperationResult<O::Output>, ScopeEffects), OperationError>
    where
        O: CriticalOperation + ?Sized,
    {
        let mut txn = self
            .store
            .begin()
            .map_err(|e| storage_error(operation_id, "begin", e))?;

        let (outcome, effects) = {
            let mut scope = OperationScope::new(
                txn.as_mut(),
                context,
                operation_id,
                attempt,
                self.cache.as_deref(),
            );
            let outcome = operation.execute(&mut scope);
            (outcome, scope.into_effects())
        };

        match outcome.and_then(|result| verify(operation, result)) {
            Ok(result) => {
                txn.commit()
                    .map_err(|e| storage_error(operation_id, "commit", e))?;
                Ok((result, effects))
            }
            Err(err) => {
                rollback(txn, operation_id);
                Err(err)
            }
        }
    }

    fn apply_invalidations(&self, operation_id: &str, tags: &[String]) {
        if tags.is_empty() {
            return;
        }
        let Some(cache) = &self.cache else {
            debug!(operation_id, "No cache configured; skipping tag invalidation");
            return;
        };
        match cache.invalidate_tags(tags) {
            Ok(removed) => debug!(operation_id, removed, "Invalidated cache tags"),
            Err(e) => warn!(operation_id, error = %e, "Cache invalidation after commit failed"),
        }
    }

    fn lockdown(&self, context: &OperationContext) {
        if !self.config.lockdown_on_critical {
            return;
        }
        let Some(limiter) = &self.limiter else {
            warn!("Lockdown enabled without a rate limiter");
            return;
        };
        let identifiers = context
            .actor_identifier()
            .into_iter()
            .chain(std::iter::once(context.origin_identifier()));
        for identifier in identifiers {
            match limiter.lock(&identifier, self.config.lockdown_duration) {
                Ok(until) => {
                    warn!(identifier = %identifier, %until, "Locked down after critical violation")
                }
                Err(e) => error!(identifier = %identifier, error = %e, "Lockdown failed"),
            }
        }
    }
}

/// The body's own verdict first, then the operation's rules.
fn verify<O>(
    operation: &O,
    result: OperationResult<O::Output>,
) -> Result<OperationResult<O::Output>, OperationError>
where
    O: CriticalOperation + ?Sized,
{
    if !result.valid {
        let mut violations: Vec<Violation> = result
            .diagnostics
            .iter()
            .map(|(field, message)| Violation::new(field, message))
            .collect();
        if violations.is_empty() {
            violations.push(Violation::new("result", "rejected by operation"));
        }
        return Err(OperationError::Validation(violations));
    }

    let violations = operation.validation_rules().check(&result.value);
    if !violations.is_empty() {
        return Err(OperationError::Validation(violations));
    }
    Ok(result)
}
