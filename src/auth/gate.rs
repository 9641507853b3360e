// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Security Gate
//!
//! Admission check run before any protected operation opens a transaction.
//! Checks, in order, stopping at the first failure:
//!
//! 0. Neither `user:{id}` nor `ip:{origin}` is locked out → else `RateLimited`
//! 1. Identity present and session not expired → else `Unauthorized`
//! 2. Required permissions ⊆ granted permissions → else `Unauthorized`
//! 3. Attempt window for `{rate_limit_key}:user:{id}` not exceeded → else `RateLimited`
//!
//! Every rejection writes exactly one record to the audit trail before the
//! error is returned: a security record for refusals, a failure record when
//! the gate itself could not reach its store. Identity failures count against the origin,
//! permission failures against the actor.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::context::OperationContext;
use super::rate_limit::{FailureOutcome, RateLimiter};
use super::roles::PermissionSet;
use crate::audit::{AuditRecorder, AuditSubject, SecurityEvent, SecurityEventKind};
use crate::clock::Clock;
use crate::error::{OperationError, RateLimitReason, Severity, UnauthorizedReason};

/// What the gate needs to know about the operation being admitted.
#[derive(Debug, Clone, Copy)]
pub struct GateRequest<'a> {
    pub operation_id: &'a str,
    pub operation_type: &'a str,
    pub required: &'a PermissionSet,
    pub rate_limit_key: &'a str,
}

/// Admission control for protected operations.
pub trait SecurityGate: Send + Sync {
    fn validate(
        &self,
        context: &OperationContext,
        request: &GateRequest<'_>,
    ) -> Result<(), OperationError>;
}

/// Gate enforcing lockout, session validity, permission inclusion and rate windows.
pub struct PermissionGate {
    limiter: Arc<RateLimiter>,
    audit: Arc<dyn AuditRecorder>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGate")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl PermissionGate {
    pub fn new(
        limiter: Arc<RateLimiter>,
        audit: Arc<dyn AuditRecorder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limiter,
            audit,
            clock,
        }
    }

    fn check(
        &self,
        context: &OperationContext,
        request: &GateRequest<'_>,
    ) -> Result<(), Rejection> {
        let origin_id = context.origin_identifier();
        let lockable = context.actor_identifier();

        for identifier in lockable.iter().chain(std::iter::once(&origin_id)) {
            self.limiter
                .ensure_active(identifier)
                .map_err(|err| Rejection::new(SecurityEventKind::LockedOut, err))?;
        }

        let Some(principal) = context.actor() else {
            return Err(Rejection::new(
                SecurityEventKind::Unauthorized,
                OperationError::Unauthorized(UnauthorizedReason::MissingIdentity),
            )
            .counting(origin_id));
        };
        if principal.is_expired(self.clock.now()) {
            return Err(Rejection::new(
                SecurityEventKind::Unauthorized,
                OperationError::Unauthorized(UnauthorizedReason::SessionExpired),
            )
            .counting(origin_id));
        }

        let actor_id = format!("user:{}", principal.user_id);
        if !request.required.is_subset_of(context.permissions()) {
            let missing = request.required.missing_from(context.permissions());
            return Err(Rejection::new(
                SecurityEventKind::Unauthorized,
                OperationError::Unauthorized(UnauthorizedReason::MissingPermissions(missing)),
            )
            .counting(actor_id));
        }

        let rate_id = format!("{}:{}", request.rate_limit_key, actor_id);
        self.limiter.check(&rate_id).map_err(|err| {
            let kind = match &err {
                OperationError::RateLimited {
                    reason: RateLimitReason::LockedOut,
                    ..
                } => SecurityEventKind::LockedOut,
                OperationError::RateLimited { .. } => SecurityEventKind::RateLimited,
                _ => SecurityEventKind::Unauthorized,
            };
            Rejection::new(kind, err)
        })?;
        Ok(())
    }

    fn reject(
        &self,
        context: &OperationContext,
        request: &GateRequest<'_>,
        rejection: Rejection,
    ) -> OperationError {
        let mut severity = Severity::Warning;
        let mut details = serde_json::Map::new();

        if let Some(identifier) = &rejection.count_against {
            match self.limiter.record_failure(identifier) {
                Ok(FailureOutcome::LockoutEntered { until }) => {
                    severity = Severity::Critical;
                    details.insert("lockout_entered".into(), identifier.clone().into());
                    details.insert("lockout_until".into(), until.to_rfc3339().into());
                }
                Ok(_) => {}
                Err(e) => warn!(
                    identifier = identifier.as_str(),
                    error = %e,
                    "Failed to record gate failure"
                ),
            }
        }

        let subject =
            AuditSubject::for_operation(request.operation_id, request.operation_type, context);

        // Storage trouble inside the gate is a failure, not a security event.
        if !rejection.error.is_security() {
            warn!(
                operation = request.operation_type,
                error_code = rejection.error.error_code(),
                "Security gate could not evaluate operation"
            );
            self.audit.log_failure(&subject, &rejection.error, Duration::ZERO);
            return rejection.error;
        }

        debug!(
            operation = request.operation_type,
            kind = %rejection.kind,
            error_code = rejection.error.error_code(),
            "Security gate rejected operation"
        );
        let mut event = SecurityEvent::new(rejection.kind, severity, subject)
            .with_error(&rejection.error);
        if !details.is_empty() {
            event = event.with_details(serde_json::Value::Object(details));
        }
        self.audit.log_security_event(event);
        rejection.error
    }
}

/// A failed check, before it is recorded.
struct Rejection {
    kind: SecurityEventKind,
    error: OperationError,
    /// Identifier that earns a failure for this rejection.
    count_against: Option<String>,
}

impl Rejection {
    fn new(kind: SecurityEventKind, error: OperationError) -> Self {
        Self {
            kind,
            error,
            count_against: None,
        }
    }

    fn counting(mut self, identifier: String) -> Self {
        self.count_against = Some(identifier);
        self
    }
}

impl SecurityGate for PermissionGate {
    fn validate(
        &self,
        context: &OperationContext,
        request: &GateRequest<'_>,
    ) -> Result<(), OperationError> {
        self.check(context, request)
            .map_err(|rejection| self.reject(context, request, rejection))
    }
}
