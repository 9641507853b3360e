// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Credential → [`OperationContext`], with origin lockout.
//!
//! ## Flow
//!
//! 1. `ip:{origin}` locked → `RateLimited`, whatever the credential.
//! 2. Resolve the credential with the [`IdentityProvider`].
//!    - failure: count a failure against `ip:{origin}`, audit it (critical
//!      when it enters the lockout), return `Unauthorized`
//!    - success: clear the origin's failures and build the context

use std::sync::Arc;

use tracing::{debug, warn};

use super::context::{OperationContext, RequestMetadata, ResourceDescriptor};
use super::identity::IdentityProvider;
use super::rate_limit::{FailureOutcome, RateLimiter};
use crate::audit::{AuditRecorder, AuditSubject, SecurityEvent, SecurityEventKind};
use crate::error::{OperationError, Severity};

const ACTION: &str = "authenticate";

pub struct Authenticator {
    provider: Arc<dyn IdentityProvider>,
    limiter: Arc<RateLimiter>,
    audit: Arc<dyn AuditRecorder>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

impl Authenticator {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        limiter: Arc<RateLimiter>,
        audit: Arc<dyn AuditRecorder>,
    ) -> Self {
        Self {
            provider,
            limiter,
            audit,
        }
    }

    fn subject(resource: &ResourceDescriptor, metadata: &RequestMetadata) -> AuditSubject {
        AuditSubject {
            operation_id: Some(metadata.request_id.clone()),
            action: ACTION.to_string(),
            actor: None,
            resource: Some(resource.to_string()),
            origin: Some(metadata.origin.clone()),
            context_hash: None,
        }
    }

    pub fn authenticate(
        &self,
        credential: &str,
        resource: ResourceDescriptor,
        metadata: RequestMetadata,
    ) -> Result<OperationContext, OperationError> {
        let origin_id = format!("ip:{}", metadata.origin);

        if let Err(err) = self.limiter.ensure_active(&origin_id) {
            if err.is_security() {
                let event = SecurityEvent::new(
                    SecurityEventKind::LockedOut,
                    Severity::Warning,
                    Self::subject(&resource, &metadata),
                )
                .with_error(&err);
                self.audit.log_security_event(event);
            }
            return Err(err);
        }

        let identity = match self.provider.resolve(credential) {
            Ok(identity) => identity,
            Err(e) => {
                let err = OperationError::Unauthorized(e.unauthorized_reason());
                let (kind, severity) = match self.limiter.record_failure(&origin_id) {
                    Ok(FailureOutcome::LockoutEntered { until }) => {
                        warn!(
                            origin = %metadata.origin,
                            %until,
                            "Origin locked after repeated authentication failures"
                        );
                        (SecurityEventKind::LockoutEntered, Severity::Critical)
                    }
                    Ok(_) => (SecurityEventKind::AuthenticationFailed, Severity::Warning),
                    Err(store_err) => {
                        warn!(
                            origin = %metadata.origin,
                            error = %store_err,
                            "Failed to record authentication failure"
                        );
                        (SecurityEventKind::AuthenticationFailed, Severity::Warning)
                    }
                };
                let event = SecurityEvent::new(kind, severity, Self::subject(&resource, &metadata))
                    .with_error(&err)
                    .with_details(serde_json::json!({ "reason": e.error_code() }));
                self.audit.log_security_event(event);
                return Err(err);
            }
        };

        if let Err(e) = self.limiter.record_success(&origin_id) {
            warn!(origin = %metadata.origin, error = %e, "Failed to clear authentication failures");
        }
        debug!(user_id = %identity.principal.user_id, role = %identity.role, "Authenticated");

        Ok(OperationContext::new(
            identity.principal,
            identity.permissions,
            resource,
            metadata,
        ))
    }
}
