// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Audit Trail
//!
//! Records every operation outcome exactly once, plus security events raised
//! by the gate, the authenticator and the cache.
//!
//! ## Guarantees
//!
//! - Recording never fails from the caller's point of view: store errors are
//!   logged with `tracing::error!` and swallowed.
//! - `Critical` records are written to the main log, then to the high-priority
//!   log, then escalated.
//! - Details are redacted before they are written (see [`redact`]).

pub mod escalation;
pub mod redact;
pub mod webhook;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::auth::OperationContext;
use crate::clock::Clock;
use crate::error::{OperationError, Severity};
use crate::storage::{AuditOutcome, AuditRecord, AuditStore};

pub use escalation::{
    AlertSink, ChannelEscalation, EscalationChannel, EscalationDispatcher, EscalationError,
    LogEscalation, SecurityAlert,
};
pub use webhook::WebhookNotifier;

/// Who did what to which resource, shared by every record of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditSubject {
    pub operation_id: Option<String>,
    pub action: String,
    pub actor: Option<String>,
    pub resource: Option<String>,
    pub origin: Option<String>,
    pub context_hash: Option<String>,
}

impl AuditSubject {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    /// Subject of an operation invocation.
    pub fn for_operation(
        operation_id: impl Into<String>,
        action: impl Into<String>,
        context: &OperationContext,
    ) -> Self {
        Self {
            operation_id: Some(operation_id.into()),
            action: action.into(),
            actor: context.actor_id().map(str::to_string),
            resource: Some(context.resource().to_string()),
            origin: Some(context.origin().to_string()),
            context_hash: Some(context.context_hash()),
        }
    }

    fn record(&self, outcome: AuditOutcome, severity: Severity) -> AuditRecord {
        let mut record = AuditRecord::new(self.action.clone(), outcome, severity);
        record.operation_id = self.operation_id.clone();
        record.actor = self.actor.clone();
        record.resource = self.resource.clone();
        record.origin = self.origin.clone();
        record.context_hash = self.context_hash.clone();
        record
    }
}

/// Kind of security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEventKind {
    /// Gate rejected a missing or expired identity, or missing permissions.
    Unauthorized,
    /// Attempt window exceeded.
    RateLimited,
    /// Attempt rejected because the identifier is locked out.
    LockedOut,
    /// A failure pushed an identifier into lockout.
    LockoutEntered,
    /// Credential could not be resolved to an identity.
    AuthenticationFailed,
    /// Cache entry failed its checksum or could not be decrypted.
    IntegrityMismatch,
    /// Operation body reported a critical security violation.
    CriticalViolation,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::Unauthorized => "unauthorized",
            SecurityEventKind::RateLimited => "rate_limited",
            SecurityEventKind::LockedOut => "locked_out",
            SecurityEventKind::LockoutEntered => "lockout_entered",
            SecurityEventKind::AuthenticationFailed => "authentication_failed",
            SecurityEventKind::IntegrityMismatch => "integrity_mismatch",
            SecurityEventKind::CriticalViolation => "critical_violation",
        }
    }
}

impl fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A security event to be recorded.
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub severity: Severity,
    pub subject: AuditSubject,
    pub error_code: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, severity: Severity, subject: AuditSubject) -> Self {
        Self {
            kind,
            severity,
            subject,
            error_code: None,
            details: None,
        }
    }

    pub fn with_error(mut self, error: &OperationError) -> Self {
        self.error_code = Some(error.error_code().to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Recording side of the audit trail. Infallible by signature.
pub trait AuditRecorder: Send + Sync {
    fn log_success(&self, subject: &AuditSubject, duration: Duration, summary: serde_json::Value);

    fn log_failure(&self, subject: &AuditSubject, error: &OperationError, duration: Duration);

    fn log_security_event(&self, event: SecurityEvent);
}

/// Audit trail over an [`AuditStore`] and an [`EscalationChannel`].
pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
    escalation: Arc<dyn EscalationChannel>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditTrail").finish_non_exhaustive()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl AuditTrail {
    pub fn new(
        store: Arc<dyn AuditStore>,
        escalation: Arc<dyn EscalationChannel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            escalation,
            clock,
        }
    }

    /// Write a record, plus the high-priority copy and escalation when critical.
    fn write(&self, record: AuditRecord) {
        let record = record.at(self.clock.now());

        if let Err(e) = self.store.append(&record) {
            error!(
                record_id = %record.record_id,
                action = %record.action,
                error = %e,
                "Failed to write audit record"
            );
        }

        if record.is_critical() {
            if let Err(e) = self.store.append_critical(&record) {
                error!(
                    record_id = %record.record_id,
                    action = %record.action,
                    error = %e,
                    "Failed to write critical audit record"
                );
            }
            self.escalation.escalate(SecurityAlert::from_record(&record));
        }
    }
}

impl AuditRecorder for AuditTrail {
    fn log_success(&self, subject: &AuditSubject, duration: Duration, summary: serde_json::Value) {
        let record = subject
            .record(AuditOutcome::Success, Severity::Info)
            .with_duration_ms(millis(duration))
            .with_details(redact::redact(&summary));
        self.write(record);
    }

    fn log_failure(&self, subject: &AuditSubject, err: &OperationError, duration: Duration) {
        let outcome = if err.is_security() {
            AuditOutcome::Security
        } else {
            AuditOutcome::Failure
        };
        let record = subject
            .record(outcome, err.severity())
            .with_duration_ms(millis(duration))
            .with_error_code(err.error_code())
            .with_details(serde_json::json!({ "message": err.to_string() }));
        self.write(record);
    }

    fn log_security_event(&self, event: SecurityEvent) {
        let mut record = event
            .subject
            .record(AuditOutcome::Security, event.severity);
        record.action = event.kind.as_str().to_string();
        let mut details = serde_json::Map::new();
        if !event.subject.action.is_empty() {
            details.insert(
                "operation".to_string(),
                serde_json::Value::String(event.subject.action.clone()),
            );
        }
        if let Some(extra) = &event.details {
            details.insert("context".to_string(), redact::redact(extra));
        }
        if !details.is_empty() {
            record = record.with_details(serde_json::Value::Object(details));
        }
        if let Some(code) = event.error_code {
            record = record.with_error_code(code);
        }
        self.write(record);
    }
}
