// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Typed errors returned to feature code by the executor and the cache.
//!
//! Callers only ever see an [`OperationError`]. Storage, cipher and identity
//! failures are converted at the boundary; their detail is logged, not
//! carried across it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::StoreError;

/// Audit severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A single failed validation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Field or rule name.
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Why an identity was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnauthorizedReason {
    MissingIdentity,
    SessionExpired,
    InvalidCredentials,
    MissingPermissions(Vec<String>),
}

impl fmt::Display for UnauthorizedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnauthorizedReason::MissingIdentity => write!(f, "no authenticated identity"),
            UnauthorizedReason::SessionExpired => write!(f, "session has expired"),
            UnauthorizedReason::InvalidCredentials => write!(f, "invalid credentials"),
            UnauthorizedReason::MissingPermissions(missing) => {
                write!(f, "missing permissions: {}", missing.join(", "))
            }
        }
    }
}

/// Why a rate check refused an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitReason {
    WindowExceeded,
    LockedOut,
}

/// Error taxonomy exposed by the framework.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("validation failed: {}", join_violations(.0))]
    Validation(Vec<Violation>),

    #[error("unauthorized: {0}")]
    Unauthorized(UnauthorizedReason),

    #[error("rate limit exceeded, retry after {}s", .retry_after.as_secs())]
    RateLimited {
        reason: RateLimitReason,
        retry_after: Duration,
    },

    #[error("could not acquire cache lock for '{key}' after {attempts} attempts")]
    LockAcquisition { key: String, attempts: u32 },

    #[error("integrity check failed for '{key}'")]
    Integrity { key: String },

    #[error("transient storage contention")]
    TransientStorage,

    #[error("critical security violation: {0}")]
    CriticalSecurity(String),

    #[error("operation exceeded its maximum duration")]
    DeadlineExceeded,

    #[error("protected operations cannot be nested")]
    NestedOperation,

    #[error("internal error")]
    Internal,
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl OperationError {
    /// Shorthand for a single-violation validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        OperationError::Validation(vec![Violation::new(field, message)])
    }

    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            OperationError::Validation(_) => "validation_error",
            OperationError::Unauthorized(_) => "unauthorized",
            OperationError::RateLimited { .. } => "rate_limited",
            OperationError::LockAcquisition { .. } => "lock_acquisition_failed",
            OperationError::Integrity { .. } => "integrity_error",
            OperationError::TransientStorage => "transient_storage",
            OperationError::CriticalSecurity(_) => "critical_security",
            OperationError::DeadlineExceeded => "deadline_exceeded",
            OperationError::NestedOperation => "nested_operation",
            OperationError::Internal => "internal_error",
        }
    }

    /// Only transient storage contention is worth re-running a body for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OperationError::TransientStorage)
    }

    /// Whether the failure is a security outcome rather than a plain failure.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            OperationError::Unauthorized(_)
                | OperationError::RateLimited { .. }
                | OperationError::Integrity { .. }
                | OperationError::CriticalSecurity(_)
        )
    }

    /// Severity used when the failure is audited.
    pub fn severity(&self) -> Severity {
        match self {
            OperationError::Validation(_) => Severity::Info,
            OperationError::CriticalSecurity(_) => Severity::Critical,
            _ => Severity::Warning,
        }
    }
}

impl From<StoreError> for OperationError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            OperationError::TransientStorage
        } else {
            OperationError::Internal
        }
    }
}
