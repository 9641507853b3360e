// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Identity resolution errors.

use crate::error::UnauthorizedReason;

/// Why a credential could not be resolved to an identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("no credential presented")]
    MissingCredential,

    #[error("malformed token")]
    MalformedToken,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token has expired")]
    TokenExpired,

    #[error("invalid token issuer")]
    InvalidIssuer,

    #[error("token is not yet valid")]
    TokenNotYetValid,

    #[error("invalid claims: {0}")]
    InvalidClaims(String),

    #[error("identity provider misconfigured: {0}")]
    Configuration(String),
}

impl IdentityError {
    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            IdentityError::MissingCredential => "missing_credential",
            IdentityError::MalformedToken => "malformed_token",
            IdentityError::InvalidSignature => "invalid_signature",
            IdentityError::TokenExpired => "token_expired",
            IdentityError::InvalidIssuer => "invalid_issuer",
            IdentityError::TokenNotYetValid => "token_not_yet_valid",
            IdentityError::InvalidClaims(_) => "invalid_claims",
            IdentityError::Configuration(_) => "identity_configuration",
        }
    }

    /// Reason reported to the caller. Details stay in the logs.
    pub fn unauthorized_reason(&self) -> UnauthorizedReason {
        match self {
            IdentityError::MissingCredential => UnauthorizedReason::MissingIdentity,
            IdentityError::TokenExpired => UnauthorizedReason::SessionExpired,
            _ => UnauthorizedReason::InvalidCredentials,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for IdentityError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::ExpiredSignature => IdentityError::TokenExpired,
            ErrorKind::InvalidSignature => IdentityError::InvalidSignature,
            ErrorKind::InvalidIssuer => IdentityError::InvalidIssuer,
            ErrorKind::ImmatureSignature => IdentityError::TokenNotYetValid,
            ErrorKind::MissingRequiredClaim(claim) => {
                IdentityError::InvalidClaims(format!("missing {claim}"))
            }
            _ => IdentityError::MalformedToken,
        }
    }
}
