// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Identity providers.
//!
//! ## JWT sessions
//!
//! [`JwtIdentityProvider`] verifies HS256 session tokens:
//!
//! - signature under the shared secret
//! - `exp` (and `nbf` when present) with a 60 second clock-skew leeway
//! - `iss` when an issuer is configured
//!
//! and extracts `sub` → user ID, `sid`, `role` and `permissions`.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use super::claims::{Identity, SessionClaims};
use super::error::IdentityError;

/// Clock skew tolerance in seconds.
const CLOCK_SKEW_LEEWAY: u64 = 60;

/// Resolves a presented credential to an authenticated identity.
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self, credential: &str) -> Result<Identity, IdentityError>;
}

pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIdentityProvider")
            .field("issuer", &self.validation.iss)
            .finish_non_exhaustive()
    }
}

impl JwtIdentityProvider {
    pub fn new(secret: &[u8], issuer: Option<&str>) -> Result<Self, IdentityError> {
        if secret.is_empty() {
            return Err(IdentityError::Configuration(
                "JWT secret must not be empty".to_string(),
            ));
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = CLOCK_SKEW_LEEWAY;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        Ok(Self {
            key: DecodingKey::from_secret(secret),
            validation,
        })
    }
}

impl IdentityProvider for JwtIdentityProvider {
    fn resolve(&self, credential: &str) -> Result<Identity, IdentityError> {
        let token = credential
            .strip_prefix("Bearer ")
            .unwrap_or(credential)
            .trim();
        if token.is_empty() {
            return Err(IdentityError::MissingCredential);
        }

        let data = decode::<SessionClaims>(token, &self.key, &self.validation).map_err(|e| {
            let err = IdentityError::from(e);
            tracing::debug!(error_code = err.error_code(), "JWT verification failed");
            err
        })?;
        Identity::from_claims(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"test-secret-test-secret-test-secret";

    fn claims(exp_offset: i64) -> SessionClaims {
        let now = Utc::now().timestamp();
        SessionClaims {
            sub: "user_1".to_string(),
            exp: now + exp_offset,
            iat: Some(now),
            iss: Some("https://cms.example.com".to_string()),
            sid: None,
            role: Some("editor".to_string()),
            permissions: Vec::new(),
        }
    }

    fn token(claims: &SessionClaims, secret: &[u8]) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    fn provider() -> JwtIdentityProvider {
        JwtIdentityProvider::new(SECRET, Some("https://cms.example.com")).unwrap()
    }

    #[test]
    fn resolves_valid_token() {
        let identity = provider().resolve(&token(&claims(3600), SECRET)).unwrap();
        assert_eq!(identity.principal.user_id, "user_1");
        assert!(identity.permissions.contains("content.publish"));
    }

    #[test]
    fn accepts_bearer_prefix() {
        let credential = format!("Bearer {}", token(&claims(3600), SECRET));
        assert!(provider().resolve(&credential).is_ok());
    }

    #[test]
    fn rejects_wrong_secret() {
        let err = provider()
            .resolve(&token(&claims(3600), b"another-secret-another-secret"))
            .unwrap_err();
        assert_eq!(err, IdentityError::InvalidSignature);
    }

    #[test]
    fn rejects_expired_token_beyond_leeway() {
        let err = provider().resolve(&token(&claims(-3600), SECRET)).unwrap_err();
        assert_eq!(err, IdentityError::TokenExpired);

        // Within the leeway the token is still accepted.
        assert!(provider().resolve(&token(&claims(-30), SECRET)).is_ok());
    }

    #[test]
    fn rejects_wrong_issuer() {
        let mut other = claims(3600);
        other.iss = Some("https://evil.example.com".to_string());
        assert_eq!(
            provider().resolve(&token(&other, SECRET)).unwrap_err(),
            IdentityError::InvalidIssuer
        );
    }

    #[test]
    fn rejects_garbage_and_empty() {
        assert_eq!(
            provider().resolve("not-a-jwt").unwrap_err(),
            IdentityError::MalformedToken
        );
        assert_eq!(
            provider().resolve("").unwrap_err(),
            IdentityError::MissingCredential
        );
    }

    #[test]
    fn empty_secret_is_configuration_error() {
        assert!(matches!(
            JwtIdentityProvider::new(b"", None),
            Err(IdentityError::Configuration(_))
        ));
    }
}
