// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Session token claims and the identity they resolve to.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::context::Principal;
use super::error::IdentityError;
use super::roles::{PermissionSet, Role};

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (user ID).
    pub sub: String,

    /// Expiration timestamp (seconds).
    pub exp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Session ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Permissions granted on top of the role defaults.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

/// A resolved caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub principal: Principal,
    pub role: Role,
    /// Role defaults plus explicitly granted permissions.
    pub permissions: PermissionSet,
}

impl Identity {
    pub fn from_claims(claims: SessionClaims) -> Result<Self, IdentityError> {
        if claims.sub.trim().is_empty() {
            return Err(IdentityError::InvalidClaims("empty sub".to_string()));
        }
        let expires_at: DateTime<Utc> = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| IdentityError::InvalidClaims("exp out of range".to_string()))?;

        // Unknown roles fall back to the least privileged one.
        let role = claims
            .role
            .as_deref()
            .and_then(Role::parse)
            .unwrap_or_default();

        let explicit: PermissionSet = claims.permissions.iter().map(String::as_str).collect();
        let mut principal = Principal::new(claims.sub, expires_at);
        principal.session_id = claims.sid;

        Ok(Self {
            principal,
            role,
            permissions: role.default_permissions().union(&explicit),
        })
    }
}
