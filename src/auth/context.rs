// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Caller context attached to every protected operation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::roles::PermissionSet;

/// An authenticated user session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Canonical user ID.
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: None,
            expires_at,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What an operation acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource type, e.g. `content` or `media`.
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ResourceDescriptor {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id.into()),
        }
    }

    /// A resource type without a specific instance (e.g. for creation).
    pub fn collection(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
        }
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}/{}", self.kind, id),
            None => f.write_str(&self.kind),
        }
    }
}

/// Request-level facts captured at the edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Client IP address or calling service name.
    pub origin: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
}

impl RequestMetadata {
    pub fn new(origin: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            origin: origin.into(),
            timestamp,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Immutable context of one operation invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    actor: Option<Principal>,
    permissions: PermissionSet,
    resource: ResourceDescriptor,
    metadata: RequestMetadata,
}

impl OperationContext {
    pub fn new(
        actor: Principal,
        permissions: PermissionSet,
        resource: ResourceDescriptor,
        metadata: RequestMetadata,
    ) -> Self {
        Self {
            actor: Some(actor),
            permissions,
            resource,
            metadata,
        }
    }

    /// Context for an unauthenticated caller. Fails the gate for any operation.
    pub fn anonymous(resource: ResourceDescriptor, metadata: RequestMetadata) -> Self {
        Self {
            actor: None,
            permissions: PermissionSet::new(),
            resource,
            metadata,
        }
    }

    pub fn actor(&self) -> Option<&Principal> {
        self.actor.as_ref()
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor.as_ref().map(|p| p.user_id.as_str())
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    pub fn resource(&self) -> &ResourceDescriptor {
        &self.resource
    }

    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    pub fn origin(&self) -> &str {
        &self.metadata.origin
    }

    /// Rate-limiter identifier of the actor: `user:{id}`.
    pub fn actor_identifier(&self) -> Option<String> {
        self.actor_id().map(|id| format!("user:{id}"))
    }

    /// Rate-limiter identifier of the origin: `ip:{origin}`.
    pub fn origin_identifier(&self) -> String {
        format!("ip:{}", self.metadata.origin)
    }

    /// SHA-256 (hex) over the fields that identify this invocation.
    pub fn context_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let mut field = |value: &str| {
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        };
        field(self.actor_id().unwrap_or(""));
        for permission in self.permissions.iter() {
            field(permission.as_str());
        }
        field(&self.resource.to_string());
        field(&self.metadata.origin);
        field(&self.metadata.request_id);
        field(&self.metadata.timestamp.to_rfc3339());
        hex::encode(hasher.finalize())
    }
}
