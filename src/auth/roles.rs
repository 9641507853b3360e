// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Roles and permissions for authorization.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A named capability, e.g. `content.create`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(String);

impl Permission {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Permission {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Set of granted or required permissions.
///
/// Authorization is plain set inclusion: a grant of `content.*` or a prefix
/// match does **not** satisfy `content.create`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, permission: impl Into<Permission>) {
        self.0.insert(permission.into());
    }

    pub fn contains(&self, permission: &str) -> bool {
        self.0.iter().any(|p| p.as_str() == permission)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.0.iter()
    }

    /// Whether every permission in `self` is also in `granted`.
    pub fn is_subset_of(&self, granted: &PermissionSet) -> bool {
        self.0.is_subset(&granted.0)
    }

    /// Permissions in `self` that `granted` lacks, sorted.
    pub fn missing_from(&self, granted: &PermissionSet) -> Vec<String> {
        self.0
            .difference(&granted.0)
            .map(|p| p.as_str().to_string())
            .collect()
    }

    pub fn union(&self, other: &PermissionSet) -> PermissionSet {
        PermissionSet(self.0.union(&other.0).cloned().collect())
    }
}

impl<P: Into<Permission>> FromIterator<P> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        PermissionSet(iter.into_iter().map(Into::into).collect())
    }
}

/// User roles for authorization.
///
/// ## Role Hierarchy
///
/// - `Admin` - Everything, including user management and settings
/// - `Editor` - Create, update, publish and delete any content and media
/// - `Author` - Create and update content, upload media
/// - `Viewer` - Read-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Editor,
    Author,
    /// Least privilege; used when a token carries no recognizable role.
    #[default]
    Viewer,
}

const VIEWER_PERMISSIONS: &[&str] = &["content.read", "media.read"];
const AUTHOR_PERMISSIONS: &[&str] = &["content.create", "content.update", "media.upload"];
const EDITOR_PERMISSIONS: &[&str] = &["content.publish", "content.delete", "media.delete"];
const ADMIN_PERMISSIONS: &[&str] = &[
    "users.read",
    "users.manage",
    "settings.manage",
    "audit.read",
];

impl Role {
    /// Check if this role has at least the privileges of the required role.
    pub fn has_privilege(&self, required: Role) -> bool {
        self.rank() >= required.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            Role::Viewer => 0,
            Role::Author => 1,
            Role::Editor => 2,
            Role::Admin => 3,
        }
    }

    /// Permissions granted by the role alone (cumulative down the hierarchy).
    pub fn default_permissions(&self) -> PermissionSet {
        let tiers: &[&[&str]] = match self {
            Role::Viewer => &[VIEWER_PERMISSIONS],
            Role::Author => &[VIEWER_PERMISSIONS, AUTHOR_PERMISSIONS],
            Role::Editor => &[VIEWER_PERMISSIONS, AUTHOR_PERMISSIONS, EDITOR_PERMISSIONS],
            Role::Admin => &[
                VIEWER_PERMISSIONS,
                AUTHOR_PERMISSIONS,
                EDITOR_PERMISSIONS,
                ADMIN_PERMISSIONS,
            ],
        };
        tiers.iter().flat_map(|tier| tier.iter().copied()).collect()
    }

    /// Parse role from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Role> {
        match s.to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "editor" => Some(Role::Editor),
            "author" => Some(Role::Author),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Editor => write!(f, "editor"),
            Role::Author => write!(f, "author"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}
