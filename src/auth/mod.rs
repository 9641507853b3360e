// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authentication & Authorization
//!
//! ## Flow
//!
//! 1. The edge presents a credential (`Bearer <JWT>`) to the [`Authenticator`].
//! 2. The [`IdentityProvider`] verifies it and extracts:
//!    - `sub` → canonical user ID
//!    - `role` → default permissions, plus explicit `permissions`
//! 3. The resulting [`OperationContext`] travels with every protected
//!    operation, and the [`SecurityGate`] admits or rejects it.
//!
//! ## Security
//!
//! - Permission checks are exact set inclusion
//! - Repeated failures lock the origin (`ip:{origin}`) or the actor
//!   (`user:{id}`) out for a fixed cool-down
//! - Clock skew tolerance on tokens is 60 seconds

pub mod authenticator;
pub mod claims;
pub mod context;
pub mod error;
pub mod gate;
pub mod identity;
pub mod rate_limit;
pub mod roles;

pub use authenticator::Authenticator;
pub use claims::{Identity, SessionClaims};
pub use context::{OperationContext, Principal, RequestMetadata, ResourceDescriptor};
pub use error::IdentityError;
pub use gate::{GateRequest, PermissionGate, SecurityGate};
pub use identity::{IdentityProvider, JwtIdentityProvider};
pub use rate_limit::{FailureOutcome, LockoutState, RateLimitPolicy, RateLimiter};
pub use roles::{Permission, PermissionSet, Role};
