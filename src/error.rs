//! Error taxonomy for the policy core.
//!
//! A single flat `thiserror` enum covers both compile-time (rule write path)
//! and request-time (access-check path) failures: compiler errors never
//! leak into the read path, and read-path uncertainty always resolves to
//! a deny rather than a silent grant.

use serde::{Deserialize, Serialize};

/// The kind of symbolic name that failed to resolve, for `UnknownEntity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Realm,
    ResourceType,
    Action,
    Role,
    Principal,
    Resource,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityKind::Realm => "realm",
            EntityKind::ResourceType => "resource_type",
            EntityKind::Action => "action",
            EntityKind::Role => "role",
            EntityKind::Principal => "principal",
            EntityKind::Resource => "resource",
        };
        write!(f, "{s}")
    }
}

/// Errors raised by the policy core.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum PolicyError {
    /// DSL validation or compilation failed. Raised only on the rule write
    /// path; the rule is not committed and the prior `Active` fragment (if
    /// any) is left untouched.
    #[error("invalid policy: {detail}")]
    InvalidPolicy { detail: String },

    /// A symbolic name (realm, type, action, role, principal) did not
    /// resolve to an id. Per-item deny: the caller sees `false` or an
    /// empty id list for the affected item, never an error surfaced as a
    /// grant.
    #[error("unknown {kind}: {name}")]
    UnknownEntity { kind: EntityKind, name: String },

    /// An external id was supplied without enough scope to disambiguate
    /// it, or resolved ambiguously within `(realm, resource_type)`.
    #[error("ambiguous external id '{external_id}' for resource type '{resource_type}'")]
    AmbiguousExternalId {
        resource_type: String,
        external_id: String,
    },

    /// The store connection pool or the audit queue is overloaded.
    #[error("resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    /// The underlying store failed. `retried` indicates whether the
    /// runner already attempted one retry before surfacing this error.
    #[error("store failure: {detail} (retried={retried})")]
    StoreFailure { detail: String, retried: bool },

    /// The request exceeded its deadline. No audit entry is emitted for a
    /// timed-out request.
    #[error("request timed out after {deadline_ms}ms")]
    Timeout { deadline_ms: u64 },
}

impl PolicyError {
    pub fn invalid_policy(detail: impl Into<String>) -> Self {
        PolicyError::InvalidPolicy {
            detail: detail.into(),
        }
    }

    pub fn unknown(kind: EntityKind, name: impl Into<String>) -> Self {
        PolicyError::UnknownEntity {
            kind,
            name: name.into(),
        }
    }

    /// Whether this error should be retried once before being surfaced
    /// per §7's `StoreFailure` propagation policy.
    pub fn is_retryable_store_failure(&self) -> bool {
        matches!(self, PolicyError::StoreFailure { retried: false, .. })
    }
}

pub type Result<T> = std::result::Result<T, PolicyError>;
