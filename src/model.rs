//! Data model entities shared across the crate.
//!
//! These are plain serializable rows mirroring the relational store's
//! tables. The core never owns the store itself (see [`crate::store`]) —
//! these types are the shapes that flow across that boundary.

use crate::dsl::Condition;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

pub type Id = i64;

/// Anonymous principal id, always included in the active subject set
/// regardless of authentication state.
pub const ANONYMOUS_PRINCIPAL_ID: Id = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Realm {
    pub id: Id,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceType {
    pub id: Id,
    pub realm_id: Id,
    pub name: String,
    pub is_public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Id,
    pub realm_id: Id,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Id,
    pub realm_id: Id,
    pub name: String,
    #[serde(default)]
    pub attributes: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: Id,
    pub realm_id: Id,
    pub username: String,
    #[serde(default)]
    pub attributes: JsonValue,
}

impl Principal {
    /// The well-known anonymous principal: id 0, empty attributes,
    /// not persisted in the realm's principal table.
    pub fn anonymous(realm_id: Id) -> Self {
        Principal {
            id: ANONYMOUS_PRINCIPAL_ID,
            realm_id,
            username: String::new(),
            attributes: JsonValue::Object(Default::default()),
        }
    }
}

/// One canonical stored projection for all resource geometry.
/// Spatial literals in rule conditions are transformed into this SRID at
/// compile time or ingest time; this constant is also the compiler's
/// default when a rule literal omits an explicit projection tag.
pub const CANONICAL_SRID: i32 = 4326;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geometry {
    /// Well-known binary, already transformed into `CANONICAL_SRID`.
    pub wkb: Vec<u8>,
    pub srid: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: Id,
    pub realm_id: Id,
    pub resource_type_id: Id,
    #[serde(default)]
    pub attributes: JsonValue,
    #[serde(default)]
    pub geometry: Option<Geometry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalIdMapping {
    pub realm_id: Id,
    pub resource_type_id: Id,
    pub external_id: String,
    pub resource_id: Id,
}

/// Lifecycle states for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleState {
    Draft,
    Compiled,
    Active,
    Superseded,
    Retired,
}

/// Subject of a rule: exactly one of role or principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Subject {
    Role(Id),
    Principal(Id),
}

/// A compiled SQL predicate fragment, cached alongside its source rule as
/// part of the "compile once" step on the way from Draft to Compiled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledFragment {
    /// SQL boolean expression referencing `resource` and `ctx`.
    pub sql: String,
    /// Ordered bind-site descriptors for the placeholders in `sql`.
    pub placeholders: Vec<crate::compiler::Placeholder>,
    /// Stable hash of the DSL tree's fixed-order serialization; acts as
    /// the cache key and detects whether `sql` needs recompiling.
    pub tree_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Id,
    pub realm_id: Id,
    pub resource_type_id: Id,
    pub action_id: Id,
    pub subject: Subject,
    /// `None` means a type-scoped rule; `Some(id)` means resource-scoped.
    pub resource_id: Option<Id>,
    pub condition: Option<Condition>,
    pub compiled: Option<CompiledFragment>,
    pub state: RuleState,
}

impl Rule {
    pub fn is_type_scoped(&self) -> bool {
        self.resource_id.is_none()
    }

    pub fn is_resource_scoped(&self) -> bool {
        self.resource_id.is_some()
    }

    /// The active subject ids this rule matches against, as a single-entry
    /// map keyed by the discriminant so callers can intersect with a
    /// request's subject set without matching on the enum twice.
    pub fn subject_id(&self) -> Id {
        match self.subject {
            Subject::Role(id) | Subject::Principal(id) => id,
        }
    }
}

/// Opaque per-realm attribute bags used by the reference resolver and the
/// residual evaluator to bind `$principal.*` / `$context.*` paths.
pub type AttributeMap = HashMap<String, JsonValue>;
