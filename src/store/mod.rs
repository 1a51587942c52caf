//! The `Store` port trait and an in-memory implementation used by this
//! crate's own tests and demo.
//!
//! An async trait boundary over interchangeable backends behind one
//! `Send + Sync` async trait. The core depends only on this trait, never
//! on a SQL driver directly, so it stays agnostic to whether the backing
//! store uses table partitioning, sharding, or logical views, as long as
//! the query planner reduces scans to the requested realm.
//!
//! A production implementation backed by `sqlx`/Postgres compiles a
//! combined condition tree with [`crate::compiler::compile`] and binds its
//! placeholders against a real connection; [`InMemoryStore`] instead
//! interprets the tree directly against its in-process resource map via
//! [`interpret::evaluate`] — a ground-truth oracle standing in for a live
//! store in tests (see `interpret`'s module doc).

pub mod interpret;
pub mod postgres;

use crate::dsl::Condition;
use crate::error::{EntityKind, PolicyError};
use crate::model::{
    AttributeMap, Id, Principal, Resource, ResourceType, Rule, RuleState, Subject,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// A rule write-path request: the compiler/validator runs before this ever
/// reaches the store (`Draft -> Compiled`); the store only needs to know
/// the scope key and the already-compiled rule to commit it.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub realm_id: Id,
    pub resource_type_id: Id,
    pub action_id: Id,
    pub subject: Subject,
    pub resource_id: Option<Id>,
    pub condition: Option<Condition>,
}

/// Async port to the three logical stores the core touches: the relational
/// store (entities + compiled fragments), symbolic-name resolution, and
/// rule lifecycle mutation. The cache and audit queue sit in front of /
/// beside this trait, not inside it.
#[async_trait]
pub trait Store: Send + Sync {
    async fn resolve_realm(&self, realm_name: &str) -> Result<Id, PolicyError>;
    async fn resolve_action(&self, realm_id: Id, name: &str) -> Result<Id, PolicyError>;
    async fn resolve_resource_type(&self, realm_id: Id, name: &str) -> Result<(Id, bool), PolicyError>;
    async fn resolve_role(&self, realm_id: Id, name: &str) -> Result<Id, PolicyError>;

    /// Resolves as many of `external_ids` as exist within `(realm,
    /// resource_type)`; unresolved ids are simply absent from the result,
    /// not reported as errors.
    async fn resolve_external_ids(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        external_ids: &[String],
    ) -> Result<Vec<(String, Id)>, PolicyError>;

    /// Every external id mapped for `resource_type`, for the Level-1
    /// public-type id_list path with no caller-supplied `external_resource_ids`.
    async fn all_external_ids(&self, realm_id: Id, resource_type_id: Id) -> Result<Vec<String>, PolicyError>;

    /// Reverse mapping for the id_list output: resources with no external
    /// id are simply absent from the returned map.
    async fn reverse_external_ids(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        resource_ids: &[Id],
    ) -> Result<HashMap<Id, String>, PolicyError>;

    async fn principal(&self, realm_id: Id, principal_id: Id) -> Result<Principal, PolicyError>;
    async fn principal_roles(&self, realm_id: Id, principal_id: Id) -> Result<Vec<Id>, PolicyError>;

    /// Active rules already scoped to `(realm, resource_type, action)` by
    /// the store's own indexed lookup; the waterfall selector still has to
    /// apply the subject/state filter.
    async fn candidate_rules(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        action_id: Id,
    ) -> Result<Vec<Rule>, PolicyError>;

    /// `SELECT EXISTS(...)` over `condition`, with `bindings` supplying
    /// the `principal`/`context` attribute bags a compiled fragment's
    /// `ctx` parameter would be bound to.
    async fn exists_match(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        condition: &Condition,
        bindings: &AttributeMap,
        restrict: Option<&[Id]>,
    ) -> Result<bool, PolicyError>;

    /// The resource ids matching `condition`, restricted by resource-type
    /// partition and optionally by `restrict`.
    async fn matching_resource_ids(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        condition: &Condition,
        bindings: &AttributeMap,
        restrict: Option<&[Id]>,
    ) -> Result<Vec<Id>, PolicyError>;

    /// Runs as a trigger on rule mutation: the caller has already
    /// validated and compiled `new_rule.condition` upstream of this call
    /// (see [`crate::compiler::compile`]); the store applies upsert
    /// semantics on the `(realm, type, action, subject, resource)` scope
    /// key, marking any prior `Active` rule at that key `Superseded`.
    async fn upsert_rule(&self, new_rule: NewRule) -> Result<Rule, PolicyError>;

    /// `Active -> Retired`: the runner must no longer consider this rule
    /// in subsequent requests.
    async fn retire_rule(&self, realm_id: Id, rule_id: Id) -> Result<(), PolicyError>;
}

/// In-memory [`Store`] implementation: a ground-truth test double, not a
/// production backend. Concurrency is a single `RwLock` over plain maps —
/// adequate for tests and the demo, not a model for a real deployment's
/// connection-pooled store.
pub struct InMemoryStore {
    state: RwLock<State>,
    next_id: AtomicI64,
}

#[derive(Default)]
struct State {
    realms: HashMap<String, Id>,
    resource_types: HashMap<(Id, String), ResourceType>,
    actions: HashMap<(Id, String), Id>,
    roles: HashMap<(Id, String), Id>,
    principals: HashMap<(Id, Id), Principal>,
    principal_roles: HashMap<(Id, Id), Vec<Id>>,
    resources: HashMap<(Id, Id), Resource>,
    external_ids: HashMap<(Id, Id, String), Id>,
    reverse_external_ids: HashMap<(Id, Id, Id), String>,
    rules: HashMap<Id, Rule>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            state: RwLock::new(State::default()),
            next_id: AtomicI64::new(1),
        }
    }

    fn next_id(&self) -> Id {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn create_realm(&self, name: &str) -> Id {
        let id = self.next_id();
        self.state.write().realms.insert(name.to_string(), id);
        id
    }

    pub fn create_resource_type(&self, realm_id: Id, name: &str, is_public: bool) -> Id {
        let id = self.next_id();
        self.state.write().resource_types.insert(
            (realm_id, name.to_string()),
            ResourceType {
                id,
                realm_id,
                name: name.to_string(),
                is_public,
            },
        );
        id
    }

    pub fn create_action(&self, realm_id: Id, name: &str) -> Id {
        let id = self.next_id();
        self.state.write().actions.insert((realm_id, name.to_string()), id);
        id
    }

    pub fn create_role(&self, realm_id: Id, name: &str) -> Id {
        let id = self.next_id();
        self.state.write().roles.insert((realm_id, name.to_string()), id);
        id
    }

    pub fn create_principal(&self, realm_id: Id, username: &str, attributes: serde_json::Value) -> Id {
        let id = self.next_id();
        self.state.write().principals.insert(
            (realm_id, id),
            Principal {
                id,
                realm_id,
                username: username.to_string(),
                attributes,
            },
        );
        id
    }

    pub fn assign_role(&self, realm_id: Id, principal_id: Id, role_id: Id) {
        self.state
            .write()
            .principal_roles
            .entry((realm_id, principal_id))
            .or_default()
            .push(role_id);
    }

    pub fn create_resource(&self, realm_id: Id, resource: Resource) -> Id {
        let id = resource.id;
        self.state.write().resources.insert((realm_id, id), resource);
        id
    }

    pub fn map_external_id(&self, realm_id: Id, resource_type_id: Id, external_id: &str, resource_id: Id) {
        let mut state = self.state.write();
        state
            .external_ids
            .insert((realm_id, resource_type_id, external_id.to_string()), resource_id);
        state
            .reverse_external_ids
            .insert((realm_id, resource_type_id, resource_id), external_id.to_string());
    }

    /// Synchronous convenience wrapper around the same upsert logic
    /// [`Store::upsert_rule`] runs — the full write path a CRUD handler
    /// would drive (`Draft -> Compiled -> Active`), usable from non-async
    /// setup code (tests, the demo binary) without a runtime.
    pub fn compile_and_create_rule(&self, new_rule: NewRule) -> Result<Rule, PolicyError> {
        self.upsert_rule_sync(new_rule)
    }

    fn upsert_rule_sync(&self, new_rule: NewRule) -> Result<Rule, PolicyError> {
        let scope_key = Self::scope_key(&new_rule);
        let mut state = self.state.write();

        let superseded_id = state.rules.values().find_map(|r| {
            let key = (r.realm_id, r.resource_type_id, r.action_id, r.subject.id(), r.resource_id);
            (key == scope_key && r.state == RuleState::Active).then_some(r.id)
        });
        if let Some(id) = superseded_id {
            if let Some(prior) = state.rules.get_mut(&id) {
                prior.state = RuleState::Superseded;
            }
        }

        let compiled = match &new_rule.condition {
            Some(condition) => Some(crate::compiler::compile(condition)?),
            None => None,
        };

        let id = self.next_id();
        let rule = Rule {
            id,
            realm_id: new_rule.realm_id,
            resource_type_id: new_rule.resource_type_id,
            action_id: new_rule.action_id,
            subject: new_rule.subject,
            resource_id: new_rule.resource_id,
            condition: new_rule.condition,
            compiled,
            state: RuleState::Active,
        };
        state.rules.insert(id, rule.clone());
        Ok(rule)
    }

    fn scope_key(rule: &NewRule) -> (Id, Id, Id, Id, Option<Id>) {
        (
            rule.realm_id,
            rule.resource_type_id,
            rule.action_id,
            rule.subject.id(),
            rule.resource_id,
        )
    }
}

impl Subject {
    fn id(&self) -> Id {
        match self {
            Subject::Role(id) | Subject::Principal(id) => *id,
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn resolve_realm(&self, realm_name: &str) -> Result<Id, PolicyError> {
        self.state
            .read()
            .realms
            .get(realm_name)
            .copied()
            .ok_or_else(|| PolicyError::unknown(EntityKind::Realm, realm_name))
    }

    async fn resolve_action(&self, realm_id: Id, name: &str) -> Result<Id, PolicyError> {
        self.state
            .read()
            .actions
            .get(&(realm_id, name.to_string()))
            .copied()
            .ok_or_else(|| PolicyError::unknown(EntityKind::Action, name))
    }

    async fn resolve_resource_type(&self, realm_id: Id, name: &str) -> Result<(Id, bool), PolicyError> {
        self.state
            .read()
            .resource_types
            .get(&(realm_id, name.to_string()))
            .map(|rt| (rt.id, rt.is_public))
            .ok_or_else(|| PolicyError::unknown(EntityKind::ResourceType, name))
    }

    async fn resolve_role(&self, realm_id: Id, name: &str) -> Result<Id, PolicyError> {
        self.state
            .read()
            .roles
            .get(&(realm_id, name.to_string()))
            .copied()
            .ok_or_else(|| PolicyError::unknown(EntityKind::Role, name))
    }

    async fn resolve_external_ids(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        external_ids: &[String],
    ) -> Result<Vec<(String, Id)>, PolicyError> {
        let state = self.state.read();
        Ok(external_ids
            .iter()
            .filter_map(|ext| {
                state
                    .external_ids
                    .get(&(realm_id, resource_type_id, ext.clone()))
                    .map(|id| (ext.clone(), *id))
            })
            .collect())
    }

    async fn all_external_ids(&self, realm_id: Id, resource_type_id: Id) -> Result<Vec<String>, PolicyError> {
        let state = self.state.read();
        Ok(state
            .external_ids
            .keys()
            .filter(|(r, t, _)| *r == realm_id && *t == resource_type_id)
            .map(|(_, _, ext)| ext.clone())
            .collect())
    }

    async fn reverse_external_ids(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        resource_ids: &[Id],
    ) -> Result<HashMap<Id, String>, PolicyError> {
        let state = self.state.read();
        Ok(resource_ids
            .iter()
            .filter_map(|rid| {
                state
                    .reverse_external_ids
                    .get(&(realm_id, resource_type_id, *rid))
                    .map(|ext| (*rid, ext.clone()))
            })
            .collect())
    }

    async fn principal(&self, realm_id: Id, principal_id: Id) -> Result<Principal, PolicyError> {
        if principal_id == crate::model::ANONYMOUS_PRINCIPAL_ID {
            return Ok(Principal::anonymous(realm_id));
        }
        self.state
            .read()
            .principals
            .get(&(realm_id, principal_id))
            .cloned()
            .ok_or_else(|| PolicyError::unknown(EntityKind::Principal, principal_id.to_string()))
    }

    async fn principal_roles(&self, realm_id: Id, principal_id: Id) -> Result<Vec<Id>, PolicyError> {
        Ok(self
            .state
            .read()
            .principal_roles
            .get(&(realm_id, principal_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn candidate_rules(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        action_id: Id,
    ) -> Result<Vec<Rule>, PolicyError> {
        Ok(self
            .state
            .read()
            .rules
            .values()
            .filter(|r| r.realm_id == realm_id && r.resource_type_id == resource_type_id && r.action_id == action_id)
            .cloned()
            .collect())
    }

    async fn exists_match(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        condition: &Condition,
        bindings: &AttributeMap,
        restrict: Option<&[Id]>,
    ) -> Result<bool, PolicyError> {
        let ids = self
            .matching_resource_ids(realm_id, resource_type_id, condition, bindings, restrict)
            .await?;
        Ok(!ids.is_empty())
    }

    async fn matching_resource_ids(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        condition: &Condition,
        bindings: &AttributeMap,
        restrict: Option<&[Id]>,
    ) -> Result<Vec<Id>, PolicyError> {
        let state = self.state.read();
        let mut matched = Vec::new();
        for ((r, rid), resource) in &state.resources {
            if *r != realm_id || resource.resource_type_id != resource_type_id {
                continue;
            }
            if let Some(allowed) = restrict {
                if !allowed.contains(rid) {
                    continue;
                }
            }
            if interpret::evaluate(condition, resource, bindings) {
                matched.push(*rid);
            }
        }
        matched.sort_unstable();
        Ok(matched)
    }

    async fn upsert_rule(&self, new_rule: NewRule) -> Result<Rule, PolicyError> {
        self.upsert_rule_sync(new_rule)
    }

    async fn retire_rule(&self, realm_id: Id, rule_id: Id) -> Result<(), PolicyError> {
        let mut state = self.state.write();
        if let Some(rule) = state.rules.get_mut(&rule_id) {
            if rule.realm_id == realm_id {
                rule.state = RuleState::Retired;
            }
        }
        Ok(())
    }
}
