//! The authorization runner: the pipeline that ties every other component
//! together behind the two operations external callers actually use —
//! [`AuthorizationRunner::check_access`] and
//! [`AuthorizationRunner::get_authorization_conditions`].
//!
//! Per request: resolve names via the [`crate::cache`] → apply the
//! [`crate::waterfall`] selector → residualize each candidate rule against
//! the bound request → either short-circuit to a verdict or assemble a
//! combined predicate and execute it against the [`crate::store`] boundary.
//! The pipeline runs inside the same cooperative-cancellation and
//! backpressure shape as [`crate::execution`].

use crate::cache::{NameIdCache, SingleFlightCache};
use crate::dsl::{Condition, Leaf, Operator, Source, Value};
use crate::error::{EntityKind, PolicyError};
use crate::execution::limits::PoolLimiter;
use crate::execution::timeout::RequestDeadline;
use crate::model::{AttributeMap, Id, ResourceType, Rule, ANONYMOUS_PRINCIPAL_ID};
use crate::residual::{residualize, Residual, Verdict};
use crate::store::Store;
use crate::waterfall::{self, Selection};
use crate::{audit::AuditSink, config::RunnerConfig};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Whether an access item wants a yes/no answer or the set of authorized
/// resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnType {
    Decision,
    IdList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessItem {
    pub resource_type_name: String,
    pub action_name: String,
    pub return_type: ReturnType,
    #[serde(default)]
    pub external_resource_ids: Option<Vec<String>>,
}

/// Request-time `principal`/`context` bindings. `principal_id`
/// is `None` for an anonymous request — the subject set still always
/// contains [`ANONYMOUS_PRINCIPAL_ID`].
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub principal_id: Option<Id>,
    pub context: JsonValue,
}

#[derive(Debug, Clone)]
pub struct CheckAccessRequest {
    pub realm_name: String,
    pub req_access: Vec<AccessItem>,
    pub role_names: Option<Vec<String>>,
    pub auth_context: Option<AuthContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Answer {
    Decision(bool),
    IdList(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessResult {
    pub resource_type_name: String,
    pub action_name: String,
    pub answer: Answer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckAccessResponse {
    pub results: Vec<AccessResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    GrantedAll,
    DeniedAll,
    Conditions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConditions {
    pub filter_type: FilterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions_dsl: Option<Condition>,
    pub has_context_refs: bool,
}

/// The residualized shape of a `(resource_type, action)`'s applicable
/// rules, shared by both public entry points. `live` trees still carry
/// their original `principal`/`context` leaves — a store query binds
/// those against `ctx` directly, so the runner never needs to recompile
/// a residual tree to execute a request; `residual` trees are the
/// resource-only reductions [`get_authorization_conditions`] hands back
/// to a caller that has no `ctx` of its own to bind.
struct Assembled {
    granted_all: bool,
    live: Vec<Condition>,
    residual: Vec<Condition>,
    has_context_refs: bool,
}

fn resource_id_leaf(resource_id: Id) -> Condition {
    Condition::leaf_node(
        Operator::Eq,
        Leaf {
            source: Source::Resource,
            attr: "id".to_string(),
            val: Value::Number(resource_id as f64),
            args: None,
        },
    )
}

fn disjoin(conditions: Vec<Condition>) -> Condition {
    match conditions.len() {
        0 => Condition::FALSE,
        1 => conditions.into_iter().next().expect("length checked above"),
        _ => Condition::Or { conditions },
    }
}

fn contains_non_resource_leaf(condition: &Condition) -> bool {
    match condition {
        Condition::And { conditions } | Condition::Or { conditions } | Condition::Not { conditions } => {
            conditions.iter().any(contains_non_resource_leaf)
        }
        leaf_node => leaf_node
            .leaf()
            .map(|l| l.source != Source::Resource)
            .unwrap_or(false),
    }
}

/// Residualizes every selected rule against `bindings`, splitting the
/// outcome into the three shapes the two entry points need.
fn assemble(type_scoped: &[&Rule], resource_scoped: &[&Rule], bindings: &AttributeMap) -> Assembled {
    let mut live = Vec::new();
    let mut residual = Vec::new();
    let mut has_context_refs = false;

    for rule in type_scoped {
        let condition = rule.condition.clone().unwrap_or(Condition::TRUE);
        has_context_refs |= contains_non_resource_leaf(&condition);
        match residualize(&condition, bindings) {
            Residual::Verdict(Verdict::GrantedAll) => {
                return Assembled {
                    granted_all: true,
                    live: Vec::new(),
                    residual: Vec::new(),
                    has_context_refs,
                };
            }
            Residual::Verdict(Verdict::DeniedAll) => continue,
            Residual::Tree(t) => {
                live.push(condition);
                residual.push(t);
            }
        }
    }

    for rule in resource_scoped {
        let resource_id = rule.resource_id.expect("resource-scoped rule always has a resource_id");
        let condition = rule.condition.clone().unwrap_or(Condition::TRUE);
        has_context_refs |= contains_non_resource_leaf(&condition);
        let id_leaf = resource_id_leaf(resource_id);
        match residualize(&condition, bindings) {
            Residual::Verdict(Verdict::DeniedAll) => continue,
            Residual::Verdict(Verdict::GrantedAll) => {
                live.push(id_leaf.clone());
                residual.push(id_leaf);
            }
            Residual::Tree(t) => {
                live.push(Condition::And {
                    conditions: vec![id_leaf.clone(), condition],
                });
                residual.push(Condition::And {
                    conditions: vec![id_leaf, t],
                });
            }
        }
    }

    Assembled {
        granted_all: false,
        live,
        residual,
        has_context_refs,
    }
}

/// Retries a `StoreFailure` exactly once per request; a second failure
/// surfaces as an error. Every other error propagates immediately.
async fn with_retry<T, F, Fut>(op: F) -> Result<T, PolicyError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, PolicyError>>,
{
    match op().await {
        Err(PolicyError::StoreFailure { detail, retried: false }) => {
            tracing::warn!(detail = %detail, "store_failure_retrying");
            match op().await {
                Err(PolicyError::StoreFailure { detail, .. }) => Err(PolicyError::StoreFailure { detail, retried: true }),
                other => other,
            }
        }
        other => other,
    }
}

/// Orchestrates the pipeline over a generic [`Store`]. Holds no state of
/// its own beyond the cache and the shared admission-control primitives —
/// callers own the store and decide its backend.
pub struct AuthorizationRunner<S: Store> {
    store: Arc<S>,
    cache: Arc<NameIdCache>,
    realm_ids: SingleFlightCache<String, Id>,
    audit: AuditSink,
    pool: PoolLimiter,
    config: RunnerConfig,
}

impl<S: Store + 'static> AuthorizationRunner<S> {
    pub fn new(store: Arc<S>, config: RunnerConfig) -> (Self, tokio::sync::mpsc::Receiver<crate::audit::AuditRecord>) {
        let (audit, receiver) = AuditSink::new(config.audit_queue_capacity);
        let runner = AuthorizationRunner {
            store,
            cache: Arc::new(NameIdCache::new(Duration::from_secs(300))),
            realm_ids: SingleFlightCache::new(Duration::from_secs(300)),
            audit,
            pool: PoolLimiter::new(10, 5),
            config,
        };
        (runner, receiver)
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = Arc::new(NameIdCache::new(ttl));
        self.realm_ids = SingleFlightCache::new(ttl);
        self
    }

    pub fn with_pool_limits(mut self, pool_size: u32, overflow_limit: u32) -> Self {
        self.pool = PoolLimiter::new(pool_size, overflow_limit);
        self
    }

    async fn resolve_realm(&self, realm_name: &str) -> Result<Id, PolicyError> {
        let store = Arc::clone(&self.store);
        let name = realm_name.to_string();
        self.realm_ids
            .get_or_fetch(realm_name.to_string(), move || async move { store.resolve_realm(&name).await })
            .await
    }

    async fn resolve_action(&self, realm_id: Id, realm_name: &str, name: &str) -> Result<Id, PolicyError> {
        let bucket = self.cache.realm(realm_name);
        let store = Arc::clone(&self.store);
        let owned = name.to_string();
        bucket
            .actions
            .get_or_fetch(name.to_string(), move || async move { store.resolve_action(realm_id, &owned).await })
            .await
    }

    async fn resolve_type(&self, realm_id: Id, realm_name: &str, name: &str) -> Result<(Id, bool), PolicyError> {
        let bucket = self.cache.realm(realm_name);
        let store = Arc::clone(&self.store);
        let owned = name.to_string();
        bucket
            .types
            .get_or_fetch(name.to_string(), move || async move {
                store.resolve_resource_type(realm_id, &owned).await
            })
            .await
    }

    async fn resolve_role(&self, realm_id: Id, realm_name: &str, name: &str) -> Result<Id, PolicyError> {
        let bucket = self.cache.realm(realm_name);
        let store = Arc::clone(&self.store);
        let owned = name.to_string();
        bucket
            .roles
            .get_or_fetch(name.to_string(), move || async move { store.resolve_role(realm_id, &owned).await })
            .await
    }

    /// Resolves `role_names` to ids, silently dropping names that don't
    /// exist in this realm — an unresolvable override name simply never
    /// matches any rule, it isn't a per-item error.
    async fn resolve_role_names(&self, realm_id: Id, realm_name: &str, role_names: &[String]) -> Vec<Id> {
        let mut ids = Vec::with_capacity(role_names.len());
        for name in role_names {
            if let Ok(id) = self.resolve_role(realm_id, realm_name, name).await {
                ids.push(id);
            }
        }
        ids
    }

    /// Resolves as many `external_resource_ids` as exist, through the
    /// cache's `(type_id, external_id)` slice. Unresolved ids are silently
    /// excluded from the result.
    async fn resolve_external_ids_cached(
        &self,
        realm_id: Id,
        realm_name: &str,
        type_id: Id,
        external_ids: &[String],
    ) -> Vec<(String, Id)> {
        let bucket = self.cache.realm(realm_name);
        let mut resolved = Vec::with_capacity(external_ids.len());
        for ext in external_ids {
            let store = Arc::clone(&self.store);
            let ext_owned = ext.clone();
            let result = bucket
                .external_ids
                .get_or_fetch((type_id, ext.clone()), move || async move {
                    let found = store
                        .resolve_external_ids(realm_id, type_id, std::slice::from_ref(&ext_owned))
                        .await?;
                    found
                        .into_iter()
                        .next()
                        .map(|(_, id)| id)
                        .ok_or_else(|| PolicyError::unknown(EntityKind::Resource, ext_owned.clone()))
                })
                .await;
            if let Ok(id) = result {
                resolved.push((ext.clone(), id));
            }
        }
        resolved
    }

    fn principal_bindings(&self, principal_attributes: JsonValue, context: JsonValue) -> AttributeMap {
        let mut bindings = AttributeMap::new();
        bindings.insert("principal".to_string(), principal_attributes);
        bindings.insert("context".to_string(), context);
        bindings
    }

    /// Checks every requested item in one call. Each `req_access` item runs
    /// concurrently, bounded by `config.max_concurrent_items`, and results
    /// are reassembled in the request's declared order.
    pub async fn check_access(&self, request: &CheckAccessRequest) -> Result<CheckAccessResponse, PolicyError> {
        let deadline = RequestDeadline::new(Duration::from_millis(self.config.default_timeout_ms));
        let realm_id = self.resolve_realm(&request.realm_name).await?;

        let auth_context = request.auth_context.clone().unwrap_or_default();
        let principal_id = auth_context.principal_id.unwrap_or(ANONYMOUS_PRINCIPAL_ID);
        let principal = with_retry(|| self.store.principal(realm_id, principal_id)).await?;
        let principal_roles = with_retry(|| self.store.principal_roles(realm_id, principal_id)).await?;
        let bindings = self.principal_bindings(principal.attributes.clone(), auth_context.context.clone());

        let role_override = match &request.role_names {
            Some(names) => Some(self.resolve_role_names(realm_id, &request.realm_name, names).await),
            None => None,
        };
        let subjects = waterfall::subject_set(principal_id, &principal_roles, role_override.as_deref());

        let limit = self.config.max_concurrent_items.max(1);
        let mut indexed: Vec<(usize, Result<AccessResult, PolicyError>)> = stream::iter(request.req_access.iter().enumerate())
            .map(|(idx, item)| {
                let bindings = &bindings;
                let subjects = &subjects;
                let deadline = deadline.clone();
                async move {
                    let result = self
                        .process_item(realm_id, &request.realm_name, item, &subjects.clone(), bindings, &deadline)
                        .await;
                    (idx, result)
                }
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        indexed.sort_by_key(|(idx, _)| *idx);
        let mut results = Vec::with_capacity(indexed.len());
        for (_, result) in indexed {
            results.push(result?);
        }
        tracing::debug!(realm = %request.realm_name, items = results.len(), "check_access_complete");
        Ok(CheckAccessResponse { results })
    }

    async fn process_item(
        &self,
        realm_id: Id,
        realm_name: &str,
        item: &AccessItem,
        subjects: &HashSet<Id>,
        bindings: &AttributeMap,
        deadline: &RequestDeadline,
    ) -> Result<AccessResult, PolicyError> {
        let _pool_guard = self.pool.acquire().map_err(|e| {
            tracing::warn!(realm = %realm_name, resource_type = %item.resource_type_name, "pool_exhausted");
            e
        })?;
        deadline.check()?;

        let action_id = match self.resolve_action(realm_id, realm_name, &item.action_name).await {
            Ok(id) => id,
            Err(PolicyError::UnknownEntity { kind, name }) => {
                tracing::debug!(realm = %realm_name, kind = %kind, name = %name, "unknown_entity_denies_item");
                return Ok(self.deny_result(item));
            }
            Err(e) => return Err(e),
        };
        let (type_id, is_public) = match self.resolve_type(realm_id, realm_name, &item.resource_type_name).await {
            Ok(v) => v,
            Err(PolicyError::UnknownEntity { kind, name }) => {
                tracing::debug!(realm = %realm_name, kind = %kind, name = %name, "unknown_entity_denies_item");
                return Ok(self.deny_result(item));
            }
            Err(e) => return Err(e),
        };

        if is_public {
            let answer = self.public_answer(realm_id, type_id, item).await?;
            self.record_audit(realm_name, item, "granted_all", deadline);
            return Ok(AccessResult {
                resource_type_name: item.resource_type_name.clone(),
                action_name: item.action_name.clone(),
                answer,
            });
        }

        let resolved_external = match &item.external_resource_ids {
            Some(ids) => Some(self.resolve_external_ids_cached(realm_id, realm_name, type_id, ids).await),
            None => None,
        };
        let restrict_ids: Option<Vec<Id>> = resolved_external.as_ref().map(|v| v.iter().map(|(_, id)| *id).collect());

        let candidate_rules = with_retry(|| self.store.candidate_rules(realm_id, type_id, action_id)).await?;
        let resource_type = ResourceType {
            id: type_id,
            realm_id,
            name: item.resource_type_name.clone(),
            is_public: false,
        };
        let selection = waterfall::select(&resource_type, &candidate_rules, subjects);
        let (type_scoped, resource_scoped) = match selection {
            Selection::PublicGrant => unreachable!("is_public already handled above"),
            Selection::Candidates { type_scoped, resource_scoped } => (type_scoped, resource_scoped),
        };
        let assembled = assemble(&type_scoped, &resource_scoped, bindings);

        let answer = if assembled.granted_all {
            self.record_audit(realm_name, item, "granted_all", deadline);
            self.public_answer(realm_id, type_id, item).await?
        } else if assembled.live.is_empty() {
            self.record_audit(realm_name, item, "denied_all", deadline);
            match item.return_type {
                ReturnType::Decision => Answer::Decision(false),
                ReturnType::IdList => Answer::IdList(Vec::new()),
            }
        } else {
            let combined = disjoin(assembled.live);
            match item.return_type {
                ReturnType::Decision => {
                    let restrict = restrict_ids.as_deref();
                    let decided =
                        with_retry(|| self.store.exists_match(realm_id, type_id, &combined, bindings, restrict)).await?;
                    self.record_audit(realm_name, item, if decided { "conditions_true" } else { "conditions_false" }, deadline);
                    Answer::Decision(decided)
                }
                ReturnType::IdList => {
                    let restrict = restrict_ids.as_deref();
                    let ids =
                        with_retry(|| self.store.matching_resource_ids(realm_id, type_id, &combined, bindings, restrict)).await?;
                    let reverse = with_retry(|| self.store.reverse_external_ids(realm_id, type_id, &ids)).await?;
                    let mut external = reverse.into_values().collect::<Vec<_>>();
                    external.sort();
                    self.record_audit(realm_name, item, "conditions", deadline);
                    Answer::IdList(external)
                }
            }
        };

        Ok(AccessResult {
            resource_type_name: item.resource_type_name.clone(),
            action_name: item.action_name.clone(),
            answer,
        })
    }

    /// Shared by the Level-1 public short-circuit and a type-scoped rule
    /// that residualizes to `GrantedAll`: both mean "every resource of
    /// this type is authorized".
    async fn public_answer(&self, realm_id: Id, type_id: Id, item: &AccessItem) -> Result<Answer, PolicyError> {
        Ok(match item.return_type {
            ReturnType::Decision => Answer::Decision(true),
            ReturnType::IdList => {
                let ids = match &item.external_resource_ids {
                    Some(ids) => ids.clone(),
                    None => with_retry(|| self.store.all_external_ids(realm_id, type_id)).await?,
                };
                Answer::IdList(ids)
            }
        })
    }

    fn deny_result(&self, item: &AccessItem) -> AccessResult {
        AccessResult {
            resource_type_name: item.resource_type_name.clone(),
            action_name: item.action_name.clone(),
            answer: match item.return_type {
                ReturnType::Decision => Answer::Decision(false),
                ReturnType::IdList => Answer::IdList(Vec::new()),
            },
        }
    }

    fn record_audit(&self, realm_name: &str, item: &AccessItem, decision: &str, deadline: &RequestDeadline) {
        if deadline.is_cancelled() {
            return;
        }
        self.audit.record(crate::audit::AuditRecord {
            realm_name: realm_name.to_string(),
            resource_type_name: item.resource_type_name.clone(),
            action_name: item.action_name.clone(),
            decision: decision.to_string(),
            at: chrono::Utc::now(),
        });
    }

    /// Returns a verdict or a residual DSL for the given type/action under
    /// `auth_context`; never executes a query itself.
    pub async fn get_authorization_conditions(
        &self,
        realm_name: &str,
        resource_type_name: &str,
        action_name: &str,
        auth_context: Option<&AuthContext>,
        role_names: Option<&[String]>,
    ) -> Result<AuthorizationConditions, PolicyError> {
        let realm_id = self.resolve_realm(realm_name).await?;
        let default_ctx = AuthContext::default();
        let auth_context = auth_context.unwrap_or(&default_ctx);
        let principal_id = auth_context.principal_id.unwrap_or(ANONYMOUS_PRINCIPAL_ID);
        let principal = with_retry(|| self.store.principal(realm_id, principal_id)).await?;
        let principal_roles = with_retry(|| self.store.principal_roles(realm_id, principal_id)).await?;
        let bindings = self.principal_bindings(principal.attributes.clone(), auth_context.context.clone());

        let role_override = match role_names {
            Some(names) => Some(self.resolve_role_names(realm_id, realm_name, names).await),
            None => None,
        };
        let subjects = waterfall::subject_set(principal_id, &principal_roles, role_override.as_deref());

        let action_id = match self.resolve_action(realm_id, realm_name, action_name).await {
            Ok(id) => id,
            Err(PolicyError::UnknownEntity { .. }) => {
                return Ok(AuthorizationConditions {
                    filter_type: FilterType::DeniedAll,
                    conditions_dsl: None,
                    has_context_refs: false,
                })
            }
            Err(e) => return Err(e),
        };
        let (type_id, is_public) = match self.resolve_type(realm_id, realm_name, resource_type_name).await {
            Ok(v) => v,
            Err(PolicyError::UnknownEntity { .. }) => {
                return Ok(AuthorizationConditions {
                    filter_type: FilterType::DeniedAll,
                    conditions_dsl: None,
                    has_context_refs: false,
                })
            }
            Err(e) => return Err(e),
        };

        if is_public {
            return Ok(AuthorizationConditions {
                filter_type: FilterType::GrantedAll,
                conditions_dsl: None,
                has_context_refs: false,
            });
        }

        let candidate_rules = with_retry(|| self.store.candidate_rules(realm_id, type_id, action_id)).await?;
        let resource_type = ResourceType {
            id: type_id,
            realm_id,
            name: resource_type_name.to_string(),
            is_public: false,
        };
        let (type_scoped, resource_scoped) = match waterfall::select(&resource_type, &candidate_rules, &subjects) {
            Selection::PublicGrant => unreachable!("is_public already handled above"),
            Selection::Candidates { type_scoped, resource_scoped } => (type_scoped, resource_scoped),
        };
        let assembled = assemble(&type_scoped, &resource_scoped, &bindings);

        if assembled.granted_all {
            return Ok(AuthorizationConditions {
                filter_type: FilterType::GrantedAll,
                conditions_dsl: None,
                has_context_refs: assembled.has_context_refs,
            });
        }
        if assembled.residual.is_empty() {
            return Ok(AuthorizationConditions {
                filter_type: FilterType::DeniedAll,
                conditions_dsl: None,
                has_context_refs: assembled.has_context_refs,
            });
        }
        Ok(AuthorizationConditions {
            filter_type: FilterType::Conditions,
            conditions_dsl: Some(disjoin(assembled.residual)),
            has_context_refs: assembled.has_context_refs,
        })
    }
}
