//! Postgres/PostGIS-backed [`Store`]. Where [`super::InMemoryStore`]
//! interprets a condition tree directly, this implementation compiles it
//! with [`crate::compiler::compile`] and executes the resulting fragment
//! against a `resources` table partitioned by `(realm_id, resource_type_id)`.
//! Row mapping uses `sqlx::Row` with manual column extraction rather than
//! a derived `FromRow`, since `condition`/`compiled` round-trip through
//! JSONB columns this crate owns the (de)serialization of.
//!
//! Expected schema (realm-scoped tables; DDL/migrations are out of scope):
//!
//! ```sql
//! -- realms(id, name)
//! -- resource_types(id, realm_id, name, is_public)
//! -- actions(id, realm_id, name)
//! -- roles(id, realm_id, name, attributes jsonb)
//! -- principals(id, realm_id, username, attributes jsonb)
//! -- principal_roles(realm_id, principal_id, role_id)
//! -- resources(id, realm_id, resource_type_id, attributes jsonb, geometry geometry(Geometry, 4326))
//! -- external_id_mappings(realm_id, resource_type_id, external_id, resource_id)
//! -- rules(id, realm_id, resource_type_id, action_id, subject_role_id, subject_principal_id,
//! --        resource_id, condition jsonb, compiled_sql text, compiled_placeholders jsonb,
//! --        tree_hash text, state text)
//! ```

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgArguments;
use sqlx::{Arguments, PgPool, Row};
use std::collections::HashMap;

use crate::compiler::{CastType, Placeholder};
use crate::dsl::Condition;
use crate::error::{EntityKind, PolicyError};
use crate::model::{AttributeMap, CompiledFragment, Id, Principal, Rule, RuleState, Subject};

use super::{NewRule, Store};

/// One pool, errors folded into the crate's own taxonomy rather than
/// leaking `sqlx::Error` across the `Store` boundary.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

fn store_failure(err: sqlx::Error) -> PolicyError {
    PolicyError::StoreFailure {
        detail: err.to_string(),
        retried: false,
    }
}

fn rule_state_from_str(s: &str) -> RuleState {
    match s {
        "draft" => RuleState::Draft,
        "compiled" => RuleState::Compiled,
        "active" => RuleState::Active,
        "superseded" => RuleState::Superseded,
        _ => RuleState::Retired,
    }
}

fn rule_state_as_str(s: RuleState) -> &'static str {
    match s {
        RuleState::Draft => "draft",
        RuleState::Compiled => "compiled",
        RuleState::Active => "active",
        RuleState::Superseded => "superseded",
        RuleState::Retired => "retired",
    }
}

fn row_to_rule(row: &sqlx::postgres::PgRow) -> Result<Rule, PolicyError> {
    let subject_role_id: Option<Id> = row.try_get("subject_role_id").map_err(store_failure)?;
    let subject_principal_id: Option<Id> = row.try_get("subject_principal_id").map_err(store_failure)?;
    let subject = match (subject_role_id, subject_principal_id) {
        (Some(id), None) => Subject::Role(id),
        (None, Some(id)) => Subject::Principal(id),
        _ => return Err(PolicyError::invalid_policy("rule row has an invalid subject pair")),
    };

    let condition_json: Option<JsonValue> = row.try_get("condition").map_err(store_failure)?;
    let condition = condition_json
        .map(|v| serde_json::from_value::<Condition>(v))
        .transpose()
        .map_err(|e| PolicyError::invalid_policy(format!("stored condition failed to deserialize: {e}")))?;

    let compiled_sql: Option<String> = row.try_get("compiled_sql").map_err(store_failure)?;
    let compiled = match compiled_sql {
        Some(sql) => {
            let placeholders_json: JsonValue = row.try_get("compiled_placeholders").map_err(store_failure)?;
            let placeholders: Vec<Placeholder> = serde_json::from_value(placeholders_json)
                .map_err(|e| PolicyError::invalid_policy(format!("stored placeholders failed to deserialize: {e}")))?;
            let tree_hash: String = row.try_get("tree_hash").map_err(store_failure)?;
            Some(CompiledFragment { sql, placeholders, tree_hash })
        }
        None => None,
    };

    let state_str: String = row.try_get("state").map_err(store_failure)?;

    Ok(Rule {
        id: row.try_get("id").map_err(store_failure)?,
        realm_id: row.try_get("realm_id").map_err(store_failure)?,
        resource_type_id: row.try_get("resource_type_id").map_err(store_failure)?,
        action_id: row.try_get("action_id").map_err(store_failure)?,
        subject,
        resource_id: row.try_get("resource_id").map_err(store_failure)?,
        condition,
        compiled,
        state: rule_state_from_str(&state_str),
    })
}

/// Placeholders in a [`CompiledFragment`] are numbered `$1..$n` from the
/// compiler's own perspective; this query binds them after two fixed
/// positional parameters (realm, resource type), so every `$k` in the
/// fragment's SQL text is shifted by `offset`. Fragment text only ever
/// contains ASCII digits after `$`, so a byte-level scan is sufficient —
/// no need to pull in a regex dependency for this one rewrite.
fn renumber_placeholders(sql: &str, offset: usize) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start {
                let n: usize = sql[start..end].parse().expect("scanned only ascii digits");
                out.push('$');
                out.push_str(&(n + offset).to_string());
                i = end;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// The compiler emits `ctx->'principal'->...` / `ctx->'context'->...` against
/// the free identifier `ctx`; at bind time that identifier is replaced with a
/// parenthesized, explicitly cast bind parameter carrying the request's
/// combined principal/context document.
fn substitute_ctx(sql: &str, ctx_param: usize) -> String {
    sql.replace("ctx->", &format!("(${ctx_param}::jsonb)->"))
}

fn bind_placeholder(args: &mut PgArguments, ph: &Placeholder) -> Result<(), PolicyError> {
    match ph.cast {
        CastType::Numeric => {
            let v: f64 = ph
                .text_value
                .parse()
                .map_err(|_| PolicyError::invalid_policy(format!("placeholder '{}' is not numeric", ph.text_value)))?;
            args.add(v).map_err(|e| PolicyError::invalid_policy(e.to_string()))
        }
        CastType::Boolean => {
            let v: bool = ph
                .text_value
                .parse()
                .map_err(|_| PolicyError::invalid_policy(format!("placeholder '{}' is not boolean", ph.text_value)))?;
            args.add(v).map_err(|e| PolicyError::invalid_policy(e.to_string()))
        }
        CastType::Text => args.add(&ph.text_value).map_err(|e| PolicyError::invalid_policy(e.to_string())),
        CastType::Jsonb => {
            let v: JsonValue = serde_json::from_str(&ph.text_value)
                .map_err(|e| PolicyError::invalid_policy(format!("placeholder jsonb literal invalid: {e}")))?;
            args.add(sqlx::types::Json(v)).map_err(|e| PolicyError::invalid_policy(e.to_string()))
        }
    }
}

/// Builds the full `WHERE` clause and its bind arguments for a
/// `(condition, bindings)` pair scoped to `(realm_id, resource_type_id)`,
/// optionally restricted to `restrict`: `$1`/`$2` are always realm and
/// resource type, the fragment's own placeholders follow, then the `ctx`
/// document, then `restrict` if present.
fn build_predicate(
    fragment: &CompiledFragment,
    realm_id: Id,
    resource_type_id: Id,
    bindings: &AttributeMap,
    restrict: Option<&[Id]>,
) -> Result<(String, PgArguments), PolicyError> {
    let mut args = PgArguments::default();
    args.add(realm_id).map_err(|e| PolicyError::invalid_policy(e.to_string()))?;
    args.add(resource_type_id).map_err(|e| PolicyError::invalid_policy(e.to_string()))?;

    let mut sql = renumber_placeholders(&fragment.sql, 2);
    for ph in &fragment.placeholders {
        bind_placeholder(&mut args, ph)?;
    }

    if sql.contains("ctx->") {
        let ctx_param = args.len() + 1;
        sql = substitute_ctx(&sql, ctx_param);
        let ctx_doc = JsonValue::Object(bindings.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        args.add(sqlx::types::Json(ctx_doc)).map_err(|e| PolicyError::invalid_policy(e.to_string()))?;
    }

    let mut where_clause = format!(
        "resource.realm_id = $1 AND resource.resource_type_id = $2 AND ({sql})"
    );
    if let Some(ids) = restrict {
        let restrict_param = args.len() + 1;
        args.add(ids.to_vec()).map_err(|e| PolicyError::invalid_policy(e.to_string()))?;
        where_clause.push_str(&format!(" AND resource.id = ANY(${restrict_param})"));
    }

    Ok((where_clause, args))
}

#[async_trait]
impl Store for PgStore {
    async fn resolve_realm(&self, realm_name: &str) -> Result<Id, PolicyError> {
        sqlx::query_scalar::<_, Id>("SELECT id FROM realms WHERE name = $1")
            .bind(realm_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| PolicyError::unknown(EntityKind::Realm, realm_name))
    }

    async fn resolve_action(&self, realm_id: Id, name: &str) -> Result<Id, PolicyError> {
        sqlx::query_scalar::<_, Id>("SELECT id FROM actions WHERE realm_id = $1 AND name = $2")
            .bind(realm_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| PolicyError::unknown(EntityKind::Action, name))
    }

    async fn resolve_resource_type(&self, realm_id: Id, name: &str) -> Result<(Id, bool), PolicyError> {
        sqlx::query_as::<_, (Id, bool)>(
            "SELECT id, is_public FROM resource_types WHERE realm_id = $1 AND name = $2",
        )
        .bind(realm_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| PolicyError::unknown(EntityKind::ResourceType, name))
    }

    async fn resolve_role(&self, realm_id: Id, name: &str) -> Result<Id, PolicyError> {
        sqlx::query_scalar::<_, Id>("SELECT id FROM roles WHERE realm_id = $1 AND name = $2")
            .bind(realm_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| PolicyError::unknown(EntityKind::Role, name))
    }

    async fn resolve_external_ids(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        external_ids: &[String],
    ) -> Result<Vec<(String, Id)>, PolicyError> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, (String, Id)>(
            "SELECT external_id, resource_id FROM external_id_mappings \
             WHERE realm_id = $1 AND resource_type_id = $2 AND external_id = ANY($3)",
        )
        .bind(realm_id)
        .bind(resource_type_id)
        .bind(external_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(store_failure)
    }

    async fn all_external_ids(&self, realm_id: Id, resource_type_id: Id) -> Result<Vec<String>, PolicyError> {
        sqlx::query_scalar::<_, String>(
            "SELECT external_id FROM external_id_mappings WHERE realm_id = $1 AND resource_type_id = $2",
        )
        .bind(realm_id)
        .bind(resource_type_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_failure)
    }

    async fn reverse_external_ids(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        resource_ids: &[Id],
    ) -> Result<HashMap<Id, String>, PolicyError> {
        if resource_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, (Id, String)>(
            "SELECT resource_id, external_id FROM external_id_mappings \
             WHERE realm_id = $1 AND resource_type_id = $2 AND resource_id = ANY($3)",
        )
        .bind(realm_id)
        .bind(resource_type_id)
        .bind(resource_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(store_failure)?;
        Ok(rows.into_iter().collect())
    }

    async fn principal(&self, realm_id: Id, principal_id: Id) -> Result<Principal, PolicyError> {
        if principal_id == crate::model::ANONYMOUS_PRINCIPAL_ID {
            return Ok(Principal::anonymous(realm_id));
        }
        let row = sqlx::query_as::<_, (Id, Id, String, JsonValue)>(
            "SELECT id, realm_id, username, attributes FROM principals WHERE realm_id = $1 AND id = $2",
        )
        .bind(realm_id)
        .bind(principal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| PolicyError::unknown(EntityKind::Principal, principal_id.to_string()))?;
        Ok(Principal { id: row.0, realm_id: row.1, username: row.2, attributes: row.3 })
    }

    async fn principal_roles(&self, realm_id: Id, principal_id: Id) -> Result<Vec<Id>, PolicyError> {
        sqlx::query_scalar::<_, Id>(
            "SELECT role_id FROM principal_roles WHERE realm_id = $1 AND principal_id = $2",
        )
        .bind(realm_id)
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_failure)
    }

    async fn candidate_rules(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        action_id: Id,
    ) -> Result<Vec<Rule>, PolicyError> {
        let rows = sqlx::query(
            "SELECT id, realm_id, resource_type_id, action_id, subject_role_id, subject_principal_id, \
             resource_id, condition, compiled_sql, compiled_placeholders, tree_hash, state \
             FROM rules WHERE realm_id = $1 AND resource_type_id = $2 AND action_id = $3 AND state = 'active'",
        )
        .bind(realm_id)
        .bind(resource_type_id)
        .bind(action_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_failure)?;
        rows.iter().map(row_to_rule).collect()
    }

    async fn exists_match(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        condition: &Condition,
        bindings: &AttributeMap,
        restrict: Option<&[Id]>,
    ) -> Result<bool, PolicyError> {
        let fragment = crate::compiler::compile(condition)?;
        let (where_clause, args) = build_predicate(&fragment, realm_id, resource_type_id, bindings, restrict)?;
        let sql = format!("SELECT EXISTS(SELECT 1 FROM resources AS resource WHERE {where_clause})");
        sqlx::query_scalar_with::<_, bool, _>(&sql, args)
            .fetch_one(&self.pool)
            .await
            .map_err(store_failure)
    }

    async fn matching_resource_ids(
        &self,
        realm_id: Id,
        resource_type_id: Id,
        condition: &Condition,
        bindings: &AttributeMap,
        restrict: Option<&[Id]>,
    ) -> Result<Vec<Id>, PolicyError> {
        let fragment = crate::compiler::compile(condition)?;
        let (where_clause, args) = build_predicate(&fragment, realm_id, resource_type_id, bindings, restrict)?;
        let sql = format!("SELECT resource.id FROM resources AS resource WHERE {where_clause} ORDER BY resource.id");
        sqlx::query_scalar_with::<_, Id, _>(&sql, args)
            .fetch_all(&self.pool)
            .await
            .map_err(store_failure)
    }

    async fn upsert_rule(&self, new_rule: NewRule) -> Result<Rule, PolicyError> {
        let compiled = match &new_rule.condition {
            Some(condition) => Some(crate::compiler::compile(condition)?),
            None => None,
        };

        let (subject_role_id, subject_principal_id) = match new_rule.subject {
            Subject::Role(id) => (Some(id), None),
            Subject::Principal(id) => (None, Some(id)),
        };
        let condition_json = new_rule
            .condition
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| PolicyError::invalid_policy(e.to_string()))?;
        let placeholders_json = compiled
            .as_ref()
            .map(|c| serde_json::to_value(&c.placeholders))
            .transpose()
            .map_err(|e| PolicyError::invalid_policy(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(store_failure)?;

        sqlx::query(
            "UPDATE rules SET state = 'superseded' \
             WHERE realm_id = $1 AND resource_type_id = $2 AND action_id = $3 \
               AND subject_role_id IS NOT DISTINCT FROM $4 \
               AND subject_principal_id IS NOT DISTINCT FROM $5 \
               AND resource_id IS NOT DISTINCT FROM $6 \
               AND state = 'active'",
        )
        .bind(new_rule.realm_id)
        .bind(new_rule.resource_type_id)
        .bind(new_rule.action_id)
        .bind(subject_role_id)
        .bind(subject_principal_id)
        .bind(new_rule.resource_id)
        .execute(&mut *tx)
        .await
        .map_err(store_failure)?;

        let row = sqlx::query(
            "INSERT INTO rules (realm_id, resource_type_id, action_id, subject_role_id, subject_principal_id, \
             resource_id, condition, compiled_sql, compiled_placeholders, tree_hash, state) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'active') \
             RETURNING id, realm_id, resource_type_id, action_id, subject_role_id, subject_principal_id, \
             resource_id, condition, compiled_sql, compiled_placeholders, tree_hash, state",
        )
        .bind(new_rule.realm_id)
        .bind(new_rule.resource_type_id)
        .bind(new_rule.action_id)
        .bind(subject_role_id)
        .bind(subject_principal_id)
        .bind(new_rule.resource_id)
        .bind(condition_json)
        .bind(compiled.as_ref().map(|c| c.sql.clone()))
        .bind(placeholders_json)
        .bind(compiled.as_ref().map(|c| c.tree_hash.clone()))
        .fetch_one(&mut *tx)
        .await
        .map_err(store_failure)?;

        let rule = row_to_rule(&row)?;
        tx.commit().await.map_err(store_failure)?;
        Ok(rule)
    }

    async fn retire_rule(&self, realm_id: Id, rule_id: Id) -> Result<(), PolicyError> {
        sqlx::query("UPDATE rules SET state = 'retired' WHERE realm_id = $1 AND id = $2")
            .bind(realm_id)
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .map_err(store_failure)?;
        Ok(())
    }
}
