//! The SQL compiler lowers a validated [`Condition`] tree into
//! a parameterized SQL boolean expression over two free identifiers,
//! `resource` (a row alias exposing `attributes`/`geometry`) and `ctx` (a
//! bound document exposing `context`/`principal` sub-objects).
//!
//! Every literal from `val`/`args` is bound as a placeholder — `attr`
//! paths are structural DSL content authored by a policy admin, not
//! request-time data, so they are interpolated directly (after the
//! empty-segment check the validator already performs) rather than bound.

use crate::dsl::{Condition, Operator, Source, Value};
use crate::error::PolicyError;
use crate::model::{CompiledFragment, CANONICAL_SRID};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The cast a placeholder's bind site applies: numeric literal implies
/// `::numeric`; boolean implies `::boolean`; otherwise `::text`. `Jsonb` is
/// this compiler's own addition for the `all` operator's array-containment
/// lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastType {
    Numeric,
    Boolean,
    Text,
    Jsonb,
}

impl CastType {
    fn as_sql(self) -> &'static str {
        match self {
            CastType::Numeric => "numeric",
            CastType::Boolean => "boolean",
            CastType::Text => "text",
            CastType::Jsonb => "jsonb",
        }
    }
}

/// One ordered bind-site descriptor. `text_value` carries the literal in a
/// form the store driver can bind directly (numbers and booleans are also
/// stringified — the `cast` tells the driver/SQL which type to coerce to).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placeholder {
    pub text_value: String,
    pub cast: CastType,
}

struct Compiler {
    placeholders: Vec<Placeholder>,
}

impl Compiler {
    fn new() -> Self {
        Compiler {
            placeholders: Vec::new(),
        }
    }

    fn bind(&mut self, text_value: String, cast: CastType) -> String {
        self.placeholders.push(Placeholder { text_value, cast });
        format!("${}", self.placeholders.len())
    }
}

/// Validates and compiles `condition`, producing a SQL fragment plus its
/// ordered placeholders and a stable hash of the source tree. This is the
/// "compile once" step a rule goes through on its way from Draft to
/// Compiled.
pub fn compile(condition: &Condition) -> Result<CompiledFragment, PolicyError> {
    crate::dsl::validate(condition)?;
    let mut compiler = Compiler::new();
    let sql = lower(condition, &mut compiler)?;
    let tree_hash = hash_tree(condition)?;
    Ok(CompiledFragment {
        sql,
        placeholders: compiler.placeholders,
        tree_hash,
    })
}

/// Stable hash of the canonical serialization of `condition`. Struct-field
/// order in [`crate::dsl::ast`] is fixed by declaration, so two
/// structurally equal trees always serialize identically — this is what
/// makes the hash usable as a compiled-fragment cache key.
fn hash_tree(condition: &Condition) -> Result<String, PolicyError> {
    let canonical = serde_json::to_vec(condition)
        .map_err(|e| PolicyError::invalid_policy(format!("tree is not serializable: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

fn lower(node: &Condition, out: &mut Compiler) -> Result<String, PolicyError> {
    match node {
        Condition::And { conditions } => {
            if conditions.is_empty() {
                return Ok("TRUE".to_string());
            }
            let parts = conditions
                .iter()
                .map(|c| lower(c, out))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("({})", parts.join(" AND ")))
        }
        Condition::Or { conditions } => {
            if conditions.is_empty() {
                return Ok("FALSE".to_string());
            }
            let parts = conditions
                .iter()
                .map(|c| lower(c, out))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(format!("({})", parts.join(" OR ")))
        }
        Condition::Not { conditions } => {
            let child = conditions.first().ok_or_else(|| {
                PolicyError::invalid_policy("'not' must have exactly one child".to_string())
            })?;
            Ok(format!("NOT ({})", lower(child, out)?))
        }
        leaf_node => lower_leaf(leaf_node, out),
    }
}

fn lower_leaf(node: &Condition, out: &mut Compiler) -> Result<String, PolicyError> {
    let op = node.operator().expect("lower_leaf called on non-leaf node");
    let leaf = node.leaf().expect("lower_leaf called on non-leaf node");

    if op.is_spatial() {
        return lower_spatial(op, leaf, out);
    }

    let lhs = json_path(leaf.source, &leaf.attr, true);

    if let Some(parsed) = leaf.val.as_reference() {
        let reference = parsed.map_err(PolicyError::invalid_policy)?;
        let rhs = json_path(reference.source, &reference.dotted(), true);
        return lower_reference_comparison(op, &lhs, &rhs);
    }

    match op {
        Operator::Eq | Operator::Ne | Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le => {
            let cast = cast_for(&leaf.val)?;
            let ph = out.bind(literal_text(&leaf.val)?, cast);
            Ok(format!(
                "({lhs})::{} {} {ph}",
                cast.as_sql(),
                sql_operator(op)
            ))
        }
        Operator::In | Operator::NotIn => {
            let items = match &leaf.val {
                Value::List(items) => items,
                _ => {
                    return Err(PolicyError::invalid_policy(
                        "'in'/'not_in' requires a list val".to_string(),
                    ))
                }
            };
            let cast = items
                .first()
                .map(cast_for)
                .transpose()?
                .unwrap_or(CastType::Text);
            let mut phs = Vec::with_capacity(items.len());
            for item in items {
                phs.push(out.bind(literal_text(item)?, cast));
            }
            let kw = if op == Operator::In { "IN" } else { "NOT IN" };
            Ok(format!("({lhs})::{} {kw} ({})", cast.as_sql(), phs.join(", ")))
        }
        Operator::All => {
            let array_lhs = json_path(leaf.source, &leaf.attr, false);
            let items = match &leaf.val {
                Value::List(items) => items,
                _ => {
                    return Err(PolicyError::invalid_policy(
                        "'all' requires a list val".to_string(),
                    ))
                }
            };
            let json_array = value_list_to_json(items)?;
            let ph = out.bind(json_array.to_string(), CastType::Jsonb);
            Ok(format!("({array_lhs}) @> {ph}::jsonb"))
        }
        _ => unreachable!("spatial operators are handled above"),
    }
}

/// Two references compared against each other, or a reference compared
/// with the resource attribute, are both already JSON-path expressions —
/// compared as text, with no cast: a reference is always lowered to the
/// same JSON-path shape, never a placeholder.
fn lower_reference_comparison(op: Operator, lhs: &str, rhs: &str) -> Result<String, PolicyError> {
    match op {
        Operator::Eq | Operator::Ne | Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le => {
            Ok(format!("{lhs} {} {rhs}", sql_operator(op)))
        }
        _ => Err(PolicyError::invalid_policy(format!(
            "operator '{}' does not support a reference val",
            op.as_str()
        ))),
    }
}

fn lower_spatial(op: Operator, leaf: &crate::dsl::Leaf, out: &mut Compiler) -> Result<String, PolicyError> {
    let lhs = "resource.geometry".to_string();
    let rhs = match leaf.val.as_reference() {
        Some(parsed) => {
            let reference = parsed.map_err(PolicyError::invalid_policy)?;
            let ctx_path = json_path(reference.source, &reference.dotted(), true);
            format!("ST_SetSRID(ST_GeomFromText({ctx_path}), {CANONICAL_SRID})")
        }
        None => geometry_literal_expr(&leaf.val, out)?,
    };

    let fn_name = match op {
        Operator::StDwithin => "ST_DWithin",
        Operator::StContains => "ST_Contains",
        Operator::StWithin => "ST_Within",
        Operator::StIntersects => "ST_Intersects",
        Operator::StCovers => "ST_Covers",
        _ => unreachable!("lower_spatial called with a non-spatial operator"),
    };

    if op == Operator::StDwithin {
        let distance = leaf.args.ok_or_else(|| {
            PolicyError::invalid_policy("'st_dwithin' requires numeric args".to_string())
        })?;
        let ph = out.bind(distance.to_string(), CastType::Numeric);
        Ok(format!("{fn_name}({lhs}, {rhs}, {ph})"))
    } else {
        Ok(format!("{fn_name}({lhs}, {rhs})"))
    }
}

/// Auto-detects WKT, extended WKT (`SRID=n;...`), and GeoJSON literals
/// and wraps them in the matching geometry constructor, transformed to
/// the canonical stored projection.
fn geometry_literal_expr(val: &Value, out: &mut Compiler) -> Result<String, PolicyError> {
    match val {
        Value::Text(text) => {
            let (srid, wkt) = split_extended_wkt(text);
            let ph = out.bind(wkt.to_string(), CastType::Text);
            if srid == CANONICAL_SRID {
                Ok(format!("ST_GeomFromText({ph}, {srid})"))
            } else {
                Ok(format!(
                    "ST_Transform(ST_GeomFromText({ph}, {srid}), {CANONICAL_SRID})"
                ))
            }
        }
        Value::Object(geojson) => {
            let srid = geojson
                .get("srid")
                .and_then(serde_json::Value::as_i64)
                .map(|v| v as i32)
                .unwrap_or(CANONICAL_SRID);
            let ph = out.bind(
                serde_json::Value::Object(geojson.clone()).to_string(),
                CastType::Jsonb,
            );
            if srid == CANONICAL_SRID {
                Ok(format!("ST_SetSRID(ST_GeomFromGeoJSON({ph}), {srid})"))
            } else {
                Ok(format!(
                    "ST_Transform(ST_SetSRID(ST_GeomFromGeoJSON({ph}), {srid}), {CANONICAL_SRID})"
                ))
            }
        }
        _ => Err(PolicyError::invalid_policy(
            "spatial operator val must be a WKT string or a GeoJSON object".to_string(),
        )),
    }
}

/// Splits an optional `SRID=n;` prefix off a WKT literal. An integer
/// projection identifier may be supplied explicitly; otherwise it defaults
/// to the canonical one.
fn split_extended_wkt(text: &str) -> (i32, &str) {
    if let Some(rest) = text.strip_prefix("SRID=") {
        if let Some((srid_str, wkt)) = rest.split_once(';') {
            if let Ok(srid) = srid_str.parse::<i32>() {
                return (srid, wkt);
            }
        }
    }
    (CANONICAL_SRID, text)
}

fn json_path(source: Source, attr: &str, scalar: bool) -> String {
    // `resource.id` is the table's real primary key, not a JSONB attribute
    // -- resource-scoped rules compare against it directly so the fragment
    // can use the indexed column rather than an attributes lookup.
    if source == Source::Resource && attr == "id" {
        return "resource.id".to_string();
    }
    let base = match source {
        Source::Resource => "resource.attributes",
        Source::Principal => "ctx->'principal'",
        Source::Context => "ctx->'context'",
    };
    let segments: Vec<&str> = attr.split('.').collect();
    let mut expr = base.to_string();
    for (i, seg) in segments.iter().enumerate() {
        let arrow = if scalar && i == segments.len() - 1 {
            "->>"
        } else {
            "->"
        };
        expr.push_str(arrow);
        expr.push('\'');
        expr.push_str(seg);
        expr.push('\'');
    }
    expr
}

fn sql_operator(op: Operator) -> &'static str {
    match op {
        Operator::Eq => "=",
        Operator::Ne => "!=",
        Operator::Gt => ">",
        Operator::Ge => ">=",
        Operator::Lt => "<",
        Operator::Le => "<=",
        _ => unreachable!("sql_operator called with a non-comparison operator"),
    }
}

fn cast_for(val: &Value) -> Result<CastType, PolicyError> {
    match val {
        Value::Bool(_) => Ok(CastType::Boolean),
        Value::Number(_) => Ok(CastType::Numeric),
        Value::Text(_) => Ok(CastType::Text),
        Value::List(_) | Value::Object(_) => Err(PolicyError::invalid_policy(
            "comparison operators require a scalar val".to_string(),
        )),
    }
}

fn literal_text(val: &Value) -> Result<String, PolicyError> {
    match val {
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Text(s) => Ok(s.clone()),
        Value::List(_) | Value::Object(_) => Err(PolicyError::invalid_policy(
            "expected a scalar literal".to_string(),
        )),
    }
}

fn value_list_to_json(items: &[Value]) -> Result<serde_json::Value, PolicyError> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let json = match item {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .ok_or_else(|| PolicyError::invalid_policy("non-finite number in val".to_string()))?,
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::List(_) | Value::Object(_) => {
                return Err(PolicyError::invalid_policy(
                    "'all' list elements must be scalars".to_string(),
                ))
            }
        };
        out.push(json);
    }
    Ok(serde_json::Value::Array(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{Leaf, Reference as Ref};

    fn leaf(op: Operator, source: Source, attr: &str, val: Value, args: Option<f64>) -> Condition {
        Condition::leaf_node(
            op,
            Leaf {
                source,
                attr: attr.to_string(),
                val,
                args,
            },
        )
    }

    #[test]
    fn compiles_simple_eq() {
        let cond = leaf(Operator::Eq, Source::Resource, "status", Value::Text("active".into()), None);
        let fragment = compile(&cond).unwrap();
        assert!(fragment.sql.contains("resource.attributes->>'status'"));
        assert!(fragment.sql.contains("::text ="));
        assert_eq!(fragment.placeholders.len(), 1);
        assert_eq!(fragment.placeholders[0].text_value, "active");
    }

    #[test]
    fn compiles_nested_attr_path() {
        let cond = leaf(Operator::Eq, Source::Resource, "a.b.c", Value::Number(3.0), None);
        let fragment = compile(&cond).unwrap();
        assert!(fragment.sql.contains("resource.attributes->'a'->'b'->>'c'"));
    }

    #[test]
    fn compiles_principal_reference_without_placeholder() {
        let cond = leaf(
            Operator::Eq,
            Source::Resource,
            "dept",
            Value::Text("$principal.dept".into()),
            None,
        );
        let fragment = compile(&cond).unwrap();
        assert!(fragment.sql.contains("ctx->'principal'->>'dept'"));
        assert!(fragment.placeholders.is_empty());
    }

    #[test]
    fn empty_and_or_fold_to_literals() {
        assert_eq!(compile(&Condition::TRUE).unwrap().sql, "TRUE");
        assert_eq!(compile(&Condition::FALSE).unwrap().sql, "FALSE");
    }

    #[test]
    fn compiles_in_with_multiple_placeholders() {
        let cond = leaf(
            Operator::In,
            Source::Resource,
            "status",
            Value::List(vec![Value::Text("a".into()), Value::Text("b".into())]),
            None,
        );
        let fragment = compile(&cond).unwrap();
        assert!(fragment.sql.contains("IN ($1, $2)"));
        assert_eq!(fragment.placeholders.len(), 2);
    }

    #[test]
    fn compiles_st_dwithin_with_distance_placeholder() {
        let cond = leaf(
            Operator::StDwithin,
            Source::Resource,
            "geometry",
            Value::Text("POINT(23.7275 37.9838)".into()),
            Some(5000.0),
        );
        let fragment = compile(&cond).unwrap();
        assert!(fragment.sql.starts_with("ST_DWithin(resource.geometry,"));
        assert_eq!(fragment.placeholders.len(), 2);
    }

    #[test]
    fn determinism_same_tree_same_fragment() {
        let a = leaf(Operator::Eq, Source::Resource, "status", Value::Text("active".into()), None);
        let b = leaf(Operator::Eq, Source::Resource, "status", Value::Text("active".into()), None);
        let fa = compile(&a).unwrap();
        let fb = compile(&b).unwrap();
        assert_eq!(fa.sql, fb.sql);
        assert_eq!(fa.tree_hash, fb.tree_hash);
    }

    #[test]
    fn injection_safety_literal_never_appears_outside_placeholder() {
        let evil = "'; DROP TABLE resource; --";
        let cond = leaf(Operator::Eq, Source::Resource, "status", Value::Text(evil.into()), None);
        let fragment = compile(&cond).unwrap();
        assert!(!fragment.sql.contains("DROP TABLE"));
        assert_eq!(fragment.placeholders[0].text_value, evil);
    }

    #[test]
    fn and_with_multiple_children_joins_with_and() {
        let cond = Condition::And {
            conditions: vec![
                leaf(Operator::Eq, Source::Resource, "a", Value::Bool(true), None),
                leaf(Operator::Eq, Source::Resource, "b", Value::Bool(false), None),
            ],
        };
        let fragment = compile(&cond).unwrap();
        assert!(fragment.sql.contains(" AND "));
    }

    #[test]
    fn not_wraps_child_in_negation() {
        let cond = Condition::Not {
            conditions: vec![leaf(Operator::Eq, Source::Resource, "a", Value::Bool(true), None)],
        };
        let fragment = compile(&cond).unwrap();
        assert!(fragment.sql.starts_with("NOT ("));
    }

    #[test]
    fn invalid_tree_never_compiles() {
        let cond = Condition::Not {
            conditions: vec![
                leaf(Operator::Eq, Source::Resource, "a", Value::Bool(true), None),
                leaf(Operator::Eq, Source::Resource, "b", Value::Bool(true), None),
            ],
        };
        assert!(compile(&cond).is_err());
    }

    #[test]
    fn extended_wkt_srid_prefix_parses() {
        let (srid, wkt) = split_extended_wkt("SRID=3857;POINT(0 0)");
        assert_eq!(srid, 3857);
        assert_eq!(wkt, "POINT(0 0)");
    }

    #[test]
    fn reference_parse_sanity() {
        assert!(Ref::parse("$context.loc").is_some());
    }
}
