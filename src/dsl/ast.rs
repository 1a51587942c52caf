//! The condition DSL: a tagged tree, one node per `op`.
//!
//! Every node is a variant of [`Condition`], tagged on the wire by its
//! `op` field — logical nodes (`and`/`or`/`not`) hold an ordered list of
//! children; leaf nodes hold `source`/`attr`/`val`/`args`. One variant per
//! distinct JSON-level tag keeps a `match` over `Condition` exhaustive, so
//! new operators can't be silently skipped by the compiler or the residual
//! evaluator.

use serde::{Deserialize, Serialize};

/// Where a leaf's `attr` is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Resource,
    Principal,
    Context,
}

impl Default for Source {
    fn default() -> Self {
        Source::Resource
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Source::Resource => "resource",
            Source::Principal => "principal",
            Source::Context => "context",
        };
        write!(f, "{s}")
    }
}

/// The comprehensive comparison, set, and spatial operator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    NotIn,
    All,
    StDwithin,
    StContains,
    StWithin,
    StIntersects,
    StCovers,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::All => "all",
            Operator::StDwithin => "st_dwithin",
            Operator::StContains => "st_contains",
            Operator::StWithin => "st_within",
            Operator::StIntersects => "st_intersects",
            Operator::StCovers => "st_covers",
        }
    }

    pub fn is_spatial(self) -> bool {
        matches!(
            self,
            Operator::StDwithin
                | Operator::StContains
                | Operator::StWithin
                | Operator::StIntersects
                | Operator::StCovers
        )
    }

    pub fn is_set(self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }

    /// Negating an operator, used by residual simplification's `not`
    /// folding when the child of `not` is itself a leaf comparison.
    pub fn negate(self) -> Option<Operator> {
        match self {
            Operator::Eq => Some(Operator::Ne),
            Operator::Ne => Some(Operator::Eq),
            Operator::Gt => Some(Operator::Le),
            Operator::Ge => Some(Operator::Lt),
            Operator::Lt => Some(Operator::Ge),
            Operator::Le => Some(Operator::Gt),
            Operator::In => Some(Operator::NotIn),
            Operator::NotIn => Some(Operator::In),
            // `all` and spatial operators have no direct negated form;
            // `not` wraps them instead of folding.
            _ => None,
        }
    }
}

/// A reference literal, `$<source>.<dotted.path>`.
/// `principal`/`context` references are bound at evaluation time; a
/// `resource` reference is lowered to a column/JSON path at compile time
/// and is never materialized as a placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub source: Source,
    pub path: Vec<String>,
}

impl Reference {
    /// Parse `$principal.dept.region` into `Reference{ Principal, ["dept","region"] }`.
    /// Returns `None` if the string isn't a reference at all (plain literal).
    pub fn parse(raw: &str) -> Option<Result<Reference, String>> {
        let rest = raw.strip_prefix('$')?;
        let mut parts = rest.splitn(2, '.');
        let source_str = parts.next().unwrap_or_default();
        let source = match source_str {
            "principal" => Source::Principal,
            "context" => Source::Context,
            "resource" => Source::Resource,
            other => {
                return Some(Err(format!(
                    "unknown reference source '{other}' in '{raw}'"
                )))
            }
        };
        let path_str = match parts.next() {
            Some(p) => p,
            None => return Some(Err(format!("reference '{raw}' has an empty path"))),
        };
        let path: Vec<String> = path_str.split('.').map(str::to_string).collect();
        if path.is_empty() || path.iter().any(String::is_empty) {
            return Some(Err(format!(
                "reference '{raw}' has an empty path segment"
            )));
        }
        Some(Ok(Reference { source, path }))
    }

    pub fn dotted(&self) -> String {
        self.path.join(".")
    }
}

/// A `val` literal: scalar, list, or a `$source.path` reference.
///
/// `Number` stores the parsed `f64` only; `1` and `1.0` are the same
/// `Value` and compile identically. Determinism of the compiled fragment
/// comes from [`crate::compiler`] serializing the tree with serde's fixed,
/// declaration-order field layout, not from retaining source text here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<Value>),
    /// A GeoJSON geometry literal. WKT and
    /// extended-WKT literals arrive as `Text` instead; this variant exists
    /// only because a bare JSON object can't otherwise be expressed.
    Object(serde_json::Map<String, serde_json::Value>),
}

impl Value {
    /// A `val` string of the form `$source.path` is a reference; anything
    /// else (including a plain string that happens to be WKT/GeoJSON) is
    /// a literal. Only `Value::Text` can ever be a reference.
    pub fn as_reference(&self) -> Option<Result<Reference, String>> {
        match self {
            Value::Text(s) => Reference::parse(s),
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Value::List(_))
    }

    pub fn is_geometry_literal(&self) -> bool {
        matches!(self, Value::Object(_)) || matches!(self, Value::Text(s) if looks_like_wkt(s))
    }

    /// Converts a literal `val` to the equivalent `serde_json::Value`, for
    /// comparing against a resolved `principal`/`context` attribute at
    /// residual-evaluation time.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(map.clone()),
        }
    }
}

fn looks_like_wkt(s: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "POINT", "LINESTRING", "POLYGON", "MULTIPOINT", "MULTILINESTRING",
        "MULTIPOLYGON", "GEOMETRYCOLLECTION", "SRID=",
    ];
    let upper = s.trim_start().to_ascii_uppercase();
    PREFIXES.iter().any(|p| upper.starts_with(p))
}

/// Fields shared by every leaf (comparison / set / array / spatial) node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaf {
    #[serde(default)]
    pub source: Source,
    pub attr: String,
    pub val: Value,
    #[serde(default)]
    pub args: Option<f64>,
}

/// A condition tree node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Condition {
    #[serde(rename = "and")]
    And {
        #[serde(default)]
        conditions: Vec<Condition>,
    },
    #[serde(rename = "or")]
    Or {
        #[serde(default)]
        conditions: Vec<Condition>,
    },
    #[serde(rename = "not")]
    Not {
        #[serde(default)]
        conditions: Vec<Condition>,
    },
    #[serde(rename = "=")]
    Eq(#[serde(flatten)] Leaf),
    #[serde(rename = "!=")]
    Ne(#[serde(flatten)] Leaf),
    #[serde(rename = ">")]
    Gt(#[serde(flatten)] Leaf),
    #[serde(rename = ">=")]
    Ge(#[serde(flatten)] Leaf),
    #[serde(rename = "<")]
    Lt(#[serde(flatten)] Leaf),
    #[serde(rename = "<=")]
    Le(#[serde(flatten)] Leaf),
    #[serde(rename = "in")]
    In(#[serde(flatten)] Leaf),
    #[serde(rename = "not_in")]
    NotIn(#[serde(flatten)] Leaf),
    #[serde(rename = "all")]
    All(#[serde(flatten)] Leaf),
    #[serde(rename = "st_dwithin")]
    StDwithin(#[serde(flatten)] Leaf),
    #[serde(rename = "st_contains")]
    StContains(#[serde(flatten)] Leaf),
    #[serde(rename = "st_within")]
    StWithin(#[serde(flatten)] Leaf),
    #[serde(rename = "st_intersects")]
    StIntersects(#[serde(flatten)] Leaf),
    #[serde(rename = "st_covers")]
    StCovers(#[serde(flatten)] Leaf),
}

impl Condition {
    pub const TRUE: Condition = Condition::And {
        conditions: Vec::new(),
    };
    pub const FALSE: Condition = Condition::Or {
        conditions: Vec::new(),
    };

    /// `true` iff this node is the canonical empty-`and` literal.
    pub fn is_literal_true(&self) -> bool {
        matches!(self, Condition::And { conditions } if conditions.is_empty())
    }

    /// `true` iff this node is the canonical empty-`or` literal.
    pub fn is_literal_false(&self) -> bool {
        matches!(self, Condition::Or { conditions } if conditions.is_empty())
    }

    pub fn operator(&self) -> Option<Operator> {
        match self {
            Condition::And { .. } | Condition::Or { .. } | Condition::Not { .. } => None,
            Condition::Eq(_) => Some(Operator::Eq),
            Condition::Ne(_) => Some(Operator::Ne),
            Condition::Gt(_) => Some(Operator::Gt),
            Condition::Ge(_) => Some(Operator::Ge),
            Condition::Lt(_) => Some(Operator::Lt),
            Condition::Le(_) => Some(Operator::Le),
            Condition::In(_) => Some(Operator::In),
            Condition::NotIn(_) => Some(Operator::NotIn),
            Condition::All(_) => Some(Operator::All),
            Condition::StDwithin(_) => Some(Operator::StDwithin),
            Condition::StContains(_) => Some(Operator::StContains),
            Condition::StWithin(_) => Some(Operator::StWithin),
            Condition::StIntersects(_) => Some(Operator::StIntersects),
            Condition::StCovers(_) => Some(Operator::StCovers),
        }
    }

    pub fn leaf(&self) -> Option<&Leaf> {
        match self {
            Condition::And { .. } | Condition::Or { .. } | Condition::Not { .. } => None,
            Condition::Eq(l)
            | Condition::Ne(l)
            | Condition::Gt(l)
            | Condition::Ge(l)
            | Condition::Lt(l)
            | Condition::Le(l)
            | Condition::In(l)
            | Condition::NotIn(l)
            | Condition::All(l)
            | Condition::StDwithin(l)
            | Condition::StContains(l)
            | Condition::StWithin(l)
            | Condition::StIntersects(l)
            | Condition::StCovers(l) => Some(l),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf().is_some()
    }

    /// Build a leaf node for `op` from its shared fields. Used by tests
    /// and by callers constructing trees programmatically rather than
    /// from parsed JSON.
    pub fn leaf_node(op: Operator, leaf: Leaf) -> Condition {
        match op {
            Operator::Eq => Condition::Eq(leaf),
            Operator::Ne => Condition::Ne(leaf),
            Operator::Gt => Condition::Gt(leaf),
            Operator::Ge => Condition::Ge(leaf),
            Operator::Lt => Condition::Lt(leaf),
            Operator::Le => Condition::Le(leaf),
            Operator::In => Condition::In(leaf),
            Operator::NotIn => Condition::NotIn(leaf),
            Operator::All => Condition::All(leaf),
            Operator::StDwithin => Condition::StDwithin(leaf),
            Operator::StContains => Condition::StContains(leaf),
            Operator::StWithin => Condition::StWithin(leaf),
            Operator::StIntersects => Condition::StIntersects(leaf),
            Operator::StCovers => Condition::StCovers(leaf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_leaf_from_json() {
        let json = serde_json::json!({
            "op": "=",
            "source": "resource",
            "attr": "status",
            "val": "active"
        });
        let cond: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(cond.operator(), Some(Operator::Eq));
        let leaf = cond.leaf().unwrap();
        assert_eq!(leaf.source, Source::Resource);
        assert_eq!(leaf.attr, "status");
        assert_eq!(leaf.val, Value::Text("active".to_string()));
    }

    #[test]
    fn leaf_source_defaults_to_resource() {
        let json = serde_json::json!({ "op": "=", "attr": "status", "val": "active" });
        let cond: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(cond.leaf().unwrap().source, Source::Resource);
    }

    #[test]
    fn parses_logical_nodes() {
        let json = serde_json::json!({
            "op": "and",
            "conditions": [
                { "op": "=", "attr": "a", "val": 1 },
                { "op": "!=", "attr": "b", "val": true }
            ]
        });
        let cond: Condition = serde_json::from_value(json).unwrap();
        match cond {
            Condition::And { conditions } => assert_eq!(conditions.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn empty_and_or_are_literals() {
        assert!(Condition::TRUE.is_literal_true());
        assert!(Condition::FALSE.is_literal_false());
    }

    #[test]
    fn reference_parse_rejects_empty_path() {
        assert!(matches!(Reference::parse("$principal."), Some(Err(_))));
        assert!(matches!(Reference::parse("$principal"), Some(Err(_))));
    }

    #[test]
    fn reference_parse_accepts_dotted_path() {
        let r = Reference::parse("$principal.dept.region").unwrap().unwrap();
        assert_eq!(r.source, Source::Principal);
        assert_eq!(r.path, vec!["dept".to_string(), "region".to_string()]);
    }

    #[test]
    fn non_reference_string_returns_none() {
        assert!(Reference::parse("active").is_none());
    }

    #[test]
    fn unknown_reference_source_errors() {
        assert!(matches!(Reference::parse("$widget.x"), Some(Err(_))));
    }
}
