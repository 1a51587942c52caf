//! Reference resolution: dotted JSON-path navigation over `principal`/
//! `context` attribute bags, and the scalar comparison rules applied once
//! a path resolves to a value.
//!
//! `resource` references are never resolved here — they are lowered to a
//! column/JSON path by the compiler at compile time and never touch this
//! module.

use crate::dsl::{Operator, Value};
use crate::model::AttributeMap;
use serde_json::Value as JsonValue;

/// Walks `path` through `root`, extracting a nested object at each
/// intermediate segment and returning the final scalar/array/object.
/// Returns `None` as soon as any segment is missing or the value at an
/// intermediate segment isn't an object — this is the "deny-on-missing"
/// entry point: a missing attribute is indistinguishable from one that
/// fails its comparison.
pub fn navigate<'a>(root: &'a JsonValue, path: &[String]) -> Option<&'a JsonValue> {
    let mut current = root;
    for segment in path {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Looks up `source.path` (source already split off, e.g. `"principal"`)
/// within a realm's bound attribute map for that source.
pub fn lookup<'a>(bindings: &'a AttributeMap, source_key: &str, path: &[String]) -> Option<&'a JsonValue> {
    let root = bindings.get(source_key)?;
    navigate(root, path)
}

/// Applies `op` between a resolved JSON value (the attribute) and a DSL
/// `val` literal, after reference substitution. Returns `false`, never an
/// error, for combinations that can't meaningfully compare (e.g. a
/// spatial operator against a non-resource source) — residualization
/// only ever needs a boolean outcome, and an unresolvable comparison is
/// indistinguishable from a failed one, in the same deny-on-missing spirit.
pub fn compare(op: Operator, actual: &JsonValue, expected: &Value) -> bool {
    match op {
        Operator::Eq => json_eq(actual, expected),
        Operator::Ne => !json_eq(actual, expected),
        Operator::Gt => json_cmp(actual, expected).map(|o| o.is_gt()).unwrap_or(false),
        Operator::Ge => json_cmp(actual, expected).map(|o| o.is_ge()).unwrap_or(false),
        Operator::Lt => json_cmp(actual, expected).map(|o| o.is_lt()).unwrap_or(false),
        Operator::Le => json_cmp(actual, expected).map(|o| o.is_le()).unwrap_or(false),
        Operator::In => match expected {
            Value::List(items) => items.iter().any(|v| json_eq(actual, v)),
            _ => false,
        },
        Operator::NotIn => match expected {
            Value::List(items) => !items.iter().any(|v| json_eq(actual, v)),
            _ => false,
        },
        Operator::All => match (actual.as_array(), expected) {
            (Some(actual_items), Value::List(required)) => required
                .iter()
                .all(|req| actual_items.iter().any(|a| json_eq(a, req))),
            _ => false,
        },
        Operator::StDwithin
        | Operator::StContains
        | Operator::StWithin
        | Operator::StIntersects
        | Operator::StCovers => false,
    }
}

/// Same comparison rules as [`compare`], but for the case where both sides
/// were resolved from attribute bags — a leaf whose `val` is itself a
/// `$principal`/`$context` reference.
pub fn compare_json(op: Operator, actual: &JsonValue, expected: &JsonValue) -> bool {
    match op {
        Operator::Eq => json_value_eq(actual, expected),
        Operator::Ne => !json_value_eq(actual, expected),
        Operator::Gt => json_json_cmp(actual, expected).map(|o| o.is_gt()).unwrap_or(false),
        Operator::Ge => json_json_cmp(actual, expected).map(|o| o.is_ge()).unwrap_or(false),
        Operator::Lt => json_json_cmp(actual, expected).map(|o| o.is_lt()).unwrap_or(false),
        Operator::Le => json_json_cmp(actual, expected).map(|o| o.is_le()).unwrap_or(false),
        Operator::In => expected.as_array().map(|items| items.contains(actual)).unwrap_or(false),
        Operator::NotIn => expected
            .as_array()
            .map(|items| !items.contains(actual))
            .unwrap_or(false),
        Operator::All => match (actual.as_array(), expected.as_array()) {
            (Some(actual_items), Some(required)) => {
                required.iter().all(|req| actual_items.contains(req))
            }
            _ => false,
        },
        Operator::StDwithin
        | Operator::StContains
        | Operator::StWithin
        | Operator::StIntersects
        | Operator::StCovers => false,
    }
}

/// `serde_json::Value`'s derived equality distinguishes a number's integer
/// and float representations (`2` vs `2.0`), which would otherwise make a
/// `resource.id` comparison against a DSL numeric literal fail spuriously;
/// numbers compare by value instead, matching [`json_json_cmp`]'s ordering.
fn json_value_eq(actual: &JsonValue, expected: &JsonValue) -> bool {
    if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        return a == b;
    }
    actual == expected
}

fn json_json_cmp(actual: &JsonValue, expected: &JsonValue) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (actual.as_str(), expected.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

fn json_eq(actual: &JsonValue, expected: &Value) -> bool {
    match expected {
        Value::Bool(b) => actual.as_bool() == Some(*b),
        Value::Number(n) => actual.as_f64() == Some(*n),
        Value::Text(s) => actual.as_str() == Some(s.as_str()),
        Value::List(_) | Value::Object(_) => false,
    }
}

fn json_cmp(actual: &JsonValue, expected: &Value) -> Option<std::cmp::Ordering> {
    match expected {
        Value::Number(n) => actual.as_f64().and_then(|a| a.partial_cmp(n)),
        Value::Text(s) => actual.as_str().map(|a| a.cmp(s.as_str())),
        Value::Bool(_) | Value::List(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn navigate_walks_nested_objects() {
        let root = json!({ "dept": { "region": "emea" } });
        let path = vec!["dept".to_string(), "region".to_string()];
        assert_eq!(navigate(&root, &path), Some(&json!("emea")));
    }

    #[test]
    fn navigate_returns_none_on_missing_segment() {
        let root = json!({ "dept": "sales" });
        let path = vec!["dept".to_string(), "region".to_string()];
        assert_eq!(navigate(&root, &path), None);
    }

    #[test]
    fn compare_eq_text() {
        assert!(compare(Operator::Eq, &json!("Sales"), &Value::Text("Sales".into())));
        assert!(!compare(Operator::Eq, &json!("HR"), &Value::Text("Sales".into())));
    }

    #[test]
    fn compare_in_list() {
        let list = Value::List(vec![Value::Text("a".into()), Value::Text("b".into())]);
        assert!(compare(Operator::In, &json!("a"), &list));
        assert!(!compare(Operator::In, &json!("c"), &list));
    }

    #[test]
    fn compare_not_in_list() {
        let list = Value::List(vec![Value::Text("a".into())]);
        assert!(compare(Operator::NotIn, &json!("b"), &list));
        assert!(!compare(Operator::NotIn, &json!("a"), &list));
    }

    #[test]
    fn compare_numeric_order() {
        assert!(compare(Operator::Gt, &json!(5.0), &Value::Number(3.0)));
        assert!(!compare(Operator::Gt, &json!(2.0), &Value::Number(3.0)));
    }

    #[test]
    fn compare_all_requires_every_element() {
        let required = Value::List(vec![Value::Text("x".into()), Value::Text("y".into())]);
        assert!(compare(Operator::All, &json!(["x", "y", "z"]), &required));
        assert!(!compare(Operator::All, &json!(["x"]), &required));
    }

    #[test]
    fn compare_json_eq_normalizes_integer_and_float_numbers() {
        assert!(compare_json(Operator::Eq, &json!(2), &json!(2.0)));
        assert!(!compare_json(Operator::Eq, &json!(2), &json!(3.0)));
    }

    #[test]
    fn compare_json_eq_between_two_resolved_values() {
        assert!(compare_json(Operator::Eq, &json!("POINT(0 0)"), &json!("POINT(0 0)")));
        assert!(!compare_json(Operator::Eq, &json!("POINT(0 0)"), &json!("POINT(1 1)")));
    }

    #[test]
    fn lookup_resolves_through_source_map() {
        let mut bindings: AttributeMap = AttributeMap::new();
        bindings.insert("principal".to_string(), json!({ "dept": "Sales" }));
        let path = vec!["dept".to_string()];
        assert_eq!(lookup(&bindings, "principal", &path), Some(&json!("Sales")));
    }
}
