//! The residual evaluator partially evaluates `principal`/
//! `context` subtrees against request-time bindings, simplifies AND/OR/NOT
//! by the usual boolean identities, and either short-circuits to a
//! [`Verdict`] or returns a reduced tree containing only `source=resource`
//! leaves.

use crate::dsl::{Condition, Source};
use crate::model::AttributeMap;
use crate::resolve;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    GrantedAll,
    DeniedAll,
}

#[derive(Debug, Clone)]
pub enum Residual {
    Verdict(Verdict),
    Tree(Condition),
}

/// Entry point. `bindings` holds the request's `principal` and `context`
/// attribute bags, keyed by those two names (see [`resolve::lookup`]).
pub fn residualize(tree: &Condition, bindings: &AttributeMap) -> Residual {
    let simplified = simplify(tree, bindings);
    if simplified.is_literal_true() {
        Residual::Verdict(Verdict::GrantedAll)
    } else if simplified.is_literal_false() {
        Residual::Verdict(Verdict::DeniedAll)
    } else {
        Residual::Tree(simplified)
    }
}

fn simplify(node: &Condition, bindings: &AttributeMap) -> Condition {
    match node {
        Condition::And { conditions } => {
            let mut kept = Vec::with_capacity(conditions.len());
            for child in conditions {
                let simplified = simplify(child, bindings);
                if simplified.is_literal_false() {
                    return Condition::FALSE;
                }
                if !simplified.is_literal_true() {
                    kept.push(simplified);
                }
            }
            fold_and(kept)
        }
        Condition::Or { conditions } => {
            let mut kept = Vec::with_capacity(conditions.len());
            for child in conditions {
                let simplified = simplify(child, bindings);
                if simplified.is_literal_true() {
                    return Condition::TRUE;
                }
                if !simplified.is_literal_false() {
                    kept.push(simplified);
                }
            }
            fold_or(kept)
        }
        Condition::Not { conditions } => {
            let child = simplify(&conditions[0], bindings);
            if child.is_literal_true() {
                Condition::FALSE
            } else if child.is_literal_false() {
                Condition::TRUE
            } else {
                Condition::Not {
                    conditions: vec![child],
                }
            }
        }
        leaf_node => simplify_leaf(leaf_node, bindings),
    }
}

fn fold_and(kept: Vec<Condition>) -> Condition {
    match kept.len() {
        0 => Condition::TRUE,
        1 => kept.into_iter().next().expect("length checked above"),
        _ => Condition::And { conditions: kept },
    }
}

fn fold_or(kept: Vec<Condition>) -> Condition {
    match kept.len() {
        0 => Condition::FALSE,
        1 => kept.into_iter().next().expect("length checked above"),
        _ => Condition::Or { conditions: kept },
    }
}

/// A leaf over `source=resource` is left untouched — it's the compiler's
/// job, not this evaluator's, and it belongs in the returned residual.
/// A leaf over `principal`/`context` is fully resolved here: a missing
/// attribute folds the leaf to `false` (deny-on-missing).
fn simplify_leaf(node: &Condition, bindings: &AttributeMap) -> Condition {
    let leaf = node.leaf().expect("simplify_leaf called on a non-leaf node");
    if leaf.source == Source::Resource {
        return node.clone();
    }

    let op = node.operator().expect("simplify_leaf called on a non-leaf node");
    let path: Vec<String> = leaf.attr.split('.').map(str::to_string).collect();
    let source_key = leaf.source.to_string();

    let actual = match resolve::lookup(bindings, &source_key, &path) {
        Some(v) => v,
        None => return Condition::FALSE,
    };

    let matched = match leaf.val.as_reference() {
        Some(Ok(reference)) => {
            let rhs_key = reference.source.to_string();
            match resolve::lookup(bindings, &rhs_key, &reference.path) {
                Some(rhs) => resolve::compare_json(op, actual, rhs),
                None => false,
            }
        }
        // A malformed reference can't reach here post-validation; treat as
        // a non-match rather than panicking on request-time data.
        Some(Err(_)) => false,
        None => resolve::compare_json(op, actual, &leaf.val.to_json()),
    };

    if matched {
        Condition::TRUE
    } else {
        Condition::FALSE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{Leaf, Operator, Value};
    use serde_json::json;

    fn leaf(op: Operator, source: Source, attr: &str, val: Value) -> Condition {
        Condition::leaf_node(
            op,
            Leaf {
                source,
                attr: attr.to_string(),
                val,
                args: None,
            },
        )
    }

    fn bindings_with_dept(dept: &str) -> AttributeMap {
        let mut b = AttributeMap::new();
        b.insert("principal".to_string(), json!({ "dept": dept }));
        b.insert("context".to_string(), json!({}));
        b
    }

    #[test]
    fn scenario_residual_simplification_sales_matches() {
        let cond = Condition::And {
            conditions: vec![
                leaf(Operator::Eq, Source::Principal, "dept", Value::Text("Sales".into())),
                leaf(Operator::Eq, Source::Resource, "status", Value::Text("active".into())),
            ],
        };
        let bindings = bindings_with_dept("Sales");
        match residualize(&cond, &bindings) {
            Residual::Tree(tree) => {
                assert!(tree.is_leaf());
                assert_eq!(tree.operator(), Some(Operator::Eq));
                assert_eq!(tree.leaf().unwrap().source, Source::Resource);
            }
            other => panic!("expected a residual tree, got {other:?}"),
        }
    }

    #[test]
    fn scenario_residual_simplification_hr_denies() {
        let cond = Condition::And {
            conditions: vec![
                leaf(Operator::Eq, Source::Principal, "dept", Value::Text("Sales".into())),
                leaf(Operator::Eq, Source::Resource, "status", Value::Text("active".into())),
            ],
        };
        let bindings = bindings_with_dept("HR");
        assert!(matches!(
            residualize(&cond, &bindings),
            Residual::Verdict(Verdict::DeniedAll)
        ));
    }

    #[test]
    fn deny_on_missing_attribute() {
        let cond = leaf(Operator::Eq, Source::Principal, "dept", Value::Text("Sales".into()));
        let bindings = AttributeMap::new();
        assert!(matches!(
            residualize(&cond, &bindings),
            Residual::Verdict(Verdict::DeniedAll)
        ));
    }

    #[test]
    fn or_with_one_true_branch_grants_all() {
        let cond = Condition::Or {
            conditions: vec![
                leaf(Operator::Eq, Source::Principal, "dept", Value::Text("Sales".into())),
                leaf(Operator::Eq, Source::Resource, "status", Value::Text("active".into())),
            ],
        };
        let bindings = bindings_with_dept("Sales");
        assert!(matches!(
            residualize(&cond, &bindings),
            Residual::Verdict(Verdict::GrantedAll)
        ));
    }

    #[test]
    fn not_not_in_composite_scenario() {
        // not( and[ {=, resource, deleted, true}, {not_in, resource, status, [...]} ] )
        let cond = Condition::Not {
            conditions: vec![Condition::And {
                conditions: vec![
                    leaf(Operator::Eq, Source::Resource, "deleted", Value::Bool(true)),
                    leaf(
                        Operator::NotIn,
                        Source::Resource,
                        "status",
                        Value::List(vec![Value::Text("published".into()), Value::Text("active".into())]),
                    ),
                ],
            }],
        };
        // Both leaves are resource-scoped, so residualize leaves the tree
        // shaped but unresolved; the compiler evaluates it against the row.
        let bindings = AttributeMap::new();
        match residualize(&cond, &bindings) {
            Residual::Tree(tree) => assert!(matches!(tree, Condition::Not { .. })),
            other => panic!("expected a residual tree, got {other:?}"),
        }
    }

    #[test]
    fn resolved_reference_val_compares_against_other_binding() {
        let cond = leaf(
            Operator::Eq,
            Source::Principal,
            "dept",
            Value::Text("$context.expected_dept".into()),
        );
        let mut bindings = AttributeMap::new();
        bindings.insert("principal".to_string(), json!({ "dept": "Sales" }));
        bindings.insert("context".to_string(), json!({ "expected_dept": "Sales" }));
        assert!(matches!(
            residualize(&cond, &bindings),
            Residual::Verdict(Verdict::GrantedAll)
        ));
    }
}
