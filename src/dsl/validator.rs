//! Condition tree validation.
//!
//! Validation runs once, on the rule write path (`Draft -> Compiled`
//! transition in [`crate::model::RuleState`]); a failure here never
//! touches the read path — the prior `Active` fragment, if any, is left
//! in place and `PolicyError::InvalidPolicy` is returned to the caller.

use crate::dsl::ast::{Condition, Operator, Value};
use crate::error::PolicyError;

/// The one attribute name spatial operators are allowed against. There is
/// no resource schema visible at this layer, so geometry-typedness is
/// approximated by attribute name rather than looked up — resources carry
/// geometry in a single well-known field (`src/model.rs`'s `Resource::geometry`).
const GEOMETRY_ATTR: &str = "geometry";

pub fn validate(condition: &Condition) -> Result<(), PolicyError> {
    match condition {
        Condition::And { conditions } | Condition::Or { conditions } => {
            for child in conditions {
                validate(child)?;
            }
            Ok(())
        }
        Condition::Not { conditions } => {
            if conditions.len() != 1 {
                return Err(PolicyError::invalid_policy(format!(
                    "'not' must have exactly one child, got {}",
                    conditions.len()
                )));
            }
            validate(&conditions[0])
        }
        leaf_node => validate_leaf(leaf_node),
    }
}

fn validate_leaf(node: &Condition) -> Result<(), PolicyError> {
    let op = node
        .operator()
        .expect("validate_leaf called on a non-leaf node");
    let leaf = node.leaf().expect("validate_leaf called on a non-leaf node");

    validate_attr_path(&leaf.attr)?;

    if op.is_spatial() && leaf.attr != GEOMETRY_ATTR {
        return Err(PolicyError::invalid_policy(format!(
            "spatial operator '{}' requires attr == '{GEOMETRY_ATTR}', got '{}'",
            op.as_str(),
            leaf.attr
        )));
    }

    if matches!(op, Operator::All | Operator::In | Operator::NotIn) && !leaf.val.is_list() {
        return Err(PolicyError::invalid_policy(format!(
            "operator '{}' requires a list val",
            op.as_str()
        )));
    }

    validate_value(&leaf.val)?;

    if op == Operator::StDwithin && leaf.args.is_none() {
        return Err(PolicyError::invalid_policy(
            "'st_dwithin' requires numeric args (distance in meters)".to_string(),
        ));
    }

    Ok(())
}

/// `attr` segments are interpolated directly into the compiled SQL's
/// JSON-path chain, quoted with `'`, never bound as a placeholder — the
/// compiler trusts this validator to have ruled out anything that could
/// break out of that quoting.
fn validate_attr_path(attr: &str) -> Result<(), PolicyError> {
    if attr.is_empty() || attr.split('.').any(str::is_empty) {
        return Err(PolicyError::invalid_policy(format!(
            "attribute path '{attr}' has an empty segment"
        )));
    }
    if attr.contains('\'') {
        return Err(PolicyError::invalid_policy(format!(
            "attribute path '{attr}' contains a quote character"
        )));
    }
    Ok(())
}

/// Recursively validates a `val` literal: list elements are checked the
/// same way, and any `$source.path` reference embedded in a string is
/// parsed and checked for an empty path and a one-hop indirection (no
/// path segment may itself begin with `$`).
fn validate_value(val: &Value) -> Result<(), PolicyError> {
    match val {
        Value::List(items) => {
            for item in items {
                validate_value(item)?;
            }
            Ok(())
        }
        Value::Text(_) => {
            if let Some(parsed) = val.as_reference() {
                let reference = parsed.map_err(PolicyError::invalid_policy)?;
                if reference.path.iter().any(|seg| seg.starts_with('$')) {
                    return Err(PolicyError::invalid_policy(format!(
                        "reference '{}' chains through another reference, only one hop is allowed",
                        reference.dotted()
                    )));
                }
            }
            Ok(())
        }
        Value::Bool(_) | Value::Number(_) | Value::Object(_) => Ok(()),
    }
}
