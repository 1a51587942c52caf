//! Property-based compiler tests (proptest).
//!
//! Generalizes the hand-written `determinism_same_tree_same_fragment` and
//! `injection_safety_literal_never_appears_outside_placeholder` unit tests
//! in `src/compiler/mod.rs` over arbitrary text literals.

use abac_policy_core::compiler::compile;
use abac_policy_core::dsl::{Condition, Leaf, Operator, Source, Value};
use proptest::prelude::*;

fn eq_leaf(literal: &str) -> Condition {
    Condition::leaf_node(
        Operator::Eq,
        Leaf {
            source: Source::Resource,
            attr: "status".to_string(),
            val: Value::Text(literal.to_string()),
            args: None,
        },
    )
}

proptest! {
    /// Any plain text literal compiles deterministically and is always
    /// bound as a placeholder rather than interpolated into the SQL text
    /// (compiler determinism and injection safety).
    #[test]
    fn compile_is_deterministic_and_binds_arbitrary_literals(literal in "[a-zA-Z][a-zA-Z0-9_ ]{0,20}") {
        let a = eq_leaf(&literal);
        let b = eq_leaf(&literal);
        let fa = compile(&a).unwrap();
        let fb = compile(&b).unwrap();
        prop_assert_eq!(&fa.sql, &fb.sql);
        prop_assert_eq!(&fa.tree_hash, &fb.tree_hash);
        prop_assert_eq!(fa.placeholders.len(), 1);
        prop_assert_eq!(&fa.placeholders[0].text_value, &literal);
        prop_assert!(!fa.sql.contains(literal.as_str()));
    }
}
