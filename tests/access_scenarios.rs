//! End-to-end access-check scenarios
//!
//! Exercises the full pipeline (cache → waterfall → residual evaluator →
//! store) through the crate's public surface, one scenario per case.

use abac_policy_core::config::RunnerConfig;
use abac_policy_core::dsl::{Condition, Leaf, Operator, Source, Value};
use abac_policy_core::model::{Geometry, Resource, Subject, ANONYMOUS_PRINCIPAL_ID, CANONICAL_SRID};
use abac_policy_core::runner::{
    AccessItem, Answer, AuthContext, AuthorizationRunner, CheckAccessRequest, FilterType, ReturnType,
};
use abac_policy_core::store::{InMemoryStore, NewRule, Store};
use std::sync::Arc;

fn leaf(op: Operator, source: Source, attr: &str, val: Value) -> Condition {
    Condition::leaf_node(op, Leaf { source, attr: attr.to_string(), val, args: None })
}

fn runner(store: Arc<InMemoryStore>) -> AuthorizationRunner<InMemoryStore> {
    AuthorizationRunner::new(store, RunnerConfig::default()).0
}

fn decision_item(resource_type_name: &str, action_name: &str) -> AccessItem {
    AccessItem {
        resource_type_name: resource_type_name.to_string(),
        action_name: action_name.to_string(),
        return_type: ReturnType::Decision,
        external_resource_ids: None,
    }
}

#[tokio::test]
async fn public_type_grants_without_any_rule() {
    let store = Arc::new(InMemoryStore::new());
    let realm_id = store.create_realm("acme");
    store.create_resource_type(realm_id, "press_releases", true);
    store.create_action(realm_id, "view");
    let runner = runner(store);

    let req = CheckAccessRequest {
        realm_name: "acme".to_string(),
        req_access: vec![decision_item("press_releases", "view")],
        role_names: None,
        auth_context: None,
    };
    let response = runner.check_access(&req).await.unwrap();
    assert!(matches!(response.results[0].answer, Answer::Decision(true)));
}

#[tokio::test]
async fn role_scoped_type_rule_grants_every_holder_of_the_role() {
    let store = Arc::new(InMemoryStore::new());
    let realm_id = store.create_realm("acme");
    let type_id = store.create_resource_type(realm_id, "invoices", false);
    let action_id = store.create_action(realm_id, "view");
    let role_id = store.create_role(realm_id, "finance");
    let alice = store.create_principal(realm_id, "alice", serde_json::json!({}));
    store.assign_role(realm_id, alice, role_id);
    store
        .compile_and_create_rule(NewRule {
            realm_id,
            resource_type_id: type_id,
            action_id,
            subject: Subject::Role(role_id),
            resource_id: None,
            condition: None,
        })
        .unwrap();

    let runner = runner(store);
    let req = CheckAccessRequest {
        realm_name: "acme".to_string(),
        req_access: vec![decision_item("invoices", "view")],
        role_names: None,
        auth_context: Some(AuthContext { principal_id: Some(alice), context: serde_json::json!({}) }),
    };
    let response = runner.check_access(&req).await.unwrap();
    assert!(matches!(response.results[0].answer, Answer::Decision(true)));
}

#[tokio::test]
async fn residual_simplification_deny_on_missing_principal_attribute() {
    let store = Arc::new(InMemoryStore::new());
    let realm_id = store.create_realm("acme");
    let type_id = store.create_resource_type(realm_id, "reports", false);
    let action_id = store.create_action(realm_id, "view");
    let role_id = store.create_role(realm_id, "staff");
    let bob = store.create_principal(realm_id, "bob", serde_json::json!({}));
    store.assign_role(realm_id, bob, role_id);
    store.create_resource(
        realm_id,
        Resource { id: 1, realm_id, resource_type_id: type_id, attributes: serde_json::json!({ "status": "active" }), geometry: None },
    );

    let condition = Condition::And {
        conditions: vec![
            leaf(Operator::Eq, Source::Principal, "dept", Value::Text("Sales".into())),
            leaf(Operator::Eq, Source::Resource, "status", Value::Text("active".into())),
        ],
    };
    store
        .compile_and_create_rule(NewRule {
            realm_id,
            resource_type_id: type_id,
            action_id,
            subject: Subject::Role(role_id),
            resource_id: None,
            condition: Some(condition),
        })
        .unwrap();

    let runner = runner(store);
    // bob's principal attributes are empty -- dept doesn't resolve, leaf
    // simplifies to FALSE, the whole AND collapses to DeniedAll.
    let conditions = runner
        .get_authorization_conditions(
            "acme",
            "reports",
            "view",
            Some(&AuthContext { principal_id: Some(bob), context: serde_json::json!({}) }),
            None,
        )
        .await
        .unwrap();
    assert_eq!(conditions.filter_type, FilterType::DeniedAll);
}

#[tokio::test]
async fn residual_simplification_grants_when_principal_attribute_matches() {
    let store = Arc::new(InMemoryStore::new());
    let realm_id = store.create_realm("acme");
    let type_id = store.create_resource_type(realm_id, "reports", false);
    let action_id = store.create_action(realm_id, "view");
    let role_id = store.create_role(realm_id, "staff");
    let carol = store.create_principal(realm_id, "carol", serde_json::json!({ "dept": "Sales" }));
    store.assign_role(realm_id, carol, role_id);

    let condition = Condition::And {
        conditions: vec![
            leaf(Operator::Eq, Source::Principal, "dept", Value::Text("Sales".into())),
            leaf(Operator::Eq, Source::Resource, "status", Value::Text("active".into())),
        ],
    };
    store
        .compile_and_create_rule(NewRule {
            realm_id,
            resource_type_id: type_id,
            action_id,
            subject: Subject::Role(role_id),
            resource_id: None,
            condition: Some(condition),
        })
        .unwrap();

    let runner = runner(store);
    let conditions = runner
        .get_authorization_conditions(
            "acme",
            "reports",
            "view",
            Some(&AuthContext { principal_id: Some(carol), context: serde_json::json!({}) }),
            None,
        )
        .await
        .unwrap();
    // Only the resource-side leaf survives residualization.
    match conditions.filter_type {
        FilterType::Conditions => {
            let dsl = conditions.conditions_dsl.unwrap();
            assert!(matches!(dsl, Condition::Eq(_)));
        }
        other => panic!("expected a residual Conditions filter, got {other:?}"),
    }
}

#[tokio::test]
async fn spatial_dwithin_grants_only_within_radius() {
    let store = Arc::new(InMemoryStore::new());
    let realm_id = store.create_realm("acme");
    let type_id = store.create_resource_type(realm_id, "assets", false);
    let action_id = store.create_action(realm_id, "view");
    let role_id = store.create_role(realm_id, "field_staff");
    let dana = store.create_principal(realm_id, "dana", serde_json::json!({}));
    store.assign_role(realm_id, dana, role_id);
    store.create_resource(
        realm_id,
        Resource {
            id: 1,
            realm_id,
            resource_type_id: type_id,
            attributes: serde_json::json!({}),
            geometry: Some(Geometry { wkb: b"POINT(23.7275 37.9838)".to_vec(), srid: CANONICAL_SRID }),
        },
    );

    let mut condition = leaf(Operator::StDwithin, Source::Resource, "geometry", Value::Text("$context.loc".into()));
    if let Condition::StDwithin(ref mut l) = condition {
        l.args = Some(5000.0);
    }
    store
        .compile_and_create_rule(NewRule {
            realm_id,
            resource_type_id: type_id,
            action_id,
            subject: Subject::Role(role_id),
            resource_id: None,
            condition: Some(condition),
        })
        .unwrap();

    let runner = runner(store);
    let nearby = CheckAccessRequest {
        realm_name: "acme".to_string(),
        req_access: vec![decision_item("assets", "view")],
        role_names: None,
        auth_context: Some(AuthContext { principal_id: Some(dana), context: serde_json::json!({ "loc": "POINT(23.7275 37.9838)" }) }),
    };
    assert!(matches!(runner.check_access(&nearby).await.unwrap().results[0].answer, Answer::Decision(true)));

    let far_away = CheckAccessRequest {
        realm_name: "acme".to_string(),
        req_access: vec![decision_item("assets", "view")],
        role_names: None,
        auth_context: Some(AuthContext { principal_id: Some(dana), context: serde_json::json!({ "loc": "POINT(0 0)" }) }),
    };
    assert!(matches!(runner.check_access(&far_away).await.unwrap().results[0].answer, Answer::Decision(false)));
}

#[tokio::test]
async fn anonymous_gets_a_resource_scoped_exception_despite_no_type_grant() {
    let store = Arc::new(InMemoryStore::new());
    let realm_id = store.create_realm("acme");
    let type_id = store.create_resource_type(realm_id, "secrets", false);
    let action_id = store.create_action(realm_id, "view");
    store.create_resource(
        realm_id,
        Resource { id: 1, realm_id, resource_type_id: type_id, attributes: serde_json::json!({}), geometry: None },
    );
    store.create_resource(
        realm_id,
        Resource { id: 2, realm_id, resource_type_id: type_id, attributes: serde_json::json!({}), geometry: None },
    );
    store.map_external_id(realm_id, type_id, "doc-1", 1);
    store.map_external_id(realm_id, type_id, "doc-2", 2);
    store
        .compile_and_create_rule(NewRule {
            realm_id,
            resource_type_id: type_id,
            action_id,
            subject: Subject::Principal(ANONYMOUS_PRINCIPAL_ID),
            resource_id: Some(2),
            condition: None,
        })
        .unwrap();

    let runner = runner(store);
    let req = CheckAccessRequest {
        realm_name: "acme".to_string(),
        req_access: vec![AccessItem {
            resource_type_name: "secrets".to_string(),
            action_name: "view".to_string(),
            return_type: ReturnType::IdList,
            external_resource_ids: Some(vec!["doc-1".to_string(), "doc-2".to_string()]),
        }],
        role_names: None,
        auth_context: None,
    };
    let response = runner.check_access(&req).await.unwrap();
    match &response.results[0].answer {
        Answer::IdList(ids) => assert_eq!(ids, &vec!["doc-2".to_string()]),
        other => panic!("expected an id list, got {other:?}"),
    }
}

#[tokio::test]
async fn not_and_not_in_composite_denies_the_excluded_region() {
    let store = Arc::new(InMemoryStore::new());
    let realm_id = store.create_realm("acme");
    let type_id = store.create_resource_type(realm_id, "tickets", false);
    let action_id = store.create_action(realm_id, "view");
    let role_id = store.create_role(realm_id, "support");
    let eve = store.create_principal(realm_id, "eve", serde_json::json!({ "region": "EU" }));
    store.assign_role(realm_id, eve, role_id);
    store.create_resource(
        realm_id,
        Resource { id: 1, realm_id, resource_type_id: type_id, attributes: serde_json::json!({ "priority": "low" }), geometry: None },
    );

    let excluded_regions = leaf(Operator::NotIn, Source::Principal, "region", Value::List(vec![Value::Text("EU".into()), Value::Text("UK".into())]));
    let not_low_priority = Condition::Not {
        conditions: vec![leaf(Operator::Eq, Source::Resource, "priority", Value::Text("low".into()))],
    };
    let condition = Condition::And { conditions: vec![excluded_regions, not_low_priority] };
    store
        .compile_and_create_rule(NewRule {
            realm_id,
            resource_type_id: type_id,
            action_id,
            subject: Subject::Role(role_id),
            resource_id: None,
            condition: Some(condition),
        })
        .unwrap();

    let runner = runner(store);
    let req = CheckAccessRequest {
        realm_name: "acme".to_string(),
        req_access: vec![decision_item("tickets", "view")],
        role_names: None,
        auth_context: Some(AuthContext { principal_id: Some(eve), context: serde_json::json!({}) }),
    };
    // eve is in the EU region, which `not_in` excludes -> residualizes to
    // DeniedAll before the resource-side `not` is even considered.
    let response = runner.check_access(&req).await.unwrap();
    assert!(matches!(response.results[0].answer, Answer::Decision(false)));
}
