//! Check Access Demo
//!
//! Demonstrates the full pipeline end to end against an in-memory store:
//! a public resource type short-circuits at Level 1, a role-scoped rule
//! grants at Level 2, and a resource-scoped rule carves out an exception
//! for an otherwise-denied principal.

use abac_policy_core::config::RunnerConfig;
use abac_policy_core::dsl::{Condition, Leaf, Operator, Source, Value};
use abac_policy_core::model::Resource;
use abac_policy_core::runner::{AccessItem, AuthContext, AuthorizationRunner, CheckAccessRequest, ReturnType};
use abac_policy_core::store::{InMemoryStore, NewRule, Store};
use abac_policy_core::model::Subject;
use std::sync::Arc;

fn leaf(op: Operator, source: Source, attr: &str, val: Value) -> Condition {
    Condition::leaf_node(op, Leaf { source, attr: attr.to_string(), val, args: None })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    println!("=== Check Access Demo ===\n");

    let store = Arc::new(InMemoryStore::new());
    let realm_id = store.create_realm("acme");
    let press_releases = store.create_resource_type(realm_id, "press_releases", true);
    let contracts = store.create_resource_type(realm_id, "contracts", false);
    let view = store.create_action(realm_id, "view");
    let legal = store.create_role(realm_id, "legal");
    let alice = store.create_principal(realm_id, "alice", serde_json::json!({}));
    let bob = store.create_principal(realm_id, "bob", serde_json::json!({}));
    store.assign_role(realm_id, alice, legal);

    store.create_resource(
        realm_id,
        Resource { id: 1, realm_id, resource_type_id: contracts, attributes: serde_json::json!({ "status": "signed" }), geometry: None },
    );
    store.create_resource(
        realm_id,
        Resource { id: 2, realm_id, resource_type_id: contracts, attributes: serde_json::json!({ "status": "draft" }), geometry: None },
    );
    store.map_external_id(realm_id, contracts, "contract-1", 1);
    store.map_external_id(realm_id, contracts, "contract-2", 2);

    // Legal can view any signed contract.
    store
        .compile_and_create_rule(NewRule {
            realm_id,
            resource_type_id: contracts,
            action_id: view,
            subject: Subject::Role(legal),
            resource_id: None,
            condition: Some(leaf(Operator::Eq, Source::Resource, "status", Value::Text("signed".to_string()))),
        })
        .expect("rule compiles");

    // Bob, who holds no role at all, gets a narrow exception on contract 2.
    store
        .compile_and_create_rule(NewRule {
            realm_id,
            resource_type_id: contracts,
            action_id: view,
            subject: Subject::Principal(bob),
            resource_id: Some(2),
            condition: None,
        })
        .expect("rule compiles");

    let (runner, mut audit_receiver): (AuthorizationRunner<InMemoryStore>, _) =
        AuthorizationRunner::new(Arc::clone(&store), RunnerConfig::default());
    tokio::spawn(async move { while audit_receiver.recv().await.is_some() {} });

    println!("Example 1: public resource type short-circuits at Level 1");
    let request = CheckAccessRequest {
        realm_name: "acme".to_string(),
        req_access: vec![AccessItem {
            resource_type_name: "press_releases".to_string(),
            action_name: "view".to_string(),
            return_type: ReturnType::Decision,
            external_resource_ids: None,
        }],
        role_names: None,
        auth_context: None,
    };
    let response = runner.check_access(&request).await.expect("check_access succeeds");
    println!("  decision: {:?}", response.results[0].answer);
    let _ = press_releases;

    println!("\nExample 2: role-scoped rule grants alice access to signed contracts");
    let request = CheckAccessRequest {
        realm_name: "acme".to_string(),
        req_access: vec![AccessItem {
            resource_type_name: "contracts".to_string(),
            action_name: "view".to_string(),
            return_type: ReturnType::IdList,
            external_resource_ids: None,
        }],
        role_names: None,
        auth_context: Some(AuthContext { principal_id: Some(alice), context: serde_json::json!({}) }),
    };
    let response = runner.check_access(&request).await.expect("check_access succeeds");
    println!("  authorized external ids: {:?}", response.results[0].answer);

    println!("\nExample 3: bob has no role but gets an exception on contract-2");
    let request = CheckAccessRequest {
        realm_name: "acme".to_string(),
        req_access: vec![AccessItem {
            resource_type_name: "contracts".to_string(),
            action_name: "view".to_string(),
            return_type: ReturnType::IdList,
            external_resource_ids: Some(vec!["contract-1".to_string(), "contract-2".to_string()]),
        }],
        role_names: None,
        auth_context: Some(AuthContext { principal_id: Some(bob), context: serde_json::json!({}) }),
    };
    let response = runner.check_access(&request).await.expect("check_access succeeds");
    println!("  authorized external ids: {:?}", response.results[0].answer);

    println!("\nExample 4: residual DSL for contracts/view under alice's context");
    let conditions = runner
        .get_authorization_conditions(
            "acme",
            "contracts",
            "view",
            Some(&AuthContext { principal_id: Some(alice), context: serde_json::json!({}) }),
            None,
        )
        .await
        .expect("get_authorization_conditions succeeds");
    println!("  filter_type: {:?}", conditions.filter_type);
    println!("  conditions_dsl: {}", serde_json::to_string(&conditions.conditions_dsl).unwrap());

    println!("\n=== Demo Complete ===");
    Ok(())
}
