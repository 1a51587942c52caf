//! # ABAC Policy Compilation & Evaluation Core
//!
//! Compiles an attribute-based access-control condition DSL into
//! parameterized SQL predicates and evaluates access-check requests through
//! a three-level waterfall: public resource types, type-scoped rules, and
//! resource-scoped rules.
//!
//! ## Pipeline
//!
//! ```text
//! Condition DSL (JSON tree)
//!     ↓
//! [Validator (dsl::validate)]       → structural/reference checks
//!     ↓
//! [Compiler (compiler::compile)]    → CompiledFragment (SQL + placeholders + tree hash)
//!     ↓
//! [Store write path (store::Store::upsert_rule)] → persisted Rule, Draft → Compiled → Active
//!
//! check_access(realm, req_access[], auth_context)
//!     ↓
//! [Name→ID cache (cache::NameIdCache)]   → realm/type/action/role ids
//!     ↓
//! [Waterfall selector (waterfall::select)] → PublicGrant | Candidates{type_scoped, resource_scoped}
//!     ↓
//! [Residual evaluator (residual::residualize)] → Verdict short-circuit | resource-only tree
//!     ↓
//! [Store read path (store::Store::{exists_match,matching_resource_ids})] → decision / id list
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use abac_policy_core::runner::{AuthorizationRunner, CheckAccessRequest, AccessItem, ReturnType};
//! use abac_policy_core::store::InMemoryStore;
//! use abac_policy_core::config::RunnerConfig;
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let (runner, _audit_receiver) = AuthorizationRunner::new(store, RunnerConfig::default());
//!
//! let request = CheckAccessRequest {
//!     realm_name: "acme".to_string(),
//!     req_access: vec![AccessItem {
//!         resource_type_name: "documents".to_string(),
//!         action_name: "view".to_string(),
//!         return_type: ReturnType::Decision,
//!         external_resource_ids: None,
//!     }],
//!     role_names: None,
//!     auth_context: None,
//! };
//! let response = runner.check_access(&request);
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `dsl` | condition AST, operators, references, structural validation |
//! | `compiler` | DSL → SQL fragment (injection-safe, deterministic tree hash) |
//! | `residual` | request-time partial evaluation of `principal`/`context` leaves |
//! | `waterfall` | public/type-scoped/resource-scoped rule selection |
//! | `cache` | per-realm, TTL-bounded, single-flight name→id lookup |
//! | `resolve` | reference-path navigation and cross-operator comparison |
//! | `store` | async port trait to the relational store, an in-memory test double, and a `sqlx`-backed Postgres/PostGIS impl |
//! | `runner` | `check_access` / `get_authorization_conditions` pipeline |
//! | `model` | data-model entities shared across the above |
//! | `execution` | request deadlines, pool admission control |
//! | `audit` | best-effort, drop-on-full decision audit queue |
//! | `config` | layered TOML + environment configuration |

pub mod audit;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod dsl;
pub mod error;
pub mod execution;
pub mod model;
pub mod residual;
pub mod resolve;
pub mod runner;
pub mod store;
pub mod waterfall;

pub use error::{PolicyError, Result};
pub use runner::{AuthorizationRunner, CheckAccessRequest, CheckAccessResponse};
