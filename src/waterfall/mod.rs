//! The waterfall selector: three access levels checked in order,
//! short-circuiting on the first that grants.

use crate::model::{Id, ResourceType, Rule, RuleState, ANONYMOUS_PRINCIPAL_ID};
use std::collections::HashSet;

/// `{role_id | role ∈ active_roles} ∪ {principal_id} ∪ {0}`.
/// The anonymous id is always present so explicit anonymous grants are
/// evaluated for both authenticated and unauthenticated requests.
pub fn subject_set(
    principal_id: Id,
    principal_roles: &[Id],
    role_names_override: Option<&[Id]>,
) -> HashSet<Id> {
    let mut set: HashSet<Id> = match role_names_override {
        Some(allowed) => principal_roles
            .iter()
            .filter(|r| allowed.contains(r))
            .copied()
            .collect(),
        None => principal_roles.iter().copied().collect(),
    };
    set.insert(principal_id);
    set.insert(ANONYMOUS_PRINCIPAL_ID);
    set
}

#[derive(Debug)]
pub enum Selection<'a> {
    /// Level 1: the resource type is public. Granted with no rule fetch.
    PublicGrant,
    /// Levels 2/3: the active, subject-matching candidate rules, split by
    /// scope. Any match is disjoined (`OR`) — there is no explicit deny.
    Candidates {
        type_scoped: Vec<&'a Rule>,
        resource_scoped: Vec<&'a Rule>,
    },
}

/// Selects the applicable rules for a `(resource_type, subjects)` pair.
/// `candidate_rules` is whatever the store already scoped to this realm,
/// resource type, and action — this function only applies the public
/// short-circuit and the subject/state filter, it does not itself query a
/// store.
pub fn select<'a>(resource_type: &ResourceType, candidate_rules: &'a [Rule], subjects: &HashSet<Id>) -> Selection<'a> {
    if resource_type.is_public {
        return Selection::PublicGrant;
    }

    let mut type_scoped = Vec::new();
    let mut resource_scoped = Vec::new();
    for rule in candidate_rules {
        if rule.state != RuleState::Active {
            continue;
        }
        if !subjects.contains(&rule.subject_id()) {
            continue;
        }
        if rule.is_type_scoped() {
            type_scoped.push(rule);
        } else {
            resource_scoped.push(rule);
        }
    }

    Selection::Candidates {
        type_scoped,
        resource_scoped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Subject;

    fn rule(id: Id, subject: Subject, resource_id: Option<Id>, state: RuleState) -> Rule {
        Rule {
            id,
            realm_id: 1,
            resource_type_id: 1,
            action_id: 1,
            subject,
            resource_id,
            condition: None,
            compiled: None,
            state,
        }
    }

    #[test]
    fn anonymous_id_always_in_subject_set() {
        let set = subject_set(7, &[2, 3], None);
        assert!(set.contains(&ANONYMOUS_PRINCIPAL_ID));
        assert!(set.contains(&7));
        assert!(set.contains(&2));
    }

    #[test]
    fn role_names_override_intersects() {
        let set = subject_set(7, &[2, 3, 4], Some(&[3, 4, 9]));
        assert!(set.contains(&3));
        assert!(set.contains(&4));
        assert!(!set.contains(&2));
    }

    #[test]
    fn public_type_short_circuits() {
        let rt = ResourceType {
            id: 1,
            realm_id: 1,
            name: "public_docs".to_string(),
            is_public: true,
        };
        let rules = vec![];
        let subjects = subject_set(0, &[], None);
        assert!(matches!(select(&rt, &rules, &subjects), Selection::PublicGrant));
    }

    #[test]
    fn filters_by_subject_and_state() {
        let rt = ResourceType {
            id: 1,
            realm_id: 1,
            name: "secrets".to_string(),
            is_public: false,
        };
        let rules = vec![
            rule(1, Subject::Role(10), None, RuleState::Active),
            rule(2, Subject::Role(99), None, RuleState::Active),
            rule(3, Subject::Role(10), None, RuleState::Retired),
            rule(4, Subject::Role(10), Some(5), RuleState::Active),
        ];
        let mut subjects = HashSet::new();
        subjects.insert(10);
        subjects.insert(ANONYMOUS_PRINCIPAL_ID);
        match select(&rt, &rules, &subjects) {
            Selection::Candidates { type_scoped, resource_scoped } => {
                assert_eq!(type_scoped.len(), 1);
                assert_eq!(type_scoped[0].id, 1);
                assert_eq!(resource_scoped.len(), 1);
                assert_eq!(resource_scoped[0].id, 4);
            }
            Selection::PublicGrant => panic!("expected candidates"),
        }
    }

    #[test]
    fn anonymous_exception_scenario() {
        let rt = ResourceType {
            id: 2,
            realm_id: 1,
            name: "secrets".to_string(),
            is_public: false,
        };
        let rules = vec![rule(1, Subject::Principal(0), Some(2), RuleState::Active)];
        let subjects = subject_set(ANONYMOUS_PRINCIPAL_ID, &[], None);
        match select(&rt, &rules, &subjects) {
            Selection::Candidates { resource_scoped, .. } => assert_eq!(resource_scoped.len(), 1),
            Selection::PublicGrant => panic!("expected candidates"),
        }
    }
}
