//! Role Graph Builder: validates role specifications and compiles them into
//! a [`GrantPlan`].
//!
//! Compilation is a pure function of its input. Nothing here talks to the
//! platform, so every rejection happens before the first mutation.

use std::collections::{BTreeSet, HashMap, HashSet};

use bastion_core::{GrantEdge, RoleName};

use crate::error::ValidationError;
use crate::graph::RoleGraph;
use crate::legality::{LegalityOptions, check_role_grant};
use crate::plan::GrantPlan;
use crate::spec::{RoleClass, RoleKind, RoleSpec};

/// Validate `specs` and compile them into a grant plan.
///
/// Checks run in a fixed order and the first failure is returned:
/// duplicate names, malformed roles, unknown references, the admin root,
/// cycles, the legality matrix, and finally reachability from the admin.
pub fn compile(specs: &[RoleSpec], options: LegalityOptions) -> Result<GrantPlan, ValidationError> {
    let by_name = index_specs(specs)?;
    check_grant_lists(specs, &by_name)?;
    let admin = find_admin(specs)?;

    let declared: Vec<GrantEdge> = specs
        .iter()
        .flat_map(|spec| {
            spec.grants
                .iter()
                .map(|grantor| GrantEdge::role(grantor.clone(), spec.name.clone()))
        })
        .collect();
    let implicit: Vec<GrantEdge> = specs
        .iter()
        .filter_map(|spec| match &spec.kind {
            RoleKind::Access { database, level } => Some(GrantEdge::database(
                admin.clone(),
                spec.name.clone(),
                database.clone(),
                *level,
            )),
            _ => None,
        })
        .collect();

    let mut graph = RoleGraph::new();
    for spec in specs {
        graph.add_role(spec.name.clone());
    }
    for edge in declared.iter().chain(&implicit) {
        graph.add_edge(edge.clone());
    }

    if let Some(cycle) = graph.find_cycle() {
        return Err(ValidationError::CycleDetected { cycle });
    }

    for edge in &declared {
        check_role_grant(by_name[&edge.grantor], by_name[&edge.grantee], options).map_err(
            |rule| ValidationError::IllegalGrantDirection {
                edge: edge.clone(),
                rule,
            },
        )?;
    }

    let reachable = graph.reachable_from(admin);
    if let Some(orphan) = specs
        .iter()
        .find(|spec| spec.class() != RoleClass::System && !reachable.contains(&spec.name))
    {
        return Err(ValidationError::Unreachable {
            role: orphan.name.clone(),
        });
    }

    let system: HashSet<&RoleName> = specs
        .iter()
        .filter(|spec| spec.class() == RoleClass::System)
        .map(|spec| &spec.name)
        .collect();
    let levels: Vec<Vec<RoleName>> = graph
        .compute_levels()?
        .into_iter()
        .map(|level| {
            level
                .into_iter()
                .filter(|role| !system.contains(role))
                .collect::<Vec<_>>()
        })
        .filter(|level| !level.is_empty())
        .collect();

    let mut plan = GrantPlan {
        roles: levels.concat(),
        edges: Vec::new(),
        levels,
    };

    let level_of = plan.level_map();
    let mut edges: Vec<GrantEdge> = declared
        .into_iter()
        .chain(implicit)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    edges.sort_by_key(|edge| level_of.get(&edge.grantee).copied().unwrap_or_default());
    plan.edges = edges;

    tracing::debug!(
        roles = plan.roles.len(),
        edges = plan.edges.len(),
        levels = plan.levels.len(),
        "Compiled role specification"
    );

    Ok(plan)
}

fn index_specs(specs: &[RoleSpec]) -> Result<HashMap<&RoleName, &RoleSpec>, ValidationError> {
    let mut by_name = HashMap::with_capacity(specs.len());
    for spec in specs {
        if by_name.insert(&spec.name, spec).is_some() {
            return Err(ValidationError::DuplicateRole {
                role: spec.name.clone(),
            });
        }
    }
    Ok(by_name)
}

fn check_grant_lists(
    specs: &[RoleSpec],
    by_name: &HashMap<&RoleName, &RoleSpec>,
) -> Result<(), ValidationError> {
    for spec in specs {
        let mut seen = HashSet::new();
        if let Some(repeated) = spec.grants.iter().find(|g| !seen.insert(*g)) {
            return Err(ValidationError::InvalidRole {
                role: spec.name.clone(),
                reason: format!("grants list names {repeated} more than once"),
            });
        }
    }
    for spec in specs {
        if let Some(unknown) = spec.grants.iter().find(|g| !by_name.contains_key(g)) {
            return Err(ValidationError::UnknownRole {
                role: unknown.clone(),
                referenced_by: spec.name.clone(),
            });
        }
    }
    Ok(())
}

fn find_admin(specs: &[RoleSpec]) -> Result<&RoleName, ValidationError> {
    let admins: Vec<&RoleName> = specs
        .iter()
        .filter(|spec| spec.class() == RoleClass::Admin)
        .map(|spec| &spec.name)
        .collect();
    match admins.as_slice() {
        [] => Err(ValidationError::MissingAdmin),
        [admin] => Ok(*admin),
        _ => Err(ValidationError::MultipleAdmins {
            roles: admins.into_iter().cloned().collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use bastion_core::{AccessLevel, DatabaseName};
    use pretty_assertions::assert_eq;

    use super::*;

    fn role(name: &str) -> RoleName {
        RoleName::new(name).unwrap()
    }

    fn access(name: &str, db: &str, level: AccessLevel) -> RoleSpec {
        RoleSpec::access(role(name), DatabaseName::new(db).unwrap(), level)
    }

    fn compile_default(specs: &[RoleSpec]) -> Result<GrantPlan, ValidationError> {
        compile(specs, LegalityOptions::default())
    }

    #[test]
    fn duplicate_wins_over_everything_else() {
        let specs = [
            RoleSpec::functional(role("A")).granted([role("NOPE")]),
            RoleSpec::functional(role("A")),
        ];
        assert_eq!(
            compile_default(&specs),
            Err(ValidationError::DuplicateRole { role: role("A") })
        );
    }

    #[test]
    fn repeated_grant_is_invalid() {
        let specs = [
            RoleSpec::admin(role("ADMIN")),
            access("DB_RO", "BRONZE", AccessLevel::Ro),
            RoleSpec::functional(role("ANALYST")).granted([role("DB_RO"), role("db_ro")]),
        ];
        assert!(matches!(
            compile_default(&specs),
            Err(ValidationError::InvalidRole { role: r, .. }) if r == role("ANALYST")
        ));
    }

    #[test]
    fn unknown_reference_is_reported_with_its_referrer() {
        let specs = [
            RoleSpec::admin(role("ADMIN")),
            RoleSpec::functional(role("ANALYST")).granted([role("DB_RO")]),
        ];
        assert_eq!(
            compile_default(&specs),
            Err(ValidationError::UnknownRole {
                role: role("DB_RO"),
                referenced_by: role("ANALYST"),
            })
        );
    }

    #[test]
    fn exactly_one_admin() {
        assert_eq!(
            compile_default(&[access("DB_RO", "BRONZE", AccessLevel::Ro)]),
            Err(ValidationError::MissingAdmin)
        );
        assert_eq!(
            compile_default(&[RoleSpec::admin(role("A1")), RoleSpec::admin(role("A2"))]),
            Err(ValidationError::MultipleAdmins {
                roles: vec![role("A1"), role("A2")]
            })
        );
    }

    #[test]
    fn self_grant_is_a_cycle() {
        let specs = [
            RoleSpec::admin(role("ADMIN")),
            access("DB_RO", "BRONZE", AccessLevel::Ro).granted([role("DB_RO")]),
        ];
        assert_eq!(
            compile_default(&specs),
            Err(ValidationError::CycleDetected {
                cycle: vec![role("DB_RO"), role("DB_RO")]
            })
        );
    }

    #[test]
    fn cycle_is_reported_before_illegal_direction() {
        let specs = [
            RoleSpec::admin(role("ADMIN")),
            RoleSpec::functional(role("A")).granted([role("B")]),
            RoleSpec::functional(role("B")).granted([role("A")]),
        ];
        assert_eq!(
            compile_default(&specs),
            Err(ValidationError::CycleDetected {
                cycle: vec![role("A"), role("B"), role("A")]
            })
        );
    }

    #[test]
    fn illegal_direction_names_the_edge() {
        let specs = [
            RoleSpec::admin(role("ADMIN")),
            access("DB_RO", "BRONZE", AccessLevel::Ro),
            RoleSpec::functional(role("ANALYST")).granted([role("DB_RO")]),
            RoleSpec::functional(role("LEAD")).granted([role("ANALYST")]),
        ];
        match compile_default(&specs) {
            Err(ValidationError::IllegalGrantDirection { edge, .. }) => {
                assert_eq!(edge, GrantEdge::role(role("ANALYST"), role("LEAD")));
            }
            other => panic!("expected IllegalGrantDirection, got {other:?}"),
        }
    }

    #[test]
    fn orphan_role_is_unreachable() {
        let specs = [
            RoleSpec::admin(role("ADMIN")),
            RoleSpec::functional(role("IDLE")),
        ];
        assert_eq!(
            compile_default(&specs),
            Err(ValidationError::Unreachable { role: role("IDLE") })
        );
    }

    #[test]
    fn system_roles_are_not_created_and_precede_admin() {
        let specs = [
            RoleSpec::system(role("SYSADMIN")),
            RoleSpec::admin(role("ADMIN")).granted([role("SYSADMIN")]),
            access("DB_RO", "BRONZE", AccessLevel::Ro),
        ];
        let plan = compile_default(&specs).unwrap();

        assert_eq!(plan.roles, vec![role("ADMIN"), role("DB_RO")]);
        assert_eq!(plan.edges[0], GrantEdge::role(role("SYSADMIN"), role("ADMIN")));
    }

    #[test]
    fn access_chain_orders_levels() {
        let specs = [
            RoleSpec::admin(role("ADMIN")),
            access("DB_OWNER", "BRONZE", AccessLevel::Owner).granted([role("DB_RW")]),
            access("DB_RW", "BRONZE", AccessLevel::Rw).granted([role("DB_RO")]),
            access("DB_RO", "BRONZE", AccessLevel::Ro),
        ];
        let plan = compile_default(&specs).unwrap();
        assert_eq!(
            plan.levels,
            vec![
                vec![role("ADMIN")],
                vec![role("DB_RO")],
                vec![role("DB_RW")],
                vec![role("DB_OWNER")],
            ]
        );
    }

    #[test]
    fn admin_may_be_granted_to_functional_roles() {
        let specs = [
            RoleSpec::admin(role("ADMIN")),
            RoleSpec::functional(role("OPERATOR")).granted([role("ADMIN")]),
        ];
        let plan = compile_default(&specs).unwrap();
        assert_eq!(
            plan.edges,
            vec![GrantEdge::role(role("ADMIN"), role("OPERATOR"))]
        );
    }

    #[test]
    fn escalation_is_opt_in() {
        let specs = [
            RoleSpec::admin(role("ADMIN")),
            RoleSpec::service(role("DEPLOYER")).granted([role("ADMIN")]),
        ];
        assert!(matches!(
            compile_default(&specs),
            Err(ValidationError::IllegalGrantDirection { .. })
        ));

        let plan = compile(
            &specs,
            LegalityOptions {
                allow_admin_escalation: true,
            },
        )
        .unwrap();
        assert_eq!(
            plan.edges,
            vec![GrantEdge::role(role("ADMIN"), role("DEPLOYER"))]
        );
    }
}
