//! Diffing a grant plan against live platform state.

use std::collections::{BTreeSet, VecDeque};

use bastion_core::{GrantEdge, RoleName};
use serde::{Deserialize, Serialize};

use crate::plan::GrantPlan;

/// Roles and grants as they exist on the platform right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveState {
    /// Existing roles
    pub roles: BTreeSet<RoleName>,
    /// Existing grant edges
    pub grants: BTreeSet<GrantEdge>,
}

/// Edges the reconciler must never revoke.
///
/// The automation identity applies every change through its own role; if a
/// specification drops one of the grants that role relies on, revoking it
/// would lock the reconciler out halfway through a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutGuard {
    /// Role the reconciling identity operates through
    pub automation_role: Option<RoleName>,
    /// Additional edges to keep regardless of the specification
    pub protected_edges: BTreeSet<GrantEdge>,
}

impl LockoutGuard {
    /// Guard the role `role`.
    pub fn for_role(role: RoleName) -> Self {
        Self {
            automation_role: Some(role),
            protected_edges: BTreeSet::new(),
        }
    }

    /// Live edges the automation role depends on.
    ///
    /// Walks grants backwards from the automation role: every edge whose
    /// grantee is the role, or is a role already found upstream of it,
    /// contributes to the privileges it holds.
    pub fn required_edges(&self, live: &BTreeSet<GrantEdge>) -> BTreeSet<GrantEdge> {
        let mut required: BTreeSet<GrantEdge> = self
            .protected_edges
            .iter()
            .filter(|edge| live.contains(*edge))
            .cloned()
            .collect();

        let Some(root) = &self.automation_role else {
            return required;
        };

        let mut seen = BTreeSet::from([root.clone()]);
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(role) = queue.pop_front() {
            for edge in live.iter().filter(|edge| edge.grantee == role) {
                required.insert(edge.clone());
                if seen.insert(edge.grantor.clone()) {
                    queue.push_back(edge.grantor.clone());
                }
            }
        }
        required
    }
}

/// Operations needed to move the platform to a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileDiff {
    /// Planned roles that do not exist yet, in plan order
    pub roles_to_create: Vec<RoleName>,
    /// Desired edges missing from the platform, in plan order
    pub to_create: Vec<GrantEdge>,
    /// Live edges that are not desired and not protected
    pub to_revoke: Vec<GrantEdge>,
    /// Edges left alone: desired and live, or protected
    pub unchanged: BTreeSet<GrantEdge>,
    /// Undesired live edges kept by the lockout guard
    pub protected: Vec<GrantEdge>,
}

impl ReconcileDiff {
    /// Whether applying the diff would change nothing.
    pub fn is_empty(&self) -> bool {
        self.operation_count() == 0
    }

    /// Number of platform mutations the diff implies.
    pub fn operation_count(&self) -> usize {
        self.roles_to_create.len() + self.to_create.len() + self.to_revoke.len()
    }
}

/// Compute `ToCreate = desired - live`, `ToRevoke = live - desired`, and
/// `Unchanged = desired & live`, keyed by the full grant triple.
///
/// Edges the guard protects are taken out of revocation candidacy first and
/// land in `unchanged`, with a warning each.
pub fn diff(plan: &GrantPlan, live: &LiveState, guard: &LockoutGuard) -> ReconcileDiff {
    let desired = plan.desired_edges();
    let required = guard.required_edges(&live.grants);

    let roles_to_create = plan
        .roles
        .iter()
        .filter(|role| !live.roles.contains(*role))
        .cloned()
        .collect();
    let to_create = plan
        .edges
        .iter()
        .filter(|edge| !live.grants.contains(*edge))
        .cloned()
        .collect();

    let mut unchanged: BTreeSet<GrantEdge> = desired.intersection(&live.grants).cloned().collect();
    let mut to_revoke = Vec::new();
    let mut protected = Vec::new();

    for edge in live.grants.difference(&desired) {
        if required.contains(edge) {
            tracing::warn!(
                edge = %edge,
                "Keeping grant required by the automation identity although the specification drops it"
            );
            unchanged.insert(edge.clone());
            protected.push(edge.clone());
        } else {
            to_revoke.push(edge.clone());
        }
    }

    ReconcileDiff {
        roles_to_create,
        to_create,
        to_revoke,
        unchanged,
        protected,
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

    fn grant(from: &str, to: &str) -> GrantEdge {
        GrantEdge::role(role(from), role(to))
    }

    fn plan(edges: Vec<GrantEdge>) -> GrantPlan {
        let roles: BTreeSet<RoleName> = edges
            .iter()
            .flat_map(|e| [e.grantor.clone(), e.grantee.clone()])
            .collect();
        GrantPlan {
            roles: roles.iter().cloned().collect(),
            levels: vec![roles.into_iter().collect()],
            edges,
        }
    }

    #[test]
    fn partitions_by_full_triple() {
        let db = DatabaseName::new("BRONZE").unwrap();
        let desired_ro = GrantEdge::database(role("ADMIN"), role("DB"), db.clone(), AccessLevel::Ro);
        let live_rw = GrantEdge::database(role("ADMIN"), role("DB"), db, AccessLevel::Rw);
        let kept = grant("DB", "ANALYST");

        let plan = plan(vec![desired_ro.clone(), kept.clone()]);
        let live = LiveState {
            roles: plan.roles.iter().cloned().collect(),
            grants: [live_rw.clone(), kept.clone()].into_iter().collect(),
        };

        let diff = diff(&plan, &live, &LockoutGuard::default());
        assert_eq!(diff.roles_to_create, Vec::<RoleName>::new());
        assert_eq!(diff.to_create, vec![desired_ro]);
        assert_eq!(diff.to_revoke, vec![live_rw]);
        assert_eq!(diff.unchanged, [kept].into_iter().collect());
        assert_eq!(diff.operation_count(), 2);
    }

    #[test]
    fn guard_walks_upstream_of_the_automation_role() {
        let live: BTreeSet<GrantEdge> = [
            grant("SYSADMIN", "ADMIN"),
            grant("ADMIN", "DEPLOYER"),
            grant("DB_RO", "ANALYST"),
        ]
        .into_iter()
        .collect();

        let required = LockoutGuard::for_role(role("DEPLOYER")).required_edges(&live);
        assert_eq!(
            required,
            [grant("SYSADMIN", "ADMIN"), grant("ADMIN", "DEPLOYER")]
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn protected_edges_are_never_revoked() {
        let escalation = grant("ADMIN", "DEPLOYER");
        let stale = grant("DB_RO", "OLD_TEAM");
        let explicit = grant("DB_RO", "BREAK_GLASS");
        let plan = plan(vec![grant("DB_RO", "ANALYST")]);
        let live = LiveState {
            roles: BTreeSet::new(),
            grants: [escalation.clone(), stale.clone(), explicit.clone()]
                .into_iter()
                .collect(),
        };
        let guard = LockoutGuard {
            automation_role: Some(role("DEPLOYER")),
            protected_edges: [explicit.clone()].into_iter().collect(),
        };

        let diff = diff(&plan, &live, &guard);

        assert_eq!(diff.to_revoke, vec![stale]);
        assert!(diff.unchanged.contains(&escalation));
        assert!(diff.unchanged.contains(&explicit));
        assert_eq!(diff.protected.len(), 2);
    }

    #[test]
    fn converged_state_is_empty() {
        let plan = plan(vec![grant("A", "B")]);
        let live = LiveState {
            roles: plan.roles.iter().cloned().collect(),
            grants: plan.desired_edges(),
        };
        assert!(diff(&plan, &live, &LockoutGuard::default()).is_empty());
    }
}
