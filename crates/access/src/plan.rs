//! Compiled grant plan.

use std::collections::{BTreeSet, HashMap};

use bastion_core::{GrantEdge, RoleName};
use serde::Serialize;

/// What a role specification means on the platform, in dependency order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GrantPlan {
    /// Managed roles in topological order; system roles are left out
    /// because the platform already has them.
    pub roles: Vec<RoleName>,
    /// Grant edges ordered so each appears after both of its endpoints.
    pub edges: Vec<GrantEdge>,
    /// `roles` grouped into dependency levels; roles in one level can be
    /// created and granted to concurrently.
    pub levels: Vec<Vec<RoleName>>,
}

impl GrantPlan {
    /// The desired edge set.
    pub fn desired_edges(&self) -> BTreeSet<GrantEdge> {
        self.edges.iter().cloned().collect()
    }

    /// Level index of every managed role.
    pub fn level_map(&self) -> HashMap<&RoleName, usize> {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(level, roles)| roles.iter().map(move |role| (role, level)))
            .collect()
    }
}
