//! Access-control error types.

use bastion_core::{GrantEdge, PlatformError, RoleName};
use bastion_resilience::RetryError;
use thiserror::Error;

/// A role specification that must not reach the platform.
///
/// Raised by the builder before any mutation; the first failure wins, with
/// structural problems reported ahead of policy ones.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Two roles share a name.
    #[error("duplicate role: {role}")]
    DuplicateRole {
        /// The repeated name
        role: RoleName,
    },

    /// A role is malformed on its own.
    #[error("invalid role {role}: {reason}")]
    InvalidRole {
        /// The offending role
        role: RoleName,
        /// What is wrong with it
        reason: String,
    },

    /// A grant names a role that is not declared.
    #[error("role {referenced_by} is granted unknown role {role}")]
    UnknownRole {
        /// The undeclared name
        role: RoleName,
        /// Role whose `grants` mention it
        referenced_by: RoleName,
    },

    /// No role has kind `admin`.
    #[error("specification declares no admin role")]
    MissingAdmin,

    /// More than one role has kind `admin`.
    #[error("specification declares more than one admin role: {}", join(roles))]
    MultipleAdmins {
        /// Every admin role, in declaration order
        roles: Vec<RoleName>,
    },

    /// The grant graph is not acyclic.
    #[error("cycle detected in role graph: {}", join_path(cycle))]
    CycleDetected {
        /// Ordered path starting and ending at the same role
        cycle: Vec<RoleName>,
    },

    /// A grant breaks the type-pair legality matrix.
    #[error("illegal grant {edge}: {rule}")]
    IllegalGrantDirection {
        /// The violating edge
        edge: GrantEdge,
        /// The rule it breaks
        rule: &'static str,
    },

    /// A managed role hangs off nothing the admin role reaches.
    #[error("role {role} is not reachable from the admin role")]
    Unreachable {
        /// The orphaned role
        role: RoleName,
    },
}

fn join(roles: &[RoleName]) -> String {
    roles
        .iter()
        .map(RoleName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_path(roles: &[RoleName]) -> String {
    roles
        .iter()
        .map(RoleName::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A reconciliation run that could not start or finish.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The specification was rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Live state could not be read.
    #[error("failed to read live platform state: {0}")]
    LiveState(#[from] RetryError<PlatformError>),
}
