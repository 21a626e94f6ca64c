//! Grant edges: the unit the reconciler diffs and applies.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{DatabaseName, RoleName};

/// Privilege level of an access role on its database.
///
/// Ordered from weakest to strongest, which is also the only direction in
/// which one access role may be granted to another on the same database.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessLevel {
    /// Read only.
    Ro,
    /// Read and write.
    Rw,
    /// Full ownership of the database objects.
    Owner,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ro => "RO",
            Self::Rw => "RW",
            Self::Owner => "OWNER",
        })
    }
}

/// What a grant edge confers.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Privilege {
    /// The grantor role itself is granted to the grantee.
    Role,
    /// The grantee receives a database-scoped privilege from the grantor.
    Database {
        /// Target database
        database: DatabaseName,
        /// Level conferred
        level: AccessLevel,
    },
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Role => f.write_str("role"),
            Self::Database { database, level } => write!(f, "{level} on {database}"),
        }
    }
}

/// A directed grant `(grantor, grantee, privilege)`.
///
/// Two edges are the same grant exactly when all three components match.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct GrantEdge {
    /// Role whose privileges are conferred
    pub grantor: RoleName,
    /// Role receiving them
    pub grantee: RoleName,
    /// What is conferred
    pub privilege: Privilege,
}

impl GrantEdge {
    /// Grant of role `grantor` to role `grantee`.
    pub fn role(grantor: RoleName, grantee: RoleName) -> Self {
        Self {
            grantor,
            grantee,
            privilege: Privilege::Role,
        }
    }

    /// Database privilege conferred by `grantor` on `grantee`.
    pub fn database(
        grantor: RoleName,
        grantee: RoleName,
        database: DatabaseName,
        level: AccessLevel,
    ) -> Self {
        Self {
            grantor,
            grantee,
            privilege: Privilege::Database { database, level },
        }
    }
}

impl fmt::Display for GrantEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.grantor, self.grantee, self.privilege)
    }
}
