//! Declared roles, as read from a role specification file.

use bastion_core::{AccessLevel, DatabaseName, RoleName};
use serde::{Deserialize, Serialize};

/// What a role is for. Decides which grants it may give and receive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoleKind {
    /// Pre-existing platform role, never created or modified.
    System,
    /// The administrative root every managed role hangs off.
    Admin,
    /// One privilege level on one database.
    Access {
        /// Database the role is scoped to
        database: DatabaseName,
        /// Privilege level on that database
        level: AccessLevel,
    },
    /// A job function composed of access roles, granted to people.
    Functional,
    /// An automated identity's role, composed of access roles.
    Service,
}

impl RoleKind {
    /// The kind without its payload.
    pub fn class(&self) -> RoleClass {
        match self {
            Self::System => RoleClass::System,
            Self::Admin => RoleClass::Admin,
            Self::Access { .. } => RoleClass::Access,
            Self::Functional => RoleClass::Functional,
            Self::Service => RoleClass::Service,
        }
    }
}

/// Payload-free [`RoleKind`], used to index the legality matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoleClass {
    /// See [`RoleKind::System`]
    System,
    /// See [`RoleKind::Admin`]
    Admin,
    /// See [`RoleKind::Access`]
    Access,
    /// See [`RoleKind::Functional`]
    Functional,
    /// See [`RoleKind::Service`]
    Service,
}

impl RoleClass {
    /// Every class, in matrix order.
    pub const ALL: [Self; 5] = [
        Self::System,
        Self::Admin,
        Self::Access,
        Self::Functional,
        Self::Service,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// One declared role.
///
/// `grants` names the roles conferred upon this role: an entry `G` yields
/// the edge `G -> self`.
///
/// ```yaml
/// - name: ANALYST
///   kind: functional
///   grants: [DB_RO]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    /// Role name, unique within a specification
    pub name: RoleName,
    /// Role kind and its payload
    #[serde(flatten)]
    pub kind: RoleKind,
    /// Roles granted to this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grants: Vec<RoleName>,
    /// Free-form description, applied as the role comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl RoleSpec {
    /// A role of `kind` with no grants.
    pub fn new(name: RoleName, kind: RoleKind) -> Self {
        Self {
            name,
            kind,
            grants: Vec::new(),
            comment: None,
        }
    }

    /// A system role.
    pub fn system(name: RoleName) -> Self {
        Self::new(name, RoleKind::System)
    }

    /// The admin role.
    pub fn admin(name: RoleName) -> Self {
        Self::new(name, RoleKind::Admin)
    }

    /// An access role on `database` at `level`.
    pub fn access(name: RoleName, database: DatabaseName, level: AccessLevel) -> Self {
        Self::new(name, RoleKind::Access { database, level })
    }

    /// A functional role.
    pub fn functional(name: RoleName) -> Self {
        Self::new(name, RoleKind::Functional)
    }

    /// A service role.
    pub fn service(name: RoleName) -> Self {
        Self::new(name, RoleKind::Service)
    }

    /// Add roles granted to this one.
    pub fn granted(mut self, roles: impl IntoIterator<Item = RoleName>) -> Self {
        self.grants.extend(roles);
        self
    }

    /// Set the comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Payload-free kind.
    pub fn class(&self) -> RoleClass {
        self.kind.class()
    }
}
