//! Type-pair legality matrix for declared role grants.
//!
//! Rows are the grantor's class, columns the grantee's. Database privileges
//! are never declared; the builder derives them from access roles.

use crate::spec::{RoleClass, RoleKind, RoleSpec};

/// Builder switches that relax the matrix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegalityOptions {
    /// Allow the admin role to be granted to service roles. This hands an
    /// automation identity the administrative root and is off by default.
    pub allow_admin_escalation: bool,
}

/// A cell of the matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Allowed,
    AdminEscalation,
    SameDatabaseAscending,
    Forbidden(&'static str),
}

const SYSTEM_RECEIVES: &str = "system roles are managed by the platform and receive no grants";
const SYSTEM_GRANTS: &str = "system roles confer only what they already hold, on the admin role";
const ADMIN_RECEIVES: &str = "the admin role receives grants only from system roles";
const ADMIN_GRANTS: &str = "the admin role confers database privileges on access roles implicitly and is never declared on them";
const FUNCTIONAL_RECEIVES: &str = "functional roles receive only access roles and the admin role";
const SERVICE_RECEIVES: &str = "service roles receive only access roles";
const COMPOSITE_GRANTS: &str = "functional and service roles are leaves and are granted to no role";

use Rule::{AdminEscalation, Allowed, Forbidden, SameDatabaseAscending};

#[rustfmt::skip]
const MATRIX: [[Rule; 5]; 5] = [
    //              System                      Admin                      Access                         Functional                      Service
    /* System */    [Forbidden(SYSTEM_RECEIVES), Allowed,                   Forbidden(SYSTEM_GRANTS),      Forbidden(SYSTEM_GRANTS),       Forbidden(SYSTEM_GRANTS)],
    /* Admin */     [Forbidden(SYSTEM_RECEIVES), Forbidden(ADMIN_RECEIVES), Forbidden(ADMIN_GRANTS),       Allowed,                        AdminEscalation],
    /* Access */    [Forbidden(SYSTEM_RECEIVES), Forbidden(ADMIN_RECEIVES), SameDatabaseAscending,         Allowed,                        Allowed],
    /* Functional */[Forbidden(SYSTEM_RECEIVES), Forbidden(ADMIN_RECEIVES), Forbidden(COMPOSITE_GRANTS),   Forbidden(FUNCTIONAL_RECEIVES), Forbidden(SERVICE_RECEIVES)],
    /* Service */   [Forbidden(SYSTEM_RECEIVES), Forbidden(ADMIN_RECEIVES), Forbidden(COMPOSITE_GRANTS),   Forbidden(FUNCTIONAL_RECEIVES), Forbidden(SERVICE_RECEIVES)],
];

/// Check that `grantor` may be granted to `grantee`.
///
/// Returns the broken rule on failure.
pub fn check_role_grant(
    grantor: &RoleSpec,
    grantee: &RoleSpec,
    options: LegalityOptions,
) -> Result<(), &'static str> {
    match MATRIX[grantor.class().index()][grantee.class().index()] {
        Allowed => Ok(()),
        AdminEscalation if options.allow_admin_escalation => Ok(()),
        AdminEscalation => Err(
            "granting the admin role to a service role requires allow_admin_escalation",
        ),
        SameDatabaseAscending => match (&grantor.kind, &grantee.kind) {
            (
                RoleKind::Access {
                    database: from_db,
                    level: from_level,
                },
                RoleKind::Access {
                    database: to_db,
                    level: to_level,
                },
            ) => {
                if from_db != to_db {
                    Err("access roles are granted only to access roles on the same database")
                } else if from_level >= to_level {
                    Err("access roles are granted only to a strictly higher level (RO -> RW -> OWNER)")
                } else {
                    Ok(())
                }
            }
            _ => Err("access-to-access rule applied to non-access roles"),
        },
        Forbidden(rule) => Err(rule),
    }
}

/// Whether any grant from `grantor` to `grantee` could ever pass.
pub fn is_permitted_pair(grantor: RoleClass, grantee: RoleClass, options: LegalityOptions) -> bool {
    match MATRIX[grantor.index()][grantee.index()] {
        Allowed | SameDatabaseAscending => true,
        AdminEscalation => options.allow_admin_escalation,
        Forbidden(_) => false,
    }
}
