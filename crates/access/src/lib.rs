#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Bastion Access
//!
//! Declarative access control: role specifications in, platform grants out.
//!
//! ## Pipeline
//!
//! 1. [`compile`] validates a list of [`RoleSpec`] and produces a
//!    topologically ordered [`GrantPlan`]. It is pure and fails with a
//!    [`ValidationError`] before anything touches the platform.
//! 2. [`diff`] compares the plan with [`LiveState`] read from the platform,
//!    keeping the automation identity's own grants out of the revoke set.
//! 3. [`Reconciler::apply`] creates roles, then grants level by level, then
//!    revokes, on a bounded worker pool with per-operation retries.
//!
//! ```rust,ignore
//! let reconciler = Reconciler::new(platform, ReconcilerConfig::default());
//! let outcome = reconciler.reconcile(&specs, false).await?;
//! ```

pub mod apply;
pub mod builder;
pub mod error;
pub mod graph;
pub mod legality;
pub mod plan;
pub mod reconcile;
pub mod spec;

pub use apply::{ApplyFailure, ApplyReport, Operation, ReconcileOutcome, Reconciler, ReconcilerConfig};
pub use builder::compile;
pub use error::{ReconcileError, ValidationError};
pub use graph::RoleGraph;
pub use legality::{LegalityOptions, check_role_grant, is_permitted_pair};
pub use plan::GrantPlan;
pub use reconcile::{LiveState, LockoutGuard, ReconcileDiff, diff};
pub use spec::{RoleClass, RoleKind, RoleSpec};
