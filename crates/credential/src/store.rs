//! The credential store seam: versioned key storage, rotation state, leases.

use std::time::Duration;

use async_trait::async_trait;
use bastion_core::IdentityId;
use bastion_resilience::{Classify, TimedOut};
use chrono::{DateTime, Utc};

use crate::credential::{Credential, SecretPayload, Stage, VersionId};
use crate::rotation::RotationState;

/// Result type for credential store calls
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by a [`CredentialStore`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// The version does not exist for the identity
    #[error("credential version {version} of {identity} not found")]
    NotFound {
        /// Identity looked up
        identity: IdentityId,
        /// Version looked up
        version: VersionId,
    },

    /// A conditional write lost against a concurrent writer
    #[error("rotation state of {identity} changed concurrently: expected revision {expected}, found {actual}")]
    Conflict {
        /// Identity whose record moved
        identity: IdentityId,
        /// Revision the writer read
        expected: u64,
        /// Revision the store holds
        actual: u64,
    },

    /// The requested label change would break a stage invariant
    #[error("invalid stage change for {identity}: {reason}")]
    InvalidStage {
        /// Identity concerned
        identity: IdentityId,
        /// What was refused
        reason: String,
    },

    /// The backend is temporarily unreachable
    #[error("credential store temporarily unavailable: {0}")]
    Transient(String),

    /// The call did not finish in time
    #[error(transparent)]
    Timeout(#[from] TimedOut),

    /// Any other backend failure
    #[error("credential store error: {0}")]
    Backend(String),
}

impl Classify for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Durable storage for credential versions and rotation state.
///
/// Stage labels are unique per identity: putting a label on one version
/// removes it from whichever version held it. Promoting a version to
/// [`Stage::Current`] moves the old CURRENT to [`Stage::Previous`].
///
/// The rotation record and its lease share one revision counter; every
/// write to either bumps it, and [`save_state`](Self::save_state) only
/// succeeds against the revision the caller read.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Store a new, unlabeled version of the identity's key.
    async fn create_secret_version(
        &self,
        identity: &IdentityId,
        payload: SecretPayload,
    ) -> StoreResult<VersionId>;

    /// Attach `stage` to `version`.
    async fn put_stage_label(
        &self,
        identity: &IdentityId,
        version: &VersionId,
        stage: Stage,
    ) -> StoreResult<()>;

    /// The version holding `stage`, if any.
    async fn get_by_stage(
        &self,
        identity: &IdentityId,
        stage: Stage,
    ) -> StoreResult<Option<Credential>>;

    /// A specific version.
    async fn get_version(&self, identity: &IdentityId, version: &VersionId)
    -> StoreResult<Credential>;

    /// Delete a version. The CURRENT version cannot be discarded.
    async fn discard_version(&self, identity: &IdentityId, version: &VersionId)
    -> StoreResult<()>;

    /// Record when a version was retired.
    async fn mark_expired(
        &self,
        identity: &IdentityId,
        version: &VersionId,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Every stored version, oldest first.
    async fn list_versions(&self, identity: &IdentityId) -> StoreResult<Vec<Credential>>;

    /// The rotation record, if one was ever written.
    async fn load_state(&self, identity: &IdentityId) -> StoreResult<Option<RotationState>>;

    /// Write the rotation record if the stored revision is still
    /// `expected_revision` (0 when no record exists). Returns the new revision.
    async fn save_state(&self, state: &RotationState, expected_revision: u64) -> StoreResult<u64>;

    /// Take the identity's lease for `ttl`, creating its rotation record if
    /// needed. `false` when another owner holds an unexpired lease.
    async fn acquire_lease(
        &self,
        identity: &IdentityId,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Extend a lease `owner` still holds. `false` when someone else took it.
    async fn renew_lease(&self, identity: &IdentityId, owner: &str, ttl: Duration)
    -> StoreResult<bool>;

    /// Drop the lease if `owner` holds it.
    async fn release_lease(&self, identity: &IdentityId, owner: &str) -> StoreResult<()>;
}
