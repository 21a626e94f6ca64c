//! Rotation-specific error types

use bastion_core::{IdentityId, PlatformError};
use bastion_resilience::RetryError;
use thiserror::Error;

use super::phase::{Phase, Step};
use crate::credential::{Stage, VersionId};
use crate::keygen::KeyGenError;
use crate::store::StoreError;

/// Errors that can occur during credential rotation
#[derive(Debug, Error)]
pub enum RotationError {
    /// Another controller holds an unexpired lease on the identity
    #[error("rotation of {identity} already in progress (lease held by {owner})")]
    AlreadyInProgress {
        /// Identity concerned
        identity: IdentityId,
        /// Current lease holder
        owner: String,
    },

    /// The lease was taken over while this controller was working
    #[error("lease on {identity} was lost to another controller")]
    LeaseLost {
        /// Identity concerned
        identity: IdentityId,
    },

    /// The rotation record changed between read and write
    #[error("rotation state of {identity} was modified concurrently")]
    StateConflict {
        /// Identity concerned
        identity: IdentityId,
    },

    /// The identity has no CURRENT key yet
    #[error("{identity} has no current key; bootstrap it first")]
    NotBootstrapped {
        /// Identity concerned
        identity: IdentityId,
    },

    /// Bootstrap requested for an identity that already has a key
    #[error("{identity} already has a current key")]
    AlreadyBootstrapped {
        /// Identity concerned
        identity: IdentityId,
    },

    /// The last rotation rolled back and nobody acknowledged it yet
    #[error("last rotation of {identity} rolled back; acknowledge it before rotating again")]
    RollbackUnacknowledged {
        /// Identity concerned
        identity: IdentityId,
    },

    /// A step was requested out of order
    #[error("cannot run {step} for {identity} in phase {phase}")]
    OutOfOrder {
        /// Identity concerned
        identity: IdentityId,
        /// Requested step
        step: Step,
        /// Recorded phase
        phase: Phase,
    },

    /// State transition is not allowed
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Phase left
        from: Phase,
        /// Phase requested
        to: Phase,
    },

    /// The record points at a version the store does not have
    #[error("{identity} has no {stage} credential (version {version:?})")]
    MissingCredential {
        /// Identity concerned
        identity: IdentityId,
        /// Stage the version should carry
        stage: Stage,
        /// Version recorded in the rotation state
        version: Option<VersionId>,
    },

    /// Cancellation observed at a phase boundary
    #[error("rotation of {identity} cancelled in phase {phase}")]
    Cancelled {
        /// Identity concerned
        identity: IdentityId,
        /// Phase the rotation stopped in
        phase: Phase,
    },

    /// Undoing a failed rotation failed; the identity may hold both keys
    #[error("rollback of {identity} failed: {reason}")]
    Rollback {
        /// Identity concerned
        identity: IdentityId,
        /// Underlying failure
        reason: String,
    },

    /// finishSecret failed past the point of no return
    #[error("finishing rotation of {identity} failed: {reason}")]
    Fatal {
        /// Identity concerned
        identity: IdentityId,
        /// Underlying failure
        reason: String,
    },

    /// Rotation policy is unusable
    #[error("Invalid rotation policy: {reason}")]
    InvalidPolicy {
        /// What is wrong
        reason: String,
    },

    /// Key generation or decryption failed
    #[error(transparent)]
    KeyGen(#[from] KeyGenError),

    /// Platform call failed after retries
    #[error("platform call failed: {0}")]
    Platform(#[from] RetryError<PlatformError>),

    /// Credential store call failed after retries
    #[error("credential store call failed: {0}")]
    Store(RetryError<StoreError>),
}

impl RotationError {
    /// Whether the error reports contention with another controller.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInProgress { .. } | Self::LeaseLost { .. } | Self::StateConflict { .. }
        )
    }
}

impl From<RetryError<StoreError>> for RotationError {
    fn from(error: RetryError<StoreError>) -> Self {
        match error.inner() {
            StoreError::Conflict { identity, .. } => Self::StateConflict {
                identity: identity.clone(),
            },
            _ => Self::Store(error),
        }
    }
}

/// Result type for rotation operations
pub type RotationResult<T> = Result<T, RotationError>;
