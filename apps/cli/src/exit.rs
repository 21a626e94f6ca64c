//! Process exit codes.

use bastion_access::{ReconcileError, ValidationError};
use bastion_core::IdentifierError;
use bastion_credential::RotationError;
use thiserror::Error;

use crate::loader::LoadError;

pub const SUCCESS: u8 = 0;
pub const VALIDATION: u8 = 1;
pub const PARTIAL_APPLY: u8 = 2;
pub const CONFLICT: u8 = 3;
pub const FAILURE: u8 = 4;

/// Command outcomes that are failures without an underlying library error.
#[derive(Debug, Error)]
pub enum CommandFailure {
    #[error("{failed} operation(s) failed and {skipped} were skipped; see the report above")]
    PartialApply { failed: usize, skipped: usize },

    #[error("rotation of {identity} rolled back: {reason}")]
    RolledBack { identity: String, reason: String },

    #[error("no key passphrase; set BASTION_KEY_PASSPHRASE or pass --passphrase")]
    MissingPassphrase,
}

impl CommandFailure {
    fn exit_code(&self) -> u8 {
        match self {
            Self::PartialApply { .. } => PARTIAL_APPLY,
            Self::RolledBack { .. } => FAILURE,
            Self::MissingPassphrase => VALIDATION,
        }
    }
}

/// Exit code for a failed command, decided by the first recognised error
/// in the chain.
pub fn exit_code(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        if cause.is::<ValidationError>() || cause.is::<LoadError>() || cause.is::<IdentifierError>()
        {
            return VALIDATION;
        }
        if let Some(error) = cause.downcast_ref::<ReconcileError>() {
            return match error {
                ReconcileError::Validation(_) => VALIDATION,
                ReconcileError::LiveState(_) => FAILURE,
            };
        }
        if let Some(error) = cause.downcast_ref::<RotationError>() {
            return if error.is_conflict() {
                CONFLICT
            } else if matches!(error, RotationError::InvalidPolicy { .. }) {
                VALIDATION
            } else {
                FAILURE
            };
        }
        if let Some(failure) = cause.downcast_ref::<CommandFailure>() {
            return failure.exit_code();
        }
    }
    FAILURE
}
