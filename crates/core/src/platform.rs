//! The data-platform seam.
//!
//! Everything Bastion mutates on the platform goes through [`PlatformClient`].
//! Implementations must make `create_role`, `grant`, and `revoke` idempotent:
//! creating what exists or revoking what is absent succeeds without effect.

use std::collections::BTreeSet;

use async_trait::async_trait;
use bastion_resilience::{Classify, TimedOut};

use crate::grant::GrantEdge;
use crate::id::{IdentityId, RoleName};
use crate::key::{KeyError, PrivateKey, PublicKeyPem};

/// Result type for platform calls
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Failure reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    /// Network or service failure.
    #[error("platform unavailable: {0}")]
    Unavailable(String),

    /// The platform throttled the call.
    #[error("rate limited by platform: {0}")]
    RateLimited(String),

    /// The call did not complete in time.
    #[error(transparent)]
    Timeout(#[from] TimedOut),

    /// Authentication or authorization was refused.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The call referenced a role that does not exist.
    #[error("role {0} does not exist")]
    UnknownRole(RoleName),

    /// The call referenced an identity that does not exist.
    #[error("identity {0} does not exist")]
    UnknownIdentity(IdentityId),

    /// The platform refused a well-formed request.
    #[error("rejected by platform: {0}")]
    Rejected(String),

    /// Local key handling failed before the call was made.
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl Classify for PlatformError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::RateLimited(_) | Self::Timeout(_)
        )
    }
}

/// Operations Bastion needs from the data platform.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Create `name` if it does not exist.
    async fn create_role(&self, name: &RoleName) -> PlatformResult<()>;

    /// Apply a grant edge. Both endpoints must exist.
    async fn grant(&self, edge: &GrantEdge) -> PlatformResult<()>;

    /// Remove a grant edge if present.
    async fn revoke(&self, edge: &GrantEdge) -> PlatformResult<()>;

    /// Every role that currently exists.
    async fn list_roles(&self) -> PlatformResult<BTreeSet<RoleName>>;

    /// Every grant edge that currently exists.
    async fn list_grants(&self) -> PlatformResult<BTreeSet<GrantEdge>>;

    /// Replace the set of public keys `identity` may authenticate with.
    async fn set_identity_keys(
        &self,
        identity: &IdentityId,
        keys: &BTreeSet<PublicKeyPem>,
    ) -> PlatformResult<()>;

    /// Public keys currently authorized for `identity`.
    async fn identity_keys(&self, identity: &IdentityId) -> PlatformResult<BTreeSet<PublicKeyPem>>;

    /// Try to open a session as `identity` using `key`.
    ///
    /// `Ok(false)` means the platform refused the key; `Err` means the
    /// attempt itself could not be made.
    async fn authenticate_with_key(
        &self,
        identity: &IdentityId,
        key: &PrivateKey,
    ) -> PlatformResult<bool>;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(PlatformError::Unavailable("503".into()), true)]
    #[case(PlatformError::RateLimited("429".into()), true)]
    #[case(PlatformError::Timeout(TimedOut { after: Duration::from_secs(1) }), true)]
    #[case(PlatformError::AccessDenied("role".into()), false)]
    #[case(PlatformError::UnknownRole(RoleName::new("X").unwrap()), false)]
    #[case(PlatformError::Rejected("too many keys".into()), false)]
    fn classifies_transient_failures(#[case] error: PlatformError, #[case] transient: bool) {
        assert_eq!(error.is_transient(), transient);
    }
}
