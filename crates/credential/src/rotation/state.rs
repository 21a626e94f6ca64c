//! The persisted rotation record of one identity.

use std::time::Duration;

use bastion_core::IdentityId;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::phase::Phase;
use crate::credential::VersionId;

/// Exclusive, expiring claim on an identity's rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Controller holding the lease
    pub owner_id: String,
    /// After this instant anyone may take the lease over
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Lease for `owner` lasting `ttl` from `now`.
    pub fn new(owner: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            owner_id: owner.into(),
            expires_at: expiry(now, ttl),
        }
    }

    /// Whether the lease has run out at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether `owner` holds the lease.
    pub fn is_held_by(&self, owner: &str) -> bool {
        self.owner_id == owner
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Rotation state of one identity, as persisted in the credential store.
///
/// Every controller step starts by reading this record; nothing about a
/// rotation lives only in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationState {
    /// Identity being rotated
    pub identity: IdentityId,
    /// Where the rotation stands
    pub phase: Phase,
    /// Version staged PENDING, while a rotation runs
    pub pending_key_id: Option<VersionId>,
    /// Version staged CURRENT
    pub active_key_id: Option<VersionId>,
    /// Who may drive the rotation right now
    pub lease: Option<Lease>,
    /// Failed test attempts in the current rotation
    #[serde(default)]
    pub test_failures: u32,
    /// Bumped by the store on every write
    #[serde(default)]
    pub revision: u64,
    /// Last write
    pub updated_at: DateTime<Utc>,
    /// Why the last rotation stopped short
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When a rotation last completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rotated_at: Option<DateTime<Utc>>,
}

impl RotationState {
    /// Record for an identity that has never been rotated.
    pub fn new(identity: IdentityId) -> Self {
        Self {
            identity,
            phase: Phase::Stable,
            pending_key_id: None,
            active_key_id: None,
            lease: None,
            test_failures: 0,
            revision: 0,
            updated_at: Utc::now(),
            last_error: None,
            last_rotated_at: None,
        }
    }

    /// Whether the identity has a CURRENT key.
    pub fn is_bootstrapped(&self) -> bool {
        self.active_key_id.is_some()
    }

    /// Whether a rotation has ever run to completion.
    pub fn has_rotated(&self) -> bool {
        self.last_rotated_at.is_some()
    }

    /// Current lease holder, if the lease has not expired at `now`.
    pub fn lease_holder(&self, now: DateTime<Utc>) -> Option<&str> {
        self.lease
            .as_ref()
            .filter(|lease| !lease.is_expired(now))
            .map(|lease| lease.owner_id.as_str())
    }
}
