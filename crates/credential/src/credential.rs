//! Stored credential versions and their stage labels.

use std::fmt;

use bastion_core::{Fingerprint, IdentityId, PublicKeyPem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::keygen::GeneratedKey;

/// Identifier of one stored credential version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(Uuid);

impl VersionId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stage label carried by a credential version.
///
/// Each label is held by at most one version of an identity at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Generated and not yet promoted
    Pending,
    /// The key the identity authenticates with
    Current,
    /// The key replaced by the last promotion, kept for audit
    Previous,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Current => write!(f, "CURRENT"),
            Self::Previous => write!(f, "PREVIOUS"),
        }
    }
}

/// Key material handed to the store for a new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretPayload {
    /// SPKI PEM
    pub public_key: PublicKeyPem,
    /// Encrypted PKCS#8 PEM
    pub encrypted_private_key: String,
    /// Fingerprint of `public_key`
    pub fingerprint: Fingerprint,
}

impl From<GeneratedKey> for SecretPayload {
    fn from(key: GeneratedKey) -> Self {
        Self {
            public_key: key.public_key,
            encrypted_private_key: key.encrypted_private_key,
            fingerprint: key.fingerprint,
        }
    }
}

/// One stored key pair of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Store version id
    pub key_id: VersionId,
    /// Owning identity
    pub identity: IdentityId,
    /// SPKI PEM
    pub public_key: PublicKeyPem,
    /// Encrypted PKCS#8 PEM
    pub encrypted_private_key: String,
    /// `SHA256:` fingerprint of the public key
    pub fingerprint: Fingerprint,
    /// When the version was stored
    pub created_at: DateTime<Utc>,
    /// Stage label, `None` once it has been taken away
    pub stage: Option<Stage>,
    /// When the key was retired from the platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// A new unlabeled version of `identity` holding `payload`.
    pub fn new(identity: IdentityId, payload: SecretPayload) -> Self {
        Self {
            key_id: VersionId::new(),
            identity,
            public_key: payload.public_key,
            encrypted_private_key: payload.encrypted_private_key,
            fingerprint: payload.fingerprint,
            created_at: Utc::now(),
            stage: None,
            expired_at: None,
        }
    }

    /// Whether the version carries `stage`.
    pub fn is(&self, stage: Stage) -> bool {
        self.stage == Some(stage)
    }
}
