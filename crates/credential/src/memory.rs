//! In-process credential store with fault injection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bastion_core::IdentityId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::credential::{Credential, SecretPayload, Stage, VersionId};
use crate::rotation::{Lease, RotationState};
use crate::store::{CredentialStore, StoreError, StoreResult};

/// Everything stored for one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Stored versions, oldest first
    #[serde(default)]
    pub versions: Vec<Credential>,
    /// Rotation record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RotationState>,
}

/// Serializable copy of a whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialStoreSnapshot {
    /// Records by identity
    #[serde(default)]
    pub identities: BTreeMap<IdentityId, IdentityRecord>,
}

/// Store operations that faults can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// `create_secret_version`
    CreateSecretVersion,
    /// `put_stage_label`
    PutStageLabel,
    /// `get_by_stage`
    GetByStage,
    /// `get_version`
    GetVersion,
    /// `discard_version`
    DiscardVersion,
    /// `mark_expired`
    MarkExpired,
    /// `list_versions`
    ListVersions,
    /// `load_state`
    LoadState,
    /// `save_state`
    SaveState,
    /// `acquire_lease`
    AcquireLease,
    /// `renew_lease`
    RenewLease,
    /// `release_lease`
    ReleaseLease,
}

/// [`CredentialStore`] held in memory.
///
/// Serves as the test double for the rotation controller and, through
/// [`snapshot`](Self::snapshot), as the core of file-backed local state.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    records: Mutex<BTreeMap<IdentityId, IdentityRecord>>,
    faults: Mutex<HashMap<StoreOp, VecDeque<StoreError>>>,
    calls: Mutex<Vec<StoreOp>>,
}

impl InMemoryCredentialStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded from a snapshot.
    pub fn from_snapshot(snapshot: CredentialStoreSnapshot) -> Self {
        Self {
            records: Mutex::new(snapshot.identities),
            ..Self::default()
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> CredentialStoreSnapshot {
        CredentialStoreSnapshot {
            identities: self.records.lock().clone(),
        }
    }

    /// Fail the next call to `op` with `error`. Repeated calls queue up.
    pub fn fail_next(&self, op: StoreOp, error: StoreError) {
        self.faults.lock().entry(op).or_default().push_back(error);
    }

    /// Operations received so far, in order.
    pub fn calls(&self) -> Vec<StoreOp> {
        self.calls.lock().clone()
    }

    /// Force the lease on `identity` to expire now, whoever holds it.
    pub fn expire_lease(&self, identity: &IdentityId) {
        if let Some(lease) = self
            .records
            .lock()
            .get_mut(identity)
            .and_then(|record| record.state.as_mut())
            .and_then(|state| state.lease.as_mut())
        {
            lease.expires_at = Utc::now();
        }
    }

    fn begin(&self, op: StoreOp) -> StoreResult<()> {
        self.calls.lock().push(op);
        let fault = self
            .faults
            .lock()
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        fault.map_or(Ok(()), Err)
    }
}

fn not_found(identity: &IdentityId, version: &VersionId) -> StoreError {
    StoreError::NotFound {
        identity: identity.clone(),
        version: *version,
    }
}

fn find_mut<'a>(
    record: Option<&'a mut IdentityRecord>,
    identity: &IdentityId,
    version: &VersionId,
) -> StoreResult<&'a mut Credential> {
    record
        .and_then(|record| record.versions.iter_mut().find(|c| c.key_id == *version))
        .ok_or_else(|| not_found(identity, version))
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn create_secret_version(
        &self,
        identity: &IdentityId,
        payload: SecretPayload,
    ) -> StoreResult<VersionId> {
        self.begin(StoreOp::CreateSecretVersion)?;
        let credential = Credential::new(identity.clone(), payload);
        let version = credential.key_id;
        self.records
            .lock()
            .entry(identity.clone())
            .or_default()
            .versions
            .push(credential);
        Ok(version)
    }

    async fn put_stage_label(
        &self,
        identity: &IdentityId,
        version: &VersionId,
        stage: Stage,
    ) -> StoreResult<()> {
        self.begin(StoreOp::PutStageLabel)?;
        let mut records = self.records.lock();
        let record = records
            .get_mut(identity)
            .ok_or_else(|| not_found(identity, version))?;
        let target = record
            .versions
            .iter()
            .find(|c| c.key_id == *version)
            .ok_or_else(|| not_found(identity, version))?;
        if target.is(stage) {
            return Ok(());
        }
        if target.is(Stage::Current) {
            return Err(StoreError::InvalidStage {
                identity: identity.clone(),
                reason: format!("version {version} is CURRENT; promote another version instead"),
            });
        }

        for credential in &mut record.versions {
            if credential.key_id == *version {
                credential.stage = Some(stage);
            } else if credential.is(stage) {
                // Promotion demotes the old CURRENT; any other label just moves.
                credential.stage = if stage == Stage::Current {
                    Some(Stage::Previous)
                } else {
                    None
                };
            } else if stage == Stage::Current && credential.is(Stage::Previous) {
                credential.stage = None;
            }
        }
        Ok(())
    }

    async fn get_by_stage(
        &self,
        identity: &IdentityId,
        stage: Stage,
    ) -> StoreResult<Option<Credential>> {
        self.begin(StoreOp::GetByStage)?;
        Ok(self.records.lock().get(identity).and_then(|record| {
            record.versions.iter().find(|c| c.is(stage)).cloned()
        }))
    }

    async fn get_version(
        &self,
        identity: &IdentityId,
        version: &VersionId,
    ) -> StoreResult<Credential> {
        self.begin(StoreOp::GetVersion)?;
        let mut records = self.records.lock();
        find_mut(records.get_mut(identity), identity, version).cloned()
    }

    async fn discard_version(
        &self,
        identity: &IdentityId,
        version: &VersionId,
    ) -> StoreResult<()> {
        self.begin(StoreOp::DiscardVersion)?;
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(identity) else {
            return Ok(());
        };
        if record
            .versions
            .iter()
            .any(|c| c.key_id == *version && c.is(Stage::Current))
        {
            return Err(StoreError::InvalidStage {
                identity: identity.clone(),
                reason: format!("version {version} is CURRENT and cannot be discarded"),
            });
        }
        record.versions.retain(|c| c.key_id != *version);
        Ok(())
    }

    async fn mark_expired(
        &self,
        identity: &IdentityId,
        version: &VersionId,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.begin(StoreOp::MarkExpired)?;
        let mut records = self.records.lock();
        let credential = find_mut(records.get_mut(identity), identity, version)?;
        credential.expired_at.get_or_insert(at);
        Ok(())
    }

    async fn list_versions(&self, identity: &IdentityId) -> StoreResult<Vec<Credential>> {
        self.begin(StoreOp::ListVersions)?;
        Ok(self
            .records
            .lock()
            .get(identity)
            .map(|record| record.versions.clone())
            .unwrap_or_default())
    }

    async fn load_state(&self, identity: &IdentityId) -> StoreResult<Option<RotationState>> {
        self.begin(StoreOp::LoadState)?;
        Ok(self
            .records
            .lock()
            .get(identity)
            .and_then(|record| record.state.clone()))
    }

    async fn save_state(&self, state: &RotationState, expected_revision: u64) -> StoreResult<u64> {
        self.begin(StoreOp::SaveState)?;
        let mut records = self.records.lock();
        let record = records.entry(state.identity.clone()).or_default();
        let actual = record.state.as_ref().map_or(0, |s| s.revision);
        if actual != expected_revision {
            return Err(StoreError::Conflict {
                identity: state.identity.clone(),
                expected: expected_revision,
                actual,
            });
        }

        let mut stored = state.clone();
        stored.revision = actual + 1;
        let revision = stored.revision;
        record.state = Some(stored);
        Ok(revision)
    }

    async fn acquire_lease(
        &self,
        identity: &IdentityId,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.begin(StoreOp::AcquireLease)?;
        let now = Utc::now();
        let mut records = self.records.lock();
        let state = records
            .entry(identity.clone())
            .or_default()
            .state
            .get_or_insert_with(|| RotationState::new(identity.clone()));

        if let Some(holder) = state.lease_holder(now)
            && holder != owner
        {
            return Ok(false);
        }
        if let Some(lease) = &state.lease
            && lease.is_expired(now)
            && !lease.is_held_by(owner)
        {
            tracing::info!(
                identity = %identity,
                previous = %lease.owner_id,
                owner,
                "Taking over expired lease"
            );
        }

        state.lease = Some(Lease::new(owner, now, ttl));
        state.revision += 1;
        Ok(true)
    }

    async fn renew_lease(
        &self,
        identity: &IdentityId,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.begin(StoreOp::RenewLease)?;
        let now = Utc::now();
        let mut records = self.records.lock();
        let Some(state) = records
            .get_mut(identity)
            .and_then(|record| record.state.as_mut())
        else {
            return Ok(false);
        };
        match &state.lease {
            Some(lease) if lease.is_held_by(owner) => {
                state.lease = Some(Lease::new(owner, now, ttl));
                state.revision += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, identity: &IdentityId, owner: &str) -> StoreResult<()> {
        self.begin(StoreOp::ReleaseLease)?;
        let mut records = self.records.lock();
        if let Some(state) = records
            .get_mut(identity)
            .and_then(|record| record.state.as_mut())
            && state.lease.as_ref().is_some_and(|lease| lease.is_held_by(owner))
        {
            state.lease = None;
            state.revision += 1;
        }
        Ok(())
    }
}
