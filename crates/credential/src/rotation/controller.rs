//! Rotation Controller
//!
//! Drives the createSecret / setSecret / testSecret / finishSecret protocol
//! for one identity at a time. Every step reads the persisted
//! [`RotationState`] first, performs one externally visible mutation, and
//! records the new phase with a conditional write, so a crash anywhere
//! resumes from the store rather than from memory.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bastion_core::{IdentityId, PlatformClient, PlatformError, PrivateKey};
use bastion_resilience::{retry_with_backoff, with_timeout};
use chrono::Utc;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::{RotationError, RotationResult};
use super::phase::{Phase, Step};
use super::policy::RotationPolicy;
use super::state::RotationState;
use crate::credential::{Credential, SecretPayload, Stage, VersionId};
use crate::keygen::{GeneratedKey, KeyGenError, KeyGenerator};
use crate::store::{CredentialStore, StoreError, StoreResult};

/// Rotates key pairs of platform identities.
///
/// Public operations take the identity's lease for their duration; a second
/// controller asking for the same identity gets
/// [`RotationError::AlreadyInProgress`] until the lease is released or
/// expires.
pub struct RotationController {
    store: Arc<dyn CredentialStore>,
    platform: Arc<dyn PlatformClient>,
    keygen: KeyGenerator,
    policy: RotationPolicy,
    owner_id: String,
}

impl RotationController {
    /// Controller generating keys per `policy`, encrypted under `passphrase`.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        platform: Arc<dyn PlatformClient>,
        policy: RotationPolicy,
        passphrase: SecretString,
    ) -> RotationResult<Self> {
        policy.validate()?;
        let keygen = KeyGenerator::new(policy.key_bits, passphrase)?
            .with_pbkdf2_iterations(policy.pbkdf2_iterations);
        Ok(Self {
            store,
            platform,
            keygen,
            policy,
            owner_id: format!("bastion-{}", Uuid::new_v4()),
        })
    }

    /// Use a fixed lease owner id instead of a random one.
    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    /// Lease owner id of this controller.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// The policy in use.
    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    /// The generator that produces and opens this controller's keys.
    pub fn key_generator(&self) -> &KeyGenerator {
        &self.keygen
    }

    // ── Public operations ──────────────────────────────────────────────────

    /// Persisted rotation record of `identity`, if any.
    pub async fn status(&self, identity: &IdentityId) -> RotationResult<Option<RotationState>> {
        self.store_call("load_state", || self.store.load_state(identity))
            .await
    }

    /// Whether the CURRENT key of `identity` is older than the policy interval.
    pub async fn is_due(&self, identity: &IdentityId) -> RotationResult<bool> {
        let current = self
            .store_call("get_by_stage", || {
                self.store.get_by_stage(identity, Stage::Current)
            })
            .await?
            .ok_or_else(|| RotationError::NotBootstrapped {
                identity: identity.clone(),
            })?;
        Ok(self.policy.is_due(current.created_at, Utc::now()))
    }

    /// Give a fresh identity its first key: generated, staged CURRENT, and
    /// registered as the identity's only authorized key.
    #[tracing::instrument(skip_all, fields(identity = %identity))]
    pub async fn bootstrap(&self, identity: &IdentityId) -> RotationResult<VersionId> {
        self.acquire(identity).await?;
        let result = self.bootstrap_locked(identity).await;
        self.release(identity).await;
        result
    }

    /// Run every remaining phase under one lease.
    ///
    /// Resumes from the persisted phase. Cancellation is honoured only
    /// between phases, never in the middle of one. Returns the final state,
    /// which is [`Phase::Stable`] after a successful rotation and
    /// [`Phase::RolledBack`] when the pending key never authenticated.
    #[tracing::instrument(skip_all, fields(identity = %identity))]
    pub async fn rotate(
        &self,
        identity: &IdentityId,
        cancel: &CancellationToken,
    ) -> RotationResult<RotationState> {
        self.acquire(identity).await?;
        let result = self.drive(identity, cancel).await;
        self.release(identity).await;

        match &result {
            Ok(state) if state.phase == Phase::RolledBack => tracing::error!(
                test_failures = state.test_failures,
                last_error = state.last_error.as_deref().unwrap_or_default(),
                "Rotation rolled back"
            ),
            Ok(state) => tracing::info!(
                active_key_id = ?state.active_key_id,
                "Rotation complete"
            ),
            Err(error) => tracing::error!(error = %error, "Rotation stopped"),
        }
        result
    }

    /// Run a single protocol step under the lease.
    ///
    /// Replaying a step that already happened is a no-op that returns the
    /// recorded phase.
    #[tracing::instrument(skip_all, fields(identity = %identity, step = %step))]
    pub async fn step(&self, identity: &IdentityId, step: Step) -> RotationResult<Phase> {
        self.acquire(identity).await?;
        let result = self.run_step(identity, step).await;
        self.release(identity).await;
        result
    }

    /// Clear a rollback so the identity can rotate again.
    #[tracing::instrument(skip_all, fields(identity = %identity))]
    pub async fn acknowledge_rollback(&self, identity: &IdentityId) -> RotationResult<Phase> {
        self.acquire(identity).await?;
        let result = self.acknowledge_locked(identity).await;
        self.release(identity).await;
        result
    }

    /// Delete every stored version that is neither CURRENT nor PENDING.
    /// Returns how many were deleted.
    #[tracing::instrument(skip_all, fields(identity = %identity))]
    pub async fn purge_previous(&self, identity: &IdentityId) -> RotationResult<usize> {
        self.acquire(identity).await?;
        let result = self.purge_locked(identity).await;
        self.release(identity).await;
        result
    }

    // ── Lease ──────────────────────────────────────────────────────────────

    async fn acquire(&self, identity: &IdentityId) -> RotationResult<()> {
        let ttl = self.policy.lease_ttl;
        let owner = self.owner_id.as_str();
        let acquired = self
            .store_call("acquire_lease", || {
                self.store.acquire_lease(identity, owner, ttl)
            })
            .await?;
        if acquired {
            tracing::debug!(identity = %identity, owner, "Lease acquired");
            return Ok(());
        }

        let holder = self
            .store_call("load_state", || self.store.load_state(identity))
            .await?
            .and_then(|state| state.lease.map(|lease| lease.owner_id))
            .unwrap_or_else(|| "unknown".to_owned());
        tracing::warn!(identity = %identity, holder = %holder, "Rotation already in progress");
        Err(RotationError::AlreadyInProgress {
            identity: identity.clone(),
            owner: holder,
        })
    }

    async fn renew(&self, identity: &IdentityId) -> RotationResult<()> {
        let ttl = self.policy.lease_ttl;
        let owner = self.owner_id.as_str();
        let renewed = self
            .store_call("renew_lease", || self.store.renew_lease(identity, owner, ttl))
            .await?;
        if renewed {
            Ok(())
        } else {
            tracing::error!(identity = %identity, owner, "Lease lost");
            Err(RotationError::LeaseLost {
                identity: identity.clone(),
            })
        }
    }

    async fn release(&self, identity: &IdentityId) {
        let owner = self.owner_id.as_str();
        if let Err(error) = self
            .store_call("release_lease", || self.store.release_lease(identity, owner))
            .await
        {
            // The lease expires on its own; the next owner takes it over.
            tracing::warn!(identity = %identity, error = %error, "Could not release lease");
        }
    }

    // ── Drivers ────────────────────────────────────────────────────────────

    async fn drive(
        &self,
        identity: &IdentityId,
        cancel: &CancellationToken,
    ) -> RotationResult<RotationState> {
        let mut started = false;

        loop {
            let state = self.load(identity).await?;
            let step = match state.phase {
                Phase::Stable | Phase::RolledBack if started => return Ok(state),
                Phase::RolledBack => {
                    return Err(RotationError::RollbackUnacknowledged {
                        identity: identity.clone(),
                    });
                }
                Phase::Stable if !state.is_bootstrapped() => {
                    return Err(RotationError::NotBootstrapped {
                        identity: identity.clone(),
                    });
                }
                Phase::Stable => Step::Create,
                Phase::PendingCreate => Step::Set,
                Phase::PendingSet | Phase::PendingTest => Step::Test,
                Phase::PendingFinish => Step::Finish,
            };

            if step == Step::Test && state.test_failures > 0 {
                let backoff = self.policy.retry.backoff_duration(state.test_failures - 1);
                tracing::debug!(
                    identity = %identity,
                    backoff_ms = backoff.as_millis() as u64,
                    "Waiting before the next test attempt"
                );
                if cancel
                    .run_until_cancelled(tokio::time::sleep(backoff))
                    .await
                    .is_none()
                {
                    return Err(cancelled(identity, state.phase));
                }
            }

            if cancel.is_cancelled() {
                return Err(cancelled(identity, state.phase));
            }

            self.renew(identity).await?;
            self.run_step(identity, step).await?;
            started = true;
        }
    }

    async fn run_step(&self, identity: &IdentityId, step: Step) -> RotationResult<Phase> {
        match step {
            Step::Create => self.create_secret(identity).await,
            Step::Set => self.set_secret(identity).await,
            Step::Test => self.test_secret(identity).await,
            Step::Finish => self.finish_secret(identity).await,
        }
    }

    // ── Phases ─────────────────────────────────────────────────────────────

    async fn create_secret(&self, identity: &IdentityId) -> RotationResult<Phase> {
        let mut state = self.load(identity).await?;
        match state.phase {
            Phase::Stable => {}
            Phase::RolledBack => {
                return Err(RotationError::RollbackUnacknowledged {
                    identity: identity.clone(),
                });
            }
            phase => {
                tracing::debug!(identity = %identity, phase = %phase, "createSecret already done");
                return Ok(phase);
            }
        }
        if !state.is_bootstrapped() {
            return Err(RotationError::NotBootstrapped {
                identity: identity.clone(),
            });
        }

        let existing = self
            .store_call("get_by_stage", || {
                self.store.get_by_stage(identity, Stage::Pending)
            })
            .await?;

        let version = if let Some(pending) = existing {
            tracing::info!(
                identity = %identity,
                key_id = %pending.key_id,
                "Reusing pending key from an interrupted createSecret"
            );
            pending.key_id
        } else {
            let key = self.generate_key().await?;
            let fingerprint = key.fingerprint.clone();
            let version = self.store_key(identity, key.into(), Stage::Pending).await?;
            tracing::info!(
                identity = %identity,
                key_id = %version,
                fingerprint = %fingerprint,
                "Stored pending key"
            );
            version
        };

        state.phase = state.phase.transition_to(Phase::PendingCreate)?;
        state.pending_key_id = Some(version);
        state.test_failures = 0;
        state.last_error = None;
        self.save(&mut state).await?;
        Ok(state.phase)
    }

    async fn set_secret(&self, identity: &IdentityId) -> RotationResult<Phase> {
        let mut state = self.load(identity).await?;
        match state.phase {
            Phase::PendingCreate => {}
            phase if never_started(&state) => return Err(out_of_order(identity, Step::Set, phase)),
            phase => {
                tracing::debug!(identity = %identity, phase = %phase, "setSecret has nothing to do");
                return Ok(phase);
            }
        }

        let current = self
            .credential(identity, state.active_key_id, Stage::Current)
            .await?;
        let pending = self
            .credential(identity, state.pending_key_id, Stage::Pending)
            .await?;

        let keys = BTreeSet::from([current.public_key, pending.public_key]);
        self.platform_call("set_identity_keys", || {
            self.platform.set_identity_keys(identity, &keys)
        })
        .await?;

        state.phase = state.phase.transition_to(Phase::PendingSet)?;
        self.save(&mut state).await?;
        tracing::info!(
            identity = %identity,
            pending = %pending.fingerprint,
            current = %current.fingerprint,
            "Pending key registered next to the current key"
        );
        Ok(state.phase)
    }

    async fn test_secret(&self, identity: &IdentityId) -> RotationResult<Phase> {
        let mut state = self.load(identity).await?;
        match state.phase {
            Phase::PendingSet | Phase::PendingTest => {}
            phase if phase == Phase::PendingCreate || never_started(&state) => {
                return Err(out_of_order(identity, Step::Test, phase));
            }
            phase => {
                tracing::debug!(identity = %identity, phase = %phase, "testSecret has nothing to do");
                return Ok(phase);
            }
        }

        if state.phase == Phase::PendingSet {
            state.phase = state.phase.transition_to(Phase::PendingTest)?;
            self.save(&mut state).await?;
        }

        let pending = self
            .credential(identity, state.pending_key_id, Stage::Pending)
            .await?;
        let outcome = match self.open_key(&pending).await {
            Ok(key) => match self
                .platform_call("authenticate_with_key", || {
                    self.platform.authenticate_with_key(identity, &key)
                })
                .await
            {
                Ok(true) => Ok(()),
                Ok(false) => Err("platform refused the pending key".to_owned()),
                Err(error) => Err(error.to_string()),
            },
            Err(error) => Err(error.to_string()),
        };

        match outcome {
            Ok(()) => {
                state.phase = state.phase.transition_to(Phase::PendingFinish)?;
                state.last_error = None;
                self.save(&mut state).await?;
                tracing::info!(identity = %identity, fingerprint = %pending.fingerprint, "Pending key authenticated");
            }
            Err(reason) => {
                state.test_failures += 1;
                state.last_error = Some(reason.clone());
                if state.test_failures >= self.policy.max_test_attempts {
                    return self.roll_back(identity, state).await;
                }
                state.phase = state.phase.transition_to(Phase::PendingSet)?;
                self.save(&mut state).await?;
                tracing::warn!(
                    identity = %identity,
                    attempt = state.test_failures,
                    max_attempts = self.policy.max_test_attempts,
                    reason = %reason,
                    "Pending key failed authentication"
                );
            }
        }
        Ok(state.phase)
    }

    /// Withdraw the pending key and return to the original CURRENT one.
    async fn roll_back(
        &self,
        identity: &IdentityId,
        mut state: RotationState,
    ) -> RotationResult<Phase> {
        tracing::warn!(
            identity = %identity,
            attempts = state.test_failures,
            "Test attempts exhausted, rolling back"
        );
        let rollback = |error: RotationError| RotationError::Rollback {
            identity: identity.clone(),
            reason: error.to_string(),
        };

        let current = self
            .credential(identity, state.active_key_id, Stage::Current)
            .await
            .map_err(rollback)?;
        let keys = BTreeSet::from([current.public_key]);
        self.platform_call("set_identity_keys", || {
            self.platform.set_identity_keys(identity, &keys)
        })
        .await
        .map_err(rollback)?;

        if let Some(pending) = state.pending_key_id {
            self.store_call("discard_version", || {
                self.store.discard_version(identity, &pending)
            })
            .await
            .map_err(rollback)?;
        }

        state.phase = state.phase.transition_to(Phase::RolledBack)?;
        state.pending_key_id = None;
        self.save(&mut state).await.map_err(rollback)?;
        Ok(state.phase)
    }

    async fn finish_secret(&self, identity: &IdentityId) -> RotationResult<Phase> {
        let mut state = self.load(identity).await?;
        match state.phase {
            Phase::PendingFinish => {}
            Phase::Stable | Phase::RolledBack if !never_started(&state) => {
                tracing::debug!(identity = %identity, phase = %state.phase, "finishSecret has nothing to do");
                return Ok(state.phase);
            }
            phase => return Err(out_of_order(identity, Step::Finish, phase)),
        }

        // Past this point nothing is undone automatically.
        let fatal = |error: RotationError| RotationError::Fatal {
            identity: identity.clone(),
            reason: error.to_string(),
        };

        let pending = self
            .credential(identity, state.pending_key_id, Stage::Pending)
            .await
            .map_err(fatal)?;
        let previous = state.active_key_id.filter(|id| *id != pending.key_id);

        self.store_call("put_stage_label", || {
            self.store
                .put_stage_label(identity, &pending.key_id, Stage::Current)
        })
        .await
        .map_err(fatal)?;

        let keys = BTreeSet::from([pending.public_key.clone()]);
        self.platform_call("set_identity_keys", || {
            self.platform.set_identity_keys(identity, &keys)
        })
        .await
        .map_err(fatal)?;

        if let Some(old) = previous {
            let now = Utc::now();
            self.store_call("mark_expired", || {
                self.store.mark_expired(identity, &old, now)
            })
            .await
            .map_err(fatal)?;
        }

        state.phase = state.phase.transition_to(Phase::Stable).map_err(fatal)?;
        state.active_key_id = Some(pending.key_id);
        state.pending_key_id = None;
        state.test_failures = 0;
        state.last_error = None;
        state.last_rotated_at = Some(Utc::now());
        self.save(&mut state).await.map_err(fatal)?;

        tracing::info!(
            identity = %identity,
            key_id = %pending.key_id,
            fingerprint = %pending.fingerprint,
            "Pending key promoted, previous key retired"
        );
        Ok(state.phase)
    }

    // ── Supplementary operations ───────────────────────────────────────────

    async fn bootstrap_locked(&self, identity: &IdentityId) -> RotationResult<VersionId> {
        let mut state = self.load(identity).await?;
        if state.is_bootstrapped() {
            return Err(RotationError::AlreadyBootstrapped {
                identity: identity.clone(),
            });
        }

        let existing = self
            .store_call("get_by_stage", || {
                self.store.get_by_stage(identity, Stage::Current)
            })
            .await?;

        let (version, public_key) = if let Some(current) = existing {
            tracing::info!(identity = %identity, key_id = %current.key_id, "Resuming interrupted bootstrap");
            (current.key_id, current.public_key)
        } else {
            let key = self.generate_key().await?;
            let public_key = key.public_key.clone();
            let version = self.store_key(identity, key.into(), Stage::Current).await?;
            (version, public_key)
        };

        let fingerprint = public_key.fingerprint().clone();
        let keys = BTreeSet::from([public_key]);
        self.platform_call("set_identity_keys", || {
            self.platform.set_identity_keys(identity, &keys)
        })
        .await?;

        state.active_key_id = Some(version);
        self.save(&mut state).await?;
        tracing::info!(identity = %identity, key_id = %version, fingerprint = %fingerprint, "Identity bootstrapped");
        Ok(version)
    }

    async fn acknowledge_locked(&self, identity: &IdentityId) -> RotationResult<Phase> {
        let mut state = self.load(identity).await?;
        match state.phase {
            Phase::RolledBack => {}
            Phase::Stable => return Ok(Phase::Stable),
            phase => {
                return Err(RotationError::InvalidStateTransition {
                    from: phase,
                    to: Phase::Stable,
                });
            }
        }

        state.phase = state.phase.transition_to(Phase::Stable)?;
        state.test_failures = 0;
        state.last_error = None;
        self.save(&mut state).await?;
        tracing::info!(identity = %identity, "Rollback acknowledged");
        Ok(state.phase)
    }

    async fn purge_locked(&self, identity: &IdentityId) -> RotationResult<usize> {
        let state = self.load(identity).await?;
        let versions = self
            .store_call("list_versions", || self.store.list_versions(identity))
            .await?;

        let referenced = [state.active_key_id, state.pending_key_id];
        let mut purged = 0;
        for credential in versions.iter().filter(|c| {
            !c.is(Stage::Current)
                && !c.is(Stage::Pending)
                && !referenced.contains(&Some(c.key_id))
        }) {
            self.store_call("discard_version", || {
                self.store.discard_version(identity, &credential.key_id)
            })
            .await?;
            tracing::info!(identity = %identity, key_id = %credential.key_id, "Purged retired key");
            purged += 1;
        }
        Ok(purged)
    }

    // ── Helpers ────────────────────────────────────────────────────────────

    async fn load(&self, identity: &IdentityId) -> RotationResult<RotationState> {
        self.store_call("load_state", || self.store.load_state(identity))
            .await?
            .ok_or_else(|| RotationError::NotBootstrapped {
                identity: identity.clone(),
            })
    }

    async fn save(&self, state: &mut RotationState) -> RotationResult<()> {
        state.updated_at = Utc::now();
        let expected = state.revision;
        let record: &RotationState = state;
        let revision = self
            .store_call("save_state", || self.store.save_state(record, expected))
            .await?;
        state.revision = revision;
        tracing::debug!(identity = %state.identity, phase = %state.phase, revision, "Rotation state saved");
        Ok(())
    }

    async fn store_key(
        &self,
        identity: &IdentityId,
        payload: SecretPayload,
        stage: Stage,
    ) -> RotationResult<VersionId> {
        let version = self
            .store_call("create_secret_version", || {
                self.store.create_secret_version(identity, payload.clone())
            })
            .await?;
        self.store_call("put_stage_label", || {
            self.store.put_stage_label(identity, &version, stage)
        })
        .await?;
        Ok(version)
    }

    async fn credential(
        &self,
        identity: &IdentityId,
        version: Option<VersionId>,
        stage: Stage,
    ) -> RotationResult<Credential> {
        let missing = || RotationError::MissingCredential {
            identity: identity.clone(),
            stage,
            version,
        };
        let Some(id) = version else {
            return Err(missing());
        };
        match self
            .store_call("get_version", || self.store.get_version(identity, &id))
            .await
        {
            Err(RotationError::Store(error)) if matches!(error.inner(), StoreError::NotFound { .. }) => {
                Err(missing())
            }
            other => other,
        }
    }

    async fn generate_key(&self) -> RotationResult<GeneratedKey> {
        let keygen = self.keygen.clone();
        let key = tokio::task::spawn_blocking(move || keygen.generate())
            .await
            .map_err(|e| KeyGenError::Generation(e.to_string()))??;
        Ok(key)
    }

    async fn open_key(&self, credential: &Credential) -> RotationResult<PrivateKey> {
        let keygen = self.keygen.clone();
        let pem = credential.encrypted_private_key.clone();
        let key = tokio::task::spawn_blocking(move || keygen.open(&pem))
            .await
            .map_err(|e| KeyGenError::Decrypt(e.to_string()))??;
        Ok(key)
    }

    async fn store_call<T, F, Fut>(&self, operation: &str, mut call: F) -> RotationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let timeout = self.policy.phase_timeout;
        retry_with_backoff(&self.policy.retry, operation, || {
            with_timeout(timeout, call())
        })
        .await
        .map_err(RotationError::from)
    }

    async fn platform_call<T, F, Fut>(&self, operation: &str, mut call: F) -> RotationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let timeout = self.policy.phase_timeout;
        retry_with_backoff(&self.policy.retry, operation, || {
            with_timeout(timeout, call())
        })
        .await
        .map_err(RotationError::from)
    }
}

/// STABLE on an identity that has never completed a rotation: no step has
/// run yet, so there is nothing to replay.
fn never_started(state: &RotationState) -> bool {
    state.phase == Phase::Stable && !state.has_rotated()
}

fn out_of_order(identity: &IdentityId, step: Step, phase: Phase) -> RotationError {
    RotationError::OutOfOrder {
        identity: identity.clone(),
        step,
        phase,
    }
}

fn cancelled(identity: &IdentityId, phase: Phase) -> RotationError {
    tracing::warn!(identity = %identity, phase = %phase, "Rotation cancelled at phase boundary");
    RotationError::Cancelled {
        identity: identity.clone(),
        phase,
    }
}

impl fmt::Debug for RotationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationController")
            .field("owner_id", &self.owner_id)
            .field("policy", &self.policy)
            .field("keygen", &self.keygen)
            .finish_non_exhaustive()
    }
}
