//! Rotation protocol against the in-memory platform and store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bastion_core::{
    IdentityId, InMemoryPlatform, PlatformCall, PlatformClient, PlatformError, PlatformOp,
    PrivateKey,
};
use bastion_credential::{
    Credential, CredentialStore, InMemoryCredentialStore, Phase, RotationController, RotationError,
    RotationPolicy, RotationState, Stage, Step, StoreError, StoreOp,
};
use bastion_resilience::RetryPolicy;
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const PASSPHRASE: &str = "rotation test passphrase";

struct Harness {
    platform: Arc<InMemoryPlatform>,
    store: Arc<InMemoryCredentialStore>,
    controller: RotationController,
    identity: IdentityId,
}

fn svc() -> IdentityId {
    IdentityId::new("SVC_X").unwrap()
}

fn fast_policy() -> RotationPolicy {
    RotationPolicy {
        key_bits: 2048,
        pbkdf2_iterations: 1_000,
        max_test_attempts: 3,
        lease_ttl: Duration::from_secs(60),
        phase_timeout: Duration::from_secs(10),
        retry: RetryPolicy::new(3, Duration::from_millis(1), 2.0, Duration::from_millis(10))
            .without_jitter(),
        ..RotationPolicy::default()
    }
}

fn controller(
    store: &Arc<InMemoryCredentialStore>,
    platform: &Arc<InMemoryPlatform>,
    policy: RotationPolicy,
) -> RotationController {
    RotationController::new(
        store.clone(),
        platform.clone(),
        policy,
        SecretString::from(PASSPHRASE.to_owned()),
    )
    .unwrap()
}

async fn harness_with(policy: RotationPolicy) -> Harness {
    let platform = Arc::new(InMemoryPlatform::new());
    let store = Arc::new(InMemoryCredentialStore::new());
    platform.add_identity(svc(), []);

    let controller = controller(&store, &platform, policy).with_owner_id("controller-a");
    controller.bootstrap(&svc()).await.unwrap();

    Harness {
        platform,
        store,
        controller,
        identity: svc(),
    }
}

async fn harness() -> Harness {
    harness_with(fast_policy()).await
}

impl Harness {
    async fn staged(&self, stage: Stage) -> Credential {
        self.store
            .get_by_stage(&self.identity, stage)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no {stage} credential"))
    }

    async fn versions(&self) -> Vec<Credential> {
        self.store.list_versions(&self.identity).await.unwrap()
    }

    fn open(&self, credential: &Credential) -> PrivateKey {
        self.controller
            .key_generator()
            .open(&credential.encrypted_private_key)
            .unwrap()
    }

    async fn authenticates(&self, key: &PrivateKey) -> bool {
        self.platform
            .authenticate_with_key(&self.identity, key)
            .await
            .unwrap()
    }

    async fn step(&self, step: Step) -> Result<Phase, RotationError> {
        self.controller.step(&self.identity, step).await
    }

    async fn rotate(&self) -> Result<RotationState, RotationError> {
        self.controller
            .rotate(&self.identity, &CancellationToken::new())
            .await
    }
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rotation_promotes_a_new_key_and_retires_the_old_one() {
    let h = harness().await;
    let k1 = h.staged(Stage::Current).await;

    let state = h.rotate().await.unwrap();
    let k2 = h.staged(Stage::Current).await;

    assert_eq!(state.phase, Phase::Stable);
    assert_ne!(k1.key_id, k2.key_id);
    assert_eq!(state.active_key_id, Some(k2.key_id));
    assert_eq!(state.pending_key_id, None);
    assert_eq!(
        h.platform.authorized_keys(&h.identity),
        BTreeSet::from([k2.public_key.clone()])
    );

    let versions = h.versions().await;
    assert_eq!(versions.iter().filter(|c| c.is(Stage::Current)).count(), 1);
    let retired = versions.iter().find(|c| c.key_id == k1.key_id).unwrap();
    assert_eq!(retired.stage, Some(Stage::Previous));
    assert!(retired.expired_at.is_some());

    assert!(!h.authenticates(&h.open(&k1)).await);
    assert!(h.authenticates(&h.open(&k2)).await);

    let persisted = h.controller.status(&h.identity).await.unwrap().unwrap();
    assert!(persisted.lease.is_none());
}

#[tokio::test]
async fn old_key_authenticates_until_finish() {
    let h = harness().await;
    let old = h.open(&h.staged(Stage::Current).await);

    assert_eq!(h.step(Step::Create).await.unwrap(), Phase::PendingCreate);
    assert!(h.authenticates(&old).await);

    assert_eq!(h.step(Step::Set).await.unwrap(), Phase::PendingSet);
    assert_eq!(h.platform.authorized_keys(&h.identity).len(), 2);
    assert!(h.authenticates(&old).await);
    let pending = h.open(&h.staged(Stage::Pending).await);
    assert!(h.authenticates(&pending).await);

    assert_eq!(h.step(Step::Test).await.unwrap(), Phase::PendingFinish);
    assert!(h.authenticates(&old).await);

    assert_eq!(h.step(Step::Finish).await.unwrap(), Phase::Stable);
    assert!(!h.authenticates(&old).await);
    assert!(h.authenticates(&pending).await);
}

// ---------------------------------------------------------------------------
// Test failures and rollback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_test_returns_to_pending_set() {
    let h = harness().await;
    h.step(Step::Create).await.unwrap();
    h.step(Step::Set).await.unwrap();
    h.platform
        .reject_key(h.staged(Stage::Pending).await.fingerprint);

    assert_eq!(h.step(Step::Test).await.unwrap(), Phase::PendingSet);

    let state = h.controller.status(&h.identity).await.unwrap().unwrap();
    assert_eq!(state.test_failures, 1);
    assert!(state.last_error.is_some());
}

#[tokio::test]
async fn exhausted_test_attempts_roll_back_to_the_original_key() {
    let h = harness().await;
    let k1 = h.staged(Stage::Current).await;

    h.step(Step::Create).await.unwrap();
    let pending = h.staged(Stage::Pending).await;
    h.platform.reject_key(pending.fingerprint.clone());

    let state = h.rotate().await.unwrap();

    assert_eq!(state.phase, Phase::RolledBack);
    assert_eq!(state.test_failures, 3);
    assert_eq!(state.pending_key_id, None);
    assert_eq!(state.active_key_id, Some(k1.key_id));
    assert_eq!(
        h.platform.authorized_keys(&h.identity),
        BTreeSet::from([k1.public_key.clone()])
    );

    let versions = h.versions().await;
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].key_id, k1.key_id);
    assert_eq!(versions[0].stage, Some(Stage::Current));

    let attempts = h
        .platform
        .calls()
        .iter()
        .filter(|call| {
            matches!(call, PlatformCall::Authenticate(_, fp) if *fp == pending.fingerprint)
        })
        .count();
    assert_eq!(attempts, 3);
    assert!(h.authenticates(&h.open(&k1)).await);
}

#[tokio::test]
async fn rolled_back_identity_needs_acknowledgement() {
    let h = harness().await;
    h.step(Step::Create).await.unwrap();
    h.platform
        .reject_key(h.staged(Stage::Pending).await.fingerprint);
    assert_eq!(h.rotate().await.unwrap().phase, Phase::RolledBack);

    let err = h.rotate().await.unwrap_err();
    assert!(matches!(err, RotationError::RollbackUnacknowledged { .. }));

    assert_eq!(
        h.controller.acknowledge_rollback(&h.identity).await.unwrap(),
        Phase::Stable
    );
    let state = h.rotate().await.unwrap();
    assert_eq!(state.phase, Phase::Stable);
    assert_eq!(h.platform.authorized_keys(&h.identity).len(), 1);
}

#[tokio::test]
async fn failure_while_rolling_back_is_reported_as_rollback_error() {
    let h = harness_with(RotationPolicy {
        max_test_attempts: 1,
        ..fast_policy()
    })
    .await;
    h.step(Step::Create).await.unwrap();
    h.step(Step::Set).await.unwrap();
    h.platform
        .reject_key(h.staged(Stage::Pending).await.fingerprint);
    h.platform.fail_next(
        PlatformOp::SetIdentityKeys,
        PlatformError::AccessDenied("revoked".into()),
    );

    let err = h.step(Step::Test).await.unwrap_err();

    assert!(matches!(err, RotationError::Rollback { .. }), "{err}");
    let state = h.controller.status(&h.identity).await.unwrap().unwrap();
    assert_eq!(state.phase, Phase::PendingTest);
}

// ---------------------------------------------------------------------------
// finishSecret
// ---------------------------------------------------------------------------

#[tokio::test]
async fn finish_failure_is_fatal_and_replayable() {
    let h = harness().await;
    let k1 = h.staged(Stage::Current).await;
    h.step(Step::Create).await.unwrap();
    h.step(Step::Set).await.unwrap();
    h.step(Step::Test).await.unwrap();
    let pending = h.staged(Stage::Pending).await;

    h.platform.fail_next(
        PlatformOp::SetIdentityKeys,
        PlatformError::AccessDenied("denied".into()),
    );
    let err = h.step(Step::Finish).await.unwrap_err();
    assert!(matches!(err, RotationError::Fatal { .. }), "{err}");

    assert_eq!(h.step(Step::Finish).await.unwrap(), Phase::Stable);
    assert_eq!(h.staged(Stage::Current).await.key_id, pending.key_id);
    assert_eq!(h.staged(Stage::Previous).await.key_id, k1.key_id);
    assert_eq!(
        h.platform.authorized_keys(&h.identity),
        BTreeSet::from([pending.public_key])
    );
}

// ---------------------------------------------------------------------------
// Idempotent replay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replayed_steps_are_no_ops() {
    let h = harness().await;

    h.step(Step::Create).await.unwrap();
    let pending = h.staged(Stage::Pending).await;
    assert_eq!(h.step(Step::Create).await.unwrap(), Phase::PendingCreate);
    assert_eq!(h.staged(Stage::Pending).await.key_id, pending.key_id);
    assert_eq!(h.versions().await.len(), 2);

    h.step(Step::Set).await.unwrap();
    h.platform.clear_calls();
    assert_eq!(h.step(Step::Set).await.unwrap(), Phase::PendingSet);
    assert_eq!(h.step(Step::Create).await.unwrap(), Phase::PendingSet);
    assert_eq!(h.platform.mutation_count(), 0);

    h.step(Step::Test).await.unwrap();
    h.step(Step::Finish).await.unwrap();
    h.platform.clear_calls();
    for step in Step::ALL.into_iter().skip(1) {
        assert_eq!(h.step(step).await.unwrap(), Phase::Stable);
    }
    assert_eq!(h.platform.mutation_count(), 0);
}

#[tokio::test]
async fn crash_after_storing_the_key_reuses_it() {
    let h = harness().await;
    h.store
        .fail_next(StoreOp::SaveState, StoreError::Backend("process killed".into()));

    let err = h.step(Step::Create).await.unwrap_err();
    assert!(matches!(err, RotationError::Store(_)), "{err}");
    let state = h.controller.status(&h.identity).await.unwrap().unwrap();
    assert_eq!(state.phase, Phase::Stable);
    let orphan = h.staged(Stage::Pending).await;

    assert_eq!(h.step(Step::Create).await.unwrap(), Phase::PendingCreate);
    let state = h.controller.status(&h.identity).await.unwrap().unwrap();
    assert_eq!(state.pending_key_id, Some(orphan.key_id));
    assert_eq!(h.versions().await.len(), 2);
}

#[tokio::test]
async fn steps_out_of_order_are_rejected() {
    let h = harness().await;
    h.step(Step::Create).await.unwrap();

    let err = h.step(Step::Finish).await.unwrap_err();
    assert!(matches!(
        err,
        RotationError::OutOfOrder {
            step: Step::Finish,
            phase: Phase::PendingCreate,
            ..
        }
    ));
    assert!(matches!(
        h.step(Step::Test).await.unwrap_err(),
        RotationError::OutOfOrder { .. }
    ));
}

#[tokio::test]
async fn steps_before_any_rotation_are_rejected() {
    let h = harness().await;
    h.platform.clear_calls();

    for step in Step::ALL.into_iter().skip(1) {
        let err = h.step(step).await.unwrap_err();
        assert!(
            matches!(err, RotationError::OutOfOrder { phase: Phase::Stable, .. }),
            "{step}: {err}"
        );
    }
    assert_eq!(h.platform.mutation_count(), 0);

    let state = h.controller.status(&h.identity).await.unwrap().unwrap();
    assert!(!state.has_rotated());
    h.rotate().await.unwrap();
    let state = h.controller.status(&h.identity).await.unwrap().unwrap();
    assert!(state.has_rotated());
}

// ---------------------------------------------------------------------------
// Leases and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lease_held_by_another_controller_is_a_conflict() {
    let h = harness().await;
    assert!(
        h.store
            .acquire_lease(&h.identity, "controller-b", Duration::from_secs(60))
            .await
            .unwrap()
    );
    h.platform.clear_calls();

    let err = h.rotate().await.unwrap_err();

    match &err {
        RotationError::AlreadyInProgress { owner, .. } => assert_eq!(owner, "controller-b"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_conflict());
    assert_eq!(h.platform.mutation_count(), 0);
}

#[tokio::test]
async fn concurrent_rotations_of_one_identity_do_not_both_run() {
    let h = harness().await;
    let other = controller(&h.store, &h.platform, fast_policy()).with_owner_id("controller-b");
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        h.controller.rotate(&h.identity, &cancel),
        other.rotate(&h.identity, &cancel)
    );

    let conflicts = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_conflict()))
        .count();
    assert_eq!(conflicts, 1, "{a:?} / {b:?}");
    assert!(a.is_ok() || b.is_ok());
}

#[tokio::test]
async fn expired_lease_is_taken_over_and_the_rotation_resumes() {
    let h = harness().await;
    let crashed =
        controller(&h.store, &h.platform, fast_policy()).with_owner_id("controller-crashed");

    crashed.step(&h.identity, Step::Create).await.unwrap();
    let orphan = h.staged(Stage::Pending).await;
    // The crashed controller had started its next phase when it died.
    h.store
        .acquire_lease(&h.identity, "controller-crashed", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(h.rotate().await.unwrap_err().is_conflict());

    h.store.expire_lease(&h.identity);
    let state = h.rotate().await.unwrap();

    assert_eq!(state.phase, Phase::Stable);
    assert_eq!(state.active_key_id, Some(orphan.key_id));
}

#[tokio::test]
async fn cancellation_stops_at_a_phase_boundary() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .controller
        .rotate(&h.identity, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RotationError::Cancelled {
            phase: Phase::Stable,
            ..
        }
    ));
    let state = h.controller.status(&h.identity).await.unwrap().unwrap();
    assert_eq!(state.phase, Phase::Stable);
    assert!(state.lease.is_none());
}

#[tokio::test]
async fn cancelled_rotation_resumes_later() {
    let h = harness().await;
    h.step(Step::Create).await.unwrap();
    h.step(Step::Set).await.unwrap();

    let state = h.rotate().await.unwrap();
    assert_eq!(state.phase, Phase::Stable);
    assert_eq!(h.versions().await.len(), 2);
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_are_retried() {
    let h = harness().await;
    h.platform.fail_next(
        PlatformOp::SetIdentityKeys,
        PlatformError::Unavailable("503".into()),
    );
    h.store
        .fail_next(StoreOp::LoadState, StoreError::Transient("throttled".into()));

    let state = h.rotate().await.unwrap();
    assert_eq!(state.phase, Phase::Stable);
}

// ---------------------------------------------------------------------------
// Supplementary operations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bootstrap_is_required_and_happens_once() {
    let h = harness().await;
    let fresh = IdentityId::new("SVC_Y").unwrap();
    h.platform.add_identity(fresh.clone(), []);

    let err = h
        .controller
        .rotate(&fresh, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RotationError::NotBootstrapped { .. }));

    h.controller.bootstrap(&fresh).await.unwrap();
    assert_eq!(h.platform.authorized_keys(&fresh).len(), 1);

    let err = h.controller.bootstrap(&fresh).await.unwrap_err();
    assert!(matches!(err, RotationError::AlreadyBootstrapped { .. }));
    assert!(!h.controller.is_due(&fresh).await.unwrap());
}

#[tokio::test]
async fn purge_previous_keeps_only_the_current_key() {
    let h = harness().await;
    h.rotate().await.unwrap();
    h.rotate().await.unwrap();
    assert_eq!(h.versions().await.len(), 3);

    assert_eq!(h.controller.purge_previous(&h.identity).await.unwrap(), 2);

    let versions = h.versions().await;
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].stage, Some(Stage::Current));
    assert_eq!(h.controller.purge_previous(&h.identity).await.unwrap(), 0);
}
