//! In-process platform.
//!
//! Backs the CLI's local mode and every test in the workspace. It enforces
//! the same preconditions the real platform does (grants need both roles,
//! identities hold at most two public keys) and can be told to fail.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::grant::GrantEdge;
use crate::id::{IdentityId, RoleName};
use crate::key::{Fingerprint, PrivateKey, PublicKeyPem};
use crate::platform::{PlatformClient, PlatformError, PlatformResult};

/// Public keys an identity may hold at once.
pub const MAX_KEYS_PER_IDENTITY: usize = 2;

/// Persistable platform state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSnapshot {
    /// Existing roles
    pub roles: BTreeSet<RoleName>,
    /// Existing grant edges
    pub grants: BTreeSet<GrantEdge>,
    /// Authorized public keys per identity
    pub identities: BTreeMap<IdentityId, BTreeSet<PublicKeyPem>>,
}

/// Which [`PlatformClient`] method a call or fault refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformOp {
    /// `create_role`
    CreateRole,
    /// `grant`
    Grant,
    /// `revoke`
    Revoke,
    /// `list_roles`
    ListRoles,
    /// `list_grants`
    ListGrants,
    /// `set_identity_keys`
    SetIdentityKeys,
    /// `identity_keys`
    IdentityKeys,
    /// `authenticate_with_key`
    Authenticate,
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    /// `create_role(name)`
    CreateRole(RoleName),
    /// `grant(edge)`
    Grant(GrantEdge),
    /// `revoke(edge)`
    Revoke(GrantEdge),
    /// `list_roles()`
    ListRoles,
    /// `list_grants()`
    ListGrants,
    /// `set_identity_keys(identity, keys)` with the fingerprints passed
    SetIdentityKeys(IdentityId, BTreeSet<Fingerprint>),
    /// `identity_keys(identity)`
    IdentityKeys(IdentityId),
    /// `authenticate_with_key(identity, key)` with the key's fingerprint
    Authenticate(IdentityId, Fingerprint),
}

impl PlatformCall {
    /// The method this call went to.
    pub fn op(&self) -> PlatformOp {
        match self {
            Self::CreateRole(_) => PlatformOp::CreateRole,
            Self::Grant(_) => PlatformOp::Grant,
            Self::Revoke(_) => PlatformOp::Revoke,
            Self::ListRoles => PlatformOp::ListRoles,
            Self::ListGrants => PlatformOp::ListGrants,
            Self::SetIdentityKeys(..) => PlatformOp::SetIdentityKeys,
            Self::IdentityKeys(_) => PlatformOp::IdentityKeys,
            Self::Authenticate(..) => PlatformOp::Authenticate,
        }
    }

    /// Whether the call changes platform state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::CreateRole(_) | Self::Grant(_) | Self::Revoke(_) | Self::SetIdentityKeys(..)
        )
    }
}

#[derive(Debug, Default)]
struct Faults {
    by_op: HashMap<PlatformOp, VecDeque<PlatformError>>,
    by_edge: HashMap<GrantEdge, VecDeque<PlatformError>>,
    rejected_keys: HashSet<Fingerprint>,
}

impl Faults {
    fn take(&mut self, call: &PlatformCall) -> Option<PlatformError> {
        if let PlatformCall::Grant(edge) | PlatformCall::Revoke(edge) = call
            && let Some(error) = self.by_edge.get_mut(edge).and_then(VecDeque::pop_front)
        {
            return Some(error);
        }
        self.by_op.get_mut(&call.op()).and_then(VecDeque::pop_front)
    }
}

/// A [`PlatformClient`] held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryPlatform {
    state: Mutex<PlatformSnapshot>,
    faults: Mutex<Faults>,
    calls: Mutex<Vec<PlatformCall>>,
    latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InMemoryPlatform {
    /// Empty platform.
    pub fn new() -> Self {
        Self::default()
    }

    /// Platform restored from a snapshot.
    pub fn from_snapshot(snapshot: PlatformSnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
            ..Self::default()
        }
    }

    /// Seed roles that exist before Bastion runs, such as system roles.
    pub fn with_roles(self, roles: impl IntoIterator<Item = RoleName>) -> Self {
        self.state.lock().roles.extend(roles);
        self
    }

    /// Seed grant edges, creating their endpoints.
    pub fn with_grants(self, grants: impl IntoIterator<Item = GrantEdge>) -> Self {
        {
            let mut state = self.state.lock();
            for edge in grants {
                state.roles.insert(edge.grantor.clone());
                state.roles.insert(edge.grantee.clone());
                state.grants.insert(edge);
            }
        }
        self
    }

    /// Create a service identity with the given authorized keys.
    pub fn add_identity(&self, identity: IdentityId, keys: impl IntoIterator<Item = PublicKeyPem>) {
        self.state
            .lock()
            .identities
            .insert(identity, keys.into_iter().collect());
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> PlatformSnapshot {
        self.state.lock().clone()
    }

    /// Fail the next call to `op` with `error`. Repeated calls queue up.
    pub fn fail_next(&self, op: PlatformOp, error: PlatformError) {
        self.faults
            .lock()
            .by_op
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Fail the next `times` grant or revoke calls for exactly `edge`.
    pub fn fail_edge(&self, edge: GrantEdge, error: PlatformError, times: usize) {
        let mut faults = self.faults.lock();
        let queue = faults.by_edge.entry(edge).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Refuse authentication with the key carrying `fingerprint`, even when
    /// it is registered.
    pub fn reject_key(&self, fingerprint: Fingerprint) {
        self.faults.lock().rejected_keys.insert(fingerprint);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().clone()
    }

    /// Number of state-changing calls received.
    pub fn mutation_count(&self) -> usize {
        self.calls.lock().iter().filter(|c| c.is_mutation()).count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Highest number of calls observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Keys authorized for `identity`, empty when it does not exist.
    pub fn authorized_keys(&self, identity: &IdentityId) -> BTreeSet<PublicKeyPem> {
        self.state
            .lock()
            .identities
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    async fn begin(&self, call: PlatformCall) -> PlatformResult<()> {
        let fault = self.faults.lock().take(&call);
        self.calls.lock().push(call);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        fault.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl PlatformClient for InMemoryPlatform {
    async fn create_role(&self, name: &RoleName) -> PlatformResult<()> {
        self.begin(PlatformCall::CreateRole(name.clone())).await?;
        if self.state.lock().roles.insert(name.clone()) {
            tracing::debug!(role = %name, "Created role");
        }
        Ok(())
    }

    async fn grant(&self, edge: &GrantEdge) -> PlatformResult<()> {
        self.begin(PlatformCall::Grant(edge.clone())).await?;
        let mut state = self.state.lock();
        for role in [&edge.grantor, &edge.grantee] {
            if !state.roles.contains(role) {
                return Err(PlatformError::UnknownRole(role.clone()));
            }
        }
        state.grants.insert(edge.clone());
        Ok(())
    }

    async fn revoke(&self, edge: &GrantEdge) -> PlatformResult<()> {
        self.begin(PlatformCall::Revoke(edge.clone())).await?;
        self.state.lock().grants.remove(edge);
        Ok(())
    }

    async fn list_roles(&self) -> PlatformResult<BTreeSet<RoleName>> {
        self.begin(PlatformCall::ListRoles).await?;
        Ok(self.state.lock().roles.clone())
    }

    async fn list_grants(&self) -> PlatformResult<BTreeSet<GrantEdge>> {
        self.begin(PlatformCall::ListGrants).await?;
        Ok(self.state.lock().grants.clone())
    }

    async fn set_identity_keys(
        &self,
        identity: &IdentityId,
        keys: &BTreeSet<PublicKeyPem>,
    ) -> PlatformResult<()> {
        let fingerprints = keys.iter().map(|k| k.fingerprint().clone()).collect();
        self.begin(PlatformCall::SetIdentityKeys(identity.clone(), fingerprints))
            .await?;

        if keys.len() > MAX_KEYS_PER_IDENTITY {
            return Err(PlatformError::Rejected(format!(
                "identity {identity} can hold at most {MAX_KEYS_PER_IDENTITY} public keys, got {}",
                keys.len()
            )));
        }

        let mut state = self.state.lock();
        let slot = state
            .identities
            .get_mut(identity)
            .ok_or_else(|| PlatformError::UnknownIdentity(identity.clone()))?;
        slot.clone_from(keys);
        Ok(())
    }

    async fn identity_keys(&self, identity: &IdentityId) -> PlatformResult<BTreeSet<PublicKeyPem>> {
        self.begin(PlatformCall::IdentityKeys(identity.clone())).await?;
        self.state
            .lock()
            .identities
            .get(identity)
            .cloned()
            .ok_or_else(|| PlatformError::UnknownIdentity(identity.clone()))
    }

    async fn authenticate_with_key(
        &self,
        identity: &IdentityId,
        key: &PrivateKey,
    ) -> PlatformResult<bool> {
        let public = key.public_key_pem()?;
        self.begin(PlatformCall::Authenticate(
            identity.clone(),
            public.fingerprint().clone(),
        ))
        .await?;

        if self.faults.lock().rejected_keys.contains(public.fingerprint()) {
            return Ok(false);
        }

        let authorized = self
            .state
            .lock()
            .identities
            .get(identity)
            .cloned()
            .ok_or_else(|| PlatformError::UnknownIdentity(identity.clone()))?;

        let challenge: [u8; 32] = rand::random();
        let signature = key.sign(&challenge)?;
        Ok(authorized
            .iter()
            .any(|candidate| candidate.verify(&challenge, &signature)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use rand::rngs::OsRng;
    use rsa::RsaPrivateKey;

    use super::*;
    use crate::grant::AccessLevel;
    use crate::id::DatabaseName;

    fn role(name: &str) -> RoleName {
        RoleName::new(name).unwrap()
    }

    fn identity() -> IdentityId {
        IdentityId::new("SVC_X").unwrap()
    }

    fn keypair() -> PrivateKey {
        PrivateKey::from_rsa(RsaPrivateKey::new(&mut OsRng, 1024).unwrap())
    }

    #[tokio::test]
    async fn grant_requires_both_roles() {
        let platform = InMemoryPlatform::new().with_roles([role("ADMIN")]);
        let edge = GrantEdge::database(
            role("ADMIN"),
            role("DB_RO"),
            DatabaseName::new("BRONZE").unwrap(),
            AccessLevel::Ro,
        );

        assert_eq!(
            platform.grant(&edge).await,
            Err(PlatformError::UnknownRole(role("DB_RO")))
        );

        platform.create_role(&role("DB_RO")).await.unwrap();
        platform.grant(&edge).await.unwrap();
        assert!(platform.list_grants().await.unwrap().contains(&edge));
    }

    #[tokio::test]
    async fn create_and_revoke_are_idempotent() {
        let platform = InMemoryPlatform::new();
        let edge = GrantEdge::role(role("A"), role("B"));

        platform.create_role(&role("A")).await.unwrap();
        platform.create_role(&role("A")).await.unwrap();
        platform.revoke(&edge).await.unwrap();

        assert_eq!(platform.snapshot().roles.len(), 1);
        assert_eq!(platform.mutation_count(), 3);
    }

    #[tokio::test]
    async fn injected_faults_fire_once_in_order() {
        let platform = InMemoryPlatform::new();
        platform.fail_next(PlatformOp::ListRoles, PlatformError::RateLimited("429".into()));
        platform.fail_next(PlatformOp::ListRoles, PlatformError::Unavailable("503".into()));

        assert!(matches!(platform.list_roles().await, Err(PlatformError::RateLimited(_))));
        assert!(matches!(platform.list_roles().await, Err(PlatformError::Unavailable(_))));
        assert!(platform.list_roles().await.is_ok());
    }

    #[tokio::test]
    async fn edge_faults_only_hit_that_edge() {
        let platform = InMemoryPlatform::new().with_roles([role("A"), role("B"), role("C")]);
        let bad = GrantEdge::role(role("A"), role("B"));
        let good = GrantEdge::role(role("A"), role("C"));
        platform.fail_edge(bad.clone(), PlatformError::AccessDenied("nope".into()), 1);

        assert!(platform.grant(&good).await.is_ok());
        assert!(platform.grant(&bad).await.is_err());
        assert!(platform.grant(&bad).await.is_ok());
    }

    #[tokio::test]
    async fn authenticates_only_registered_keys() {
        let platform = InMemoryPlatform::new();
        let k1 = keypair();
        let k2 = keypair();
        platform.add_identity(identity(), [k1.public_key_pem().unwrap()]);

        assert!(platform.authenticate_with_key(&identity(), &k1).await.unwrap());
        assert!(!platform.authenticate_with_key(&identity(), &k2).await.unwrap());

        let both = [k1.public_key_pem().unwrap(), k2.public_key_pem().unwrap()]
            .into_iter()
            .collect();
        platform.set_identity_keys(&identity(), &both).await.unwrap();
        assert!(platform.authenticate_with_key(&identity(), &k2).await.unwrap());

        platform.reject_key(k2.public_key_pem().unwrap().fingerprint().clone());
        assert!(!platform.authenticate_with_key(&identity(), &k2).await.unwrap());
        assert!(platform.authenticate_with_key(&identity(), &k1).await.unwrap());
    }

    #[tokio::test]
    async fn identity_holds_at_most_two_keys() {
        let platform = InMemoryPlatform::new();
        platform.add_identity(identity(), []);
        let three = (0..3).map(|_| keypair().public_key_pem().unwrap()).collect();

        assert!(matches!(
            platform.set_identity_keys(&identity(), &three).await,
            Err(PlatformError::Rejected(_))
        ));
        assert!(platform.authorized_keys(&identity()).is_empty());
    }

    #[tokio::test]
    async fn unknown_identity_is_permanent() {
        let platform = InMemoryPlatform::new();
        let err = platform.identity_keys(&identity()).await.unwrap_err();
        assert_eq!(err, PlatformError::UnknownIdentity(identity()));
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_peak_concurrency() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.set_latency(Duration::from_millis(50));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..3 {
            let platform = Arc::clone(&platform);
            tasks.spawn(async move { platform.create_role(&role(&format!("R{i}"))).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(platform.peak_concurrency(), 3);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let platform = InMemoryPlatform::new().with_grants([GrantEdge::role(role("A"), role("B"))]);
        platform.add_identity(identity(), [keypair().public_key_pem().unwrap()]);

        let json = serde_json::to_string(&platform.snapshot()).unwrap();
        let restored: PlatformSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, platform.snapshot());
    }
}
