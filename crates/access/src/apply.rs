//! Grant Reconciler: reads live state, diffs, and applies.
//!
//! Role creations go first, then grant creations level by level, then
//! revokes. Operations inside a level run concurrently on a fixed-size
//! worker pool. A failing operation never stops the others; unresolved
//! failures are collected in the [`ApplyReport`] and nothing is rolled back.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bastion_core::{GrantEdge, PlatformClient, PlatformError, RoleName};
use bastion_resilience::{RetryError, RetryPolicy, retry_with_backoff, with_timeout};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::builder::compile;
use crate::error::ReconcileError;
use crate::legality::LegalityOptions;
use crate::plan::GrantPlan;
use crate::reconcile::{LiveState, LockoutGuard, ReconcileDiff, diff};
use crate::spec::RoleSpec;

/// Reconciler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Platform calls in flight at once
    pub workers: usize,
    /// Retry policy for each platform call
    pub retry: RetryPolicy,
    /// Deadline for a single platform call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Edges that must survive every run
    pub guard: LockoutGuard,
    /// Builder switches
    #[serde(skip)]
    pub legality: LegalityOptions,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
            guard: LockoutGuard::default(),
            legality: LegalityOptions::default(),
        }
    }
}

/// One platform mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Create a role
    CreateRole {
        /// Role to create
        role: RoleName,
    },
    /// Apply a grant
    Grant {
        /// Edge to apply
        edge: GrantEdge,
    },
    /// Remove a grant
    Revoke {
        /// Edge to remove
        edge: GrantEdge,
    },
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Self::CreateRole { .. } => "create_role",
            Self::Grant { .. } => "grant",
            Self::Revoke { .. } => "revoke",
        }
    }

    async fn execute(&self, client: &dyn PlatformClient) -> Result<(), PlatformError> {
        match self {
            Self::CreateRole { role } => client.create_role(role).await,
            Self::Grant { edge } => client.grant(edge).await,
            Self::Revoke { edge } => client.revoke(edge).await,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateRole { role } => write!(f, "create role {role}"),
            Self::Grant { edge } => write!(f, "grant {edge}"),
            Self::Revoke { edge } => write!(f, "revoke {edge}"),
        }
    }
}

/// An operation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyFailure {
    /// What was attempted
    pub operation: Operation,
    /// Attempts made
    pub attempts: u32,
    /// Last error
    pub error: String,
    /// Whether the last error was transient and the retry budget ran out
    pub exhausted: bool,
}

/// Outcome of applying a diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Operations that succeeded, in completion order within each level
    pub applied: Vec<Operation>,
    /// Operations that failed after retries
    pub failed: Vec<ApplyFailure>,
    /// Grants not attempted because an endpoint role could not be created
    pub skipped: Vec<Operation>,
}

impl ApplyReport {
    /// Whether every operation was applied.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// Operations left unresolved.
    pub fn unresolved(&self) -> usize {
        self.failed.len() + self.skipped.len()
    }

    fn absorb(&mut self, results: Vec<(Operation, Result<(), RetryError<PlatformError>>)>) {
        for (operation, result) in results {
            match result {
                Ok(()) => self.applied.push(operation),
                Err(error) => self.failed.push(ApplyFailure {
                    attempts: error.attempts(),
                    exhausted: matches!(error, RetryError::Exhausted { .. }),
                    error: error.inner().to_string(),
                    operation,
                }),
            }
        }
    }
}

/// Result of a full reconciliation run.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    /// The compiled plan
    pub plan: GrantPlan,
    /// What differed from live state
    pub diff: ReconcileDiff,
    /// What applying the diff did; `None` on a dry run
    pub report: Option<ApplyReport>,
}

/// Applies role specifications to a platform.
pub struct Reconciler {
    client: Arc<dyn PlatformClient>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Reconciler over `client`.
    pub fn new(client: Arc<dyn PlatformClient>, config: ReconcilerConfig) -> Self {
        Self { client, config }
    }

    /// The settings in use.
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Compile, diff, and (unless `dry_run`) apply `specs`.
    pub async fn reconcile(
        &self,
        specs: &[RoleSpec],
        dry_run: bool,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let plan = compile(specs, self.config.legality)?;
        let live = self.fetch_live().await?;
        let diff = self.plan(&plan, &live);

        tracing::info!(
            roles_to_create = diff.roles_to_create.len(),
            grants_to_create = diff.to_create.len(),
            grants_to_revoke = diff.to_revoke.len(),
            unchanged = diff.unchanged.len(),
            dry_run,
            "Computed grant diff"
        );

        let report = if dry_run {
            None
        } else {
            Some(self.apply(&plan, &diff).await)
        };

        Ok(ReconcileOutcome { plan, diff, report })
    }

    /// Read roles and grants from the platform.
    pub async fn fetch_live(&self) -> Result<LiveState, RetryError<PlatformError>> {
        let client = &self.client;
        let timeout = self.config.call_timeout;
        let roles = retry_with_backoff(&self.config.retry, "list_roles", || {
            with_timeout(timeout, client.list_roles())
        })
        .await?;
        let grants = retry_with_backoff(&self.config.retry, "list_grants", || {
            with_timeout(timeout, client.list_grants())
        })
        .await?;
        Ok(LiveState { roles, grants })
    }

    /// Diff `plan` against `live` under the configured lockout guard.
    pub fn plan(&self, plan: &GrantPlan, live: &LiveState) -> ReconcileDiff {
        diff(plan, live, &self.config.guard)
    }

    /// Apply `diff`, scheduling creations by the levels of `plan`.
    pub async fn apply(&self, plan: &GrantPlan, diff: &ReconcileDiff) -> ApplyReport {
        let mut report = ApplyReport::default();
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let level_of = plan.level_map();

        let mut role_levels: BTreeMap<usize, Vec<Operation>> = BTreeMap::new();
        for role in &diff.roles_to_create {
            let level = level_of.get(role).copied().unwrap_or_default();
            role_levels
                .entry(level)
                .or_default()
                .push(Operation::CreateRole { role: role.clone() });
        }
        for batch in role_levels.into_values() {
            let results = self.run_batch(batch, &semaphore).await;
            report.absorb(results);
        }

        let missing: HashSet<RoleName> = report
            .failed
            .iter()
            .filter_map(|failure| match &failure.operation {
                Operation::CreateRole { role } => Some(role.clone()),
                _ => None,
            })
            .collect();

        let mut grant_levels: BTreeMap<usize, Vec<Operation>> = BTreeMap::new();
        for edge in &diff.to_create {
            let operation = Operation::Grant { edge: edge.clone() };
            if missing.contains(&edge.grantor) || missing.contains(&edge.grantee) {
                tracing::warn!(edge = %edge, "Skipping grant whose role could not be created");
                report.skipped.push(operation);
                continue;
            }
            let level = level_of.get(&edge.grantee).copied().unwrap_or_default();
            grant_levels.entry(level).or_default().push(operation);
        }
        for batch in grant_levels.into_values() {
            let results = self.run_batch(batch, &semaphore).await;
            report.absorb(results);
        }

        let revokes = diff
            .to_revoke
            .iter()
            .map(|edge| Operation::Revoke { edge: edge.clone() })
            .collect();
        let results = self.run_batch(revokes, &semaphore).await;
        report.absorb(results);

        if report.is_success() {
            tracing::info!(applied = report.applied.len(), "Grant diff applied");
        } else {
            tracing::error!(
                applied = report.applied.len(),
                failed = report.failed.len(),
                skipped = report.skipped.len(),
                "Grant diff partially applied"
            );
        }

        report
    }

    /// Run independent operations concurrently, at most `workers` at a time.
    async fn run_batch(
        &self,
        batch: Vec<Operation>,
        semaphore: &Arc<Semaphore>,
    ) -> Vec<(Operation, Result<(), RetryError<PlatformError>>)> {
        let mut join_set = JoinSet::new();

        for (index, operation) in batch.iter().cloned().enumerate() {
            let client = Arc::clone(&self.client);
            let sem = Arc::clone(semaphore);
            let retry = self.config.retry.clone();
            let timeout = self.config.call_timeout;

            join_set.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return (
                        index,
                        Err(RetryError::Permanent {
                            operation: operation.name().to_owned(),
                            error: PlatformError::Unavailable("worker pool closed".into()),
                        }),
                    );
                };
                let result = retry_with_backoff(&retry, operation.name(), || {
                    with_timeout(timeout, operation.execute(client.as_ref()))
                })
                .await;

                match &result {
                    Ok(()) => tracing::debug!(operation = %operation, "Applied"),
                    Err(error) => {
                        tracing::error!(operation = %operation, error = %error, "Operation failed");
                    }
                }
                (index, result)
            });
        }

        let mut results: BTreeMap<usize, Result<(), RetryError<PlatformError>>> = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => {
                    results.insert(index, result);
                }
                Err(join_err) => tracing::error!(?join_err, "Worker task panicked"),
            }
        }

        batch
            .into_iter()
            .enumerate()
            .map(|(index, operation)| {
                let result = results.remove(&index).unwrap_or_else(|| {
                    Err(RetryError::Permanent {
                        operation: operation.name().to_owned(),
                        error: PlatformError::Unavailable("worker task panicked".into()),
                    })
                });
                (operation, result)
            })
            .collect()
    }
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
