//! `bootstrap`, `rotate`, `ack-rollback`, `purge-previous`, `status`

use std::future::Future;

use bastion_core::IdentityId;
use bastion_credential::{Phase, RotationController, RotationPolicy};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use crate::cli::RotationArgs;
use crate::exit::CommandFailure;
use crate::loader::load_rotation_policy;
use crate::settings::Settings;
use crate::state::{Backends, LocalState};

pub async fn bootstrap(settings: &Settings, args: RotationArgs) -> anyhow::Result<()> {
    let identity = IdentityId::new(&args.identity.identity)?;
    with_controller(settings, args, |controller, backends| async move {
        if !backends.platform.snapshot().identities.contains_key(&identity) {
            tracing::info!(identity = %identity, "Registering identity on the local platform");
            backends.platform.add_identity(identity.clone(), []);
        }
        let version = controller.bootstrap(&identity).await?;
        println!("{identity}: bootstrapped with key version {version}");
        Ok::<_, anyhow::Error>(())
    })
    .await
}

pub async fn rotate(settings: &Settings, args: RotationArgs) -> anyhow::Result<()> {
    let identity = IdentityId::new(&args.identity.identity)?;
    with_controller(settings, args, |controller, _| async move {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping at the next phase boundary");
                on_signal.cancel();
            }
        });

        let result = controller.rotate(&identity, &cancel).await;
        watcher.abort();
        let state = result?;

        if state.phase == Phase::RolledBack {
            return Err(CommandFailure::RolledBack {
                identity: identity.to_string(),
                reason: state.last_error.unwrap_or_default(),
            }
            .into());
        }
        match state.active_key_id {
            Some(version) => println!("{identity}: rotated, current key version {version}"),
            None => println!("{identity}: rotated"),
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
}

pub async fn acknowledge(settings: &Settings, args: RotationArgs) -> anyhow::Result<()> {
    let identity = IdentityId::new(&args.identity.identity)?;
    with_controller(settings, args, |controller, _| async move {
        let phase = controller.acknowledge_rollback(&identity).await?;
        println!("{identity}: {phase}");
        Ok::<_, anyhow::Error>(())
    })
    .await
}

pub async fn purge(settings: &Settings, args: RotationArgs) -> anyhow::Result<()> {
    let identity = IdentityId::new(&args.identity.identity)?;
    with_controller(settings, args, |controller, _| async move {
        let purged = controller.purge_previous(&identity).await?;
        println!("{identity}: purged {purged} retired key version(s)");
        Ok::<_, anyhow::Error>(())
    })
    .await
}

/// Print the stored rotation record; needs no passphrase.
pub async fn status(settings: &Settings, identity: &str) -> anyhow::Result<()> {
    let identity = IdentityId::new(identity)?;
    let state = LocalState::load(&settings.state_file)?;
    let record = state.credentials.identities.get(&identity);

    match record.and_then(|record| record.state.as_ref()) {
        Some(rotation) => println!("{}", serde_json::to_string_pretty(rotation)?),
        None => println!("{identity}: no rotation record"),
    }
    Ok(())
}

fn policy(settings: &Settings) -> anyhow::Result<RotationPolicy> {
    match &settings.policy_file {
        Some(path) => Ok(load_rotation_policy(path)?),
        None => Ok(RotationPolicy::default()),
    }
}

/// Build a controller over the local state, run `op`, and write the state
/// back whether or not `op` succeeded: a failed rotation still leaves
/// progress in the store that the next run resumes from.
async fn with_controller<F, Fut>(
    settings: &Settings,
    args: RotationArgs,
    op: F,
) -> anyhow::Result<()>
where
    F: FnOnce(RotationController, Backends) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let passphrase = args
        .passphrase
        .map(SecretString::from)
        .ok_or(CommandFailure::MissingPassphrase)?;
    let policy = policy(settings)?;

    let backends = LocalState::load(&settings.state_file)?.into_backends();
    let controller = RotationController::new(
        backends.store.clone(),
        backends.platform.clone(),
        policy,
        passphrase,
    )?;

    let result = op(controller, backends.clone()).await;
    let saved = backends.snapshot().save(&settings.state_file);
    settle(result, saved)
}

/// Combine the command outcome with the state write. A failed command keeps
/// its own error at the bottom of the chain so the exit code still reflects it.
fn settle(result: anyhow::Result<()>, saved: anyhow::Result<()>) -> anyhow::Result<()> {
    match (result, saved) {
        (result, Ok(())) => result,
        (Ok(()), Err(save_error)) => Err(save_error.context("state was not saved")),
        (Err(error), Err(save_error)) => {
            tracing::error!(error = %format!("{save_error:#}"), "State was not saved");
            Err(error.context(format!("state was not saved either ({save_error:#})")))
        }
    }
}
