//! `validate` and `reconcile-roles`

use anyhow::Context;
use bastion_access::{ApplyReport, ReconcileDiff, Reconciler, compile};

use crate::exit::CommandFailure;
use crate::loader::load_role_specs;
use crate::settings::Settings;
use crate::state::LocalState;

pub fn validate(settings: &Settings) -> anyhow::Result<()> {
    let specs = load_role_specs(&settings.roles_file)?;
    let plan = compile(&specs, settings.reconciler_config().legality)?;

    println!(
        "{}: {} roles, {} grant edges, {} levels",
        settings.roles_file.display(),
        plan.roles.len(),
        plan.edges.len(),
        plan.levels.len()
    );
    Ok(())
}

pub async fn reconcile(settings: &Settings, dry_run: bool) -> anyhow::Result<()> {
    let specs = load_role_specs(&settings.roles_file)?;
    let state = LocalState::load(&settings.state_file)?;
    let backends = state.into_backends();

    let reconciler = Reconciler::new(backends.platform.clone(), settings.reconciler_config());
    let outcome = reconciler.reconcile(&specs, dry_run).await?;

    print_diff(&outcome.diff);

    let Some(report) = outcome.report else {
        println!("dry run: nothing applied");
        return Ok(());
    };

    backends
        .snapshot()
        .save(&settings.state_file)
        .context("reconciliation applied but state was not saved")?;
    print_report(&report);

    if report.is_success() {
        Ok(())
    } else {
        Err(CommandFailure::PartialApply {
            failed: report.failed.len(),
            skipped: report.skipped.len(),
        }
        .into())
    }
}

fn print_diff(diff: &ReconcileDiff) {
    for role in &diff.roles_to_create {
        println!("+ role  {role}");
    }
    for edge in &diff.to_create {
        println!("+ grant {edge}");
    }
    for edge in &diff.to_revoke {
        println!("- grant {edge}");
    }
    for edge in &diff.protected {
        println!("! keep  {edge} (protected)");
    }
    println!(
        "{} roles to create, {} grants to create, {} grants to revoke, {} unchanged",
        diff.roles_to_create.len(),
        diff.to_create.len(),
        diff.to_revoke.len(),
        diff.unchanged.len()
    );
}

fn print_report(report: &ApplyReport) {
    for failure in &report.failed {
        println!(
            "FAILED  {} after {} attempt(s): {}",
            failure.operation, failure.attempts, failure.error
        );
    }
    for operation in &report.skipped {
        println!("SKIPPED {operation}");
    }
    println!(
        "applied {}, failed {}, skipped {}",
        report.applied.len(),
        report.failed.len(),
        report.skipped.len()
    );
}
