//! Command implementations

mod roles;
mod rotation;

use std::path::PathBuf;

use crate::cli::{Cli, Command, ReconcileArgs};
use crate::settings::{Overrides, Settings};

impl Command {
    /// Flag values this command contributes to the settings layers.
    fn overrides(&self, state: Option<PathBuf>) -> Overrides {
        let mut overrides = Overrides {
            state_file: state,
            ..Overrides::default()
        };
        match self {
            Self::Validate(args) => {
                overrides.roles_file.clone_from(&args.roles);
                overrides.allow_admin_escalation = args.allow_admin_escalation;
            }
            Self::ReconcileRoles(ReconcileArgs {
                roles: args,
                automation_role,
                ..
            }) => {
                overrides.roles_file.clone_from(&args.roles);
                overrides.allow_admin_escalation = args.allow_admin_escalation;
                overrides.automation_role.clone_from(automation_role);
            }
            Self::Bootstrap(args)
            | Self::Rotate(args)
            | Self::AckRollback(args)
            | Self::PurgePrevious(args) => {
                overrides.policy_file.clone_from(&args.policy);
            }
            Self::Status(_) => {}
        }
        overrides
    }
}

/// Resolve settings and run the selected command.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = cli.command.overrides(cli.state);
    let settings = Settings::load(cli.config.as_deref(), &overrides)?;

    match cli.command {
        Command::Validate(_) => roles::validate(&settings),
        Command::ReconcileRoles(args) => roles::reconcile(&settings, args.dry_run).await,
        Command::Bootstrap(args) => rotation::bootstrap(&settings, args).await,
        Command::Rotate(args) => rotation::rotate(&settings, args).await,
        Command::AckRollback(args) => rotation::acknowledge(&settings, args).await,
        Command::PurgePrevious(args) => rotation::purge(&settings, args).await,
        Command::Status(args) => rotation::status(&settings, &args.identity).await,
    }
}
