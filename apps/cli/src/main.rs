//! `bastion`: reconcile platform grants and rotate service key pairs.

mod cli;
mod commands;
mod exit;
mod loader;
mod settings;
mod state;

use std::process::ExitCode;

use clap::Parser;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log = init_logging(cli.verbose);

    match commands::run(cli).await {
        Ok(()) => ExitCode::from(exit::SUCCESS),
        Err(error) => {
            let code = exit::exit_code(&error);
            tracing::debug!(code, "Command failed");
            eprintln!("error: {error:#}");
            ExitCode::from(code)
        }
    }
}

fn init_logging(verbose: bool) -> Option<bastion_log::LoggerGuard> {
    let mut config = bastion_log::Config::from_env();
    let level_from_env = std::env::var_os("BASTION_LOG").is_some()
        || std::env::var_os("RUST_LOG").is_some();
    if verbose && !level_from_env {
        config.level = "debug".to_owned();
    }
    config.fields.service.get_or_insert_with(|| "bastion".to_owned());
    config.fields.version = Some(env!("CARGO_PKG_VERSION").to_owned());

    match bastion_log::init_with(config) {
        Ok(guard) => Some(guard),
        Err(error) => {
            eprintln!("warning: logging disabled: {error}");
            None
        }
    }
}
