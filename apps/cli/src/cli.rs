//! CLI structure and argument parsing

use std::path::PathBuf;

use bastion_core::RoleName;
use clap::{Args, Parser, Subcommand};

/// Bastion: declarative grants and zero-downtime key rotation
#[derive(Debug, Parser)]
#[command(name = "bastion")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub command: Command,

    /// Settings file (defaults to ./bastion.toml when present)
    #[arg(short, long, global = true, env = "BASTION_CONFIG")]
    pub config: Option<PathBuf>,

    /// Local state file standing in for the platform and credential store
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,

    /// Verbose output (debug level unless BASTION_LOG is set)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compile the role specification without touching the platform
    Validate(RolesArgs),

    /// Bring platform roles and grants in line with the role specification
    ReconcileRoles(ReconcileArgs),

    /// Give an identity its first key pair
    Bootstrap(RotationArgs),

    /// Rotate the key pair of an identity, resuming an interrupted rotation
    Rotate(RotationArgs),

    /// Clear a rolled-back rotation so the identity can rotate again
    AckRollback(RotationArgs),

    /// Delete retired key versions of an identity
    PurgePrevious(RotationArgs),

    /// Print the rotation record of an identity
    Status(IdentityArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RolesArgs {
    /// Role specification file (YAML)
    #[arg(short, long)]
    pub roles: Option<PathBuf>,

    /// Allow the admin role to be granted to service roles
    #[arg(long)]
    pub allow_admin_escalation: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ReconcileArgs {
    #[command(flatten)]
    pub roles: RolesArgs,

    /// Compute and print the diff without applying it
    #[arg(long)]
    pub dry_run: bool,

    /// Role the reconciling identity acts through; grants it depends on
    /// are never revoked
    #[arg(long, value_name = "ROLE")]
    pub automation_role: Option<RoleName>,
}

#[derive(Debug, Clone, Args)]
pub struct IdentityArgs {
    /// Service identity, e.g. SVC_X
    pub identity: String,
}

#[derive(Debug, Clone, Args)]
pub struct RotationArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,

    /// Rotation policy file (YAML)
    #[arg(short, long)]
    pub policy: Option<PathBuf>,

    /// Passphrase encrypting stored private keys
    #[arg(long, env = "BASTION_KEY_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,
}
