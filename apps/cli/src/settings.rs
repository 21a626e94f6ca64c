//! Layered settings: defaults, then `bastion.toml`, then `BASTION_*`
//! environment variables, then command-line flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use bastion_access::{LegalityOptions, ReconcilerConfig};
use bastion_core::RoleName;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Settings file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "bastion.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Local state file
    pub state_file: PathBuf,
    /// Role specification file
    pub roles_file: PathBuf,
    /// Rotation policy file; built-in policy when absent
    pub policy_file: Option<PathBuf>,
    /// Permit the admin role to be granted to service roles
    pub allow_admin_escalation: bool,
    /// Role the reconciler itself acts through. Unset (and with no
    /// `[reconciler.guard]` table), a reconcile may revoke the grants the
    /// reconciler depends on.
    pub automation_role: Option<RoleName>,
    /// Reconciler tuning
    pub reconciler: ReconcilerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("bastion-state.json"),
            roles_file: PathBuf::from("roles.yaml"),
            policy_file: None,
            allow_admin_escalation: false,
            automation_role: None,
            reconciler: ReconcilerConfig::default(),
        }
    }
}

/// Flag values that override every other layer when set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub allow_admin_escalation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automation_role: Option<RoleName>,
}

impl Settings {
    /// Merge every layer.
    ///
    /// An explicit `config` path must exist; the default file is optional.
    pub fn load(config: Option<&Path>, overrides: &Overrides) -> anyhow::Result<Self> {
        let file = match config {
            Some(path) if !path.exists() => bail!("settings file {} not found", path.display()),
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let settings: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed("BASTION_").split("__"))
            .merge(Serialized::globals(overrides))
            .extract()
            .with_context(|| format!("invalid settings (file {})", file.display()))?;

        tracing::debug!(?settings, "Settings loaded");
        Ok(settings)
    }

    /// Reconciler settings with the builder switches and the automation
    /// role applied.
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        let mut config = ReconcilerConfig {
            legality: LegalityOptions {
                allow_admin_escalation: self.allow_admin_escalation,
            },
            ..self.reconciler.clone()
        };
        if let Some(role) = &self.automation_role {
            config.guard.automation_role = Some(role.clone());
        }
        config
    }
}
