//! Role specification and rotation policy files.

use std::fs;
use std::path::{Path, PathBuf};

use bastion_access::RoleSpec;
use bastion_credential::RotationPolicy;
use serde::Deserialize;
use thiserror::Error;

/// A file that could not be read or parsed.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Top level of a role specification file.
///
/// ```yaml
/// roles:
///   - name: ADMIN
///     kind: admin
///   - name: DB_RO
///     kind: access
///     database: BRONZE
///     level: RO
///   - name: ANALYST
///     kind: functional
///     grants: [DB_RO]
/// ```
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoleFile {
    roles: Vec<RoleSpec>,
}

/// Read the roles declared in a YAML file.
pub fn load_role_specs(path: &Path) -> Result<Vec<RoleSpec>, LoadError> {
    let file: RoleFile = read_yaml(path)?;
    tracing::debug!(path = %path.display(), roles = file.roles.len(), "Role specification loaded");
    Ok(file.roles)
}

/// Read a rotation policy; omitted fields keep their defaults.
pub fn load_rotation_policy(path: &Path) -> Result<RotationPolicy, LoadError> {
    read_yaml(path)
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, LoadError> {
    let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| LoadError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}
