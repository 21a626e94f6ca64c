//! Local state file.
//!
//! Holds a platform snapshot and a credential store snapshot as one JSON
//! document. Commands load it into the in-memory implementations and write
//! it back when they finish. The file is not locked: two processes sharing
//! it overwrite each other.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use bastion_core::{InMemoryPlatform, PlatformSnapshot};
use bastion_credential::{CredentialStoreSnapshot, InMemoryCredentialStore};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalState {
    pub platform: PlatformSnapshot,
    pub credentials: CredentialStoreSnapshot,
}

impl LocalState {
    /// Read `path`; a missing file is an empty state.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("corrupt state file {}", path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No state file yet, starting empty");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("cannot read state file {}", path.display())),
        }
    }

    /// Write to a sibling temp file, then rename over `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text).with_context(|| format!("cannot write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("cannot replace {}", path.display()))?;
        Ok(())
    }

    /// Live in-memory backends seeded from this state.
    pub fn into_backends(self) -> Backends {
        Backends {
            platform: Arc::new(InMemoryPlatform::from_snapshot(self.platform)),
            store: Arc::new(InMemoryCredentialStore::from_snapshot(self.credentials)),
        }
    }
}

/// The in-memory platform and credential store a command runs against.
#[derive(Debug, Clone)]
pub struct Backends {
    pub platform: Arc<InMemoryPlatform>,
    pub store: Arc<InMemoryCredentialStore>,
}

impl Backends {
    pub fn snapshot(&self) -> LocalState {
        LocalState {
            platform: self.platform.snapshot(),
            credentials: self.store.snapshot(),
        }
    }
}
