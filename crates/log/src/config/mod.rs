//! Logger configuration

mod presets;

use serde::{Deserialize, Serialize};

/// Logger configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filter directives, e.g. `info` or `info,bastion_credential=debug`
    pub level: String,
    /// Output format
    pub format: Format,
    /// What each line shows
    pub display: DisplayConfig,
    /// Fields attached to every event through a root span
    pub fields: Fields,
    /// Where lines go
    pub writer: WriterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: Format::default(),
            display: DisplayConfig::default(),
            fields: Fields::default(),
            writer: WriterConfig::default(),
        }
    }
}

/// Output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// One line per event
    #[default]
    Compact,
    /// Multi-line, human oriented
    Pretty,
    /// One JSON object per event
    Json,
}

impl Format {
    /// Parse a format name; unknown names fall back to compact.
    pub fn parse_lossy(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "pretty" => Self::Pretty,
            "json" => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Display options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct DisplayConfig {
    /// ANSI colors
    pub colors: bool,
    /// Timestamps
    pub time: bool,
    /// Module path of the event
    pub target: bool,
    /// File and line of the event
    pub source: bool,
    /// Flatten event fields into the top-level JSON object
    pub flatten: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            colors: true,
            time: true,
            target: true,
            source: false,
            flatten: false,
        }
    }
}

impl DisplayConfig {
    pub(crate) fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if lookup("NO_COLOR").is_some_and(|v| !v.is_empty()) {
            self.colors = false;
        }
        if let Some(source) = lookup("BASTION_LOG_SOURCE") {
            self.source = matches!(source.as_str(), "1" | "true" | "yes");
        }
    }
}

/// Global fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fields {
    /// Service name
    pub service: Option<String>,
    /// Deployment environment
    pub env: Option<String>,
    /// Build version
    pub version: Option<String>,
}

impl Fields {
    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        self.service.is_none() && self.env.is_none() && self.version.is_none()
    }

    pub(crate) fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        Self {
            service: lookup("BASTION_SERVICE"),
            env: lookup("BASTION_ENV"),
            version: None,
        }
    }
}

/// Output destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterConfig {
    /// Standard error; keeps stdout free for command output
    #[default]
    Stderr,
    /// Standard output
    Stdout,
}
