//! Configuration read from environment variables

use super::{Config, Fields, Format};

impl Config {
    /// Create configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// `BASTION_LOG` wins over `RUST_LOG`; `BASTION_LOG_FORMAT` picks the
    /// formatter; `NO_COLOR` disables colors.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(level) = lookup("BASTION_LOG").or_else(|| lookup("RUST_LOG")) {
            config.level = level;
        }

        if let Some(format) = lookup("BASTION_LOG_FORMAT") {
            config.format = Format::parse_lossy(&format);
        }

        config.display.apply_env(&lookup);
        config.fields = Fields::from_lookup(&lookup);

        config
    }
}
