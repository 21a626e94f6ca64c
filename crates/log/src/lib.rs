//! # bastion-log
//!
//! Logging setup for the bastion binaries: an [`EnvFilter`] driven by
//! `BASTION_LOG` / `RUST_LOG`, and a compact, pretty, or JSON formatter on
//! stderr.
//!
//! ```rust,no_run
//! let _guard = bastion_log::init_with(bastion_log::Config::from_env())?;
//! tracing::info!(identity = "SVC_X", "Rotation started");
//! # Ok::<(), bastion_log::LogError>(())
//! ```
//!
//! [`EnvFilter`]: tracing_subscriber::EnvFilter

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod config;
mod error;

pub use builder::{LoggerBuilder, LoggerGuard};
pub use config::{Config, DisplayConfig, Fields, Format, WriterConfig};
pub use error::{LogError, LogResult};

/// Initialize with a custom configuration.
pub fn init_with(config: Config) -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(config).build()
}
