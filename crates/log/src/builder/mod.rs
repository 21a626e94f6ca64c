//! Logger builder implementation

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{Config, Format, WriterConfig};
use crate::error::{LogError, LogResult};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Logger builder
#[derive(Debug)]
pub struct LoggerBuilder {
    config: Config,
}

/// Guard that keeps the logger's root span entered
///
/// Drop it at the end of `main`.
#[derive(Debug)]
pub struct LoggerGuard {
    #[allow(dead_code)]
    root_span: Option<tracing::span::EnteredSpan>,
}

impl LoggerBuilder {
    /// Create builder from config
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Build and install the global subscriber
    ///
    /// # Errors
    ///
    /// * `Filter` if the level directives do not parse
    /// * `Init` if a global subscriber is already installed
    pub fn build(self) -> LogResult<LoggerGuard> {
        let filter = self.filter()?;
        let layer = fmt_layer(&self.config).with_filter(filter);

        Registry::default()
            .with(layer)
            .try_init()
            .map_err(|e| LogError::Init(e.to_string()))?;

        let fields = &self.config.fields;
        let root_span = (!fields.is_empty()).then(|| {
            tracing::info_span!(
                "app",
                service = fields.service.as_deref().unwrap_or(""),
                env = fields.env.as_deref().unwrap_or(""),
                version = fields.version.as_deref().unwrap_or("")
            )
            .entered()
        });

        Ok(LoggerGuard { root_span })
    }

    fn filter(&self) -> LogResult<EnvFilter> {
        EnvFilter::try_new(&self.config.level)
            .map_err(|e| LogError::Filter(format!("{}: {e}", self.config.level)))
    }
}

fn make_writer(writer: WriterConfig) -> BoxMakeWriter {
    match writer {
        WriterConfig::Stderr => BoxMakeWriter::new(std::io::stderr),
        WriterConfig::Stdout => BoxMakeWriter::new(std::io::stdout),
    }
}

/// Formatting layer for the configured format; each arm yields a distinct
/// concrete type, hence the box.
fn fmt_layer(config: &Config) -> BoxedLayer {
    let display = &config.display;
    let base = fmt::layer()
        .with_writer(make_writer(config.writer))
        .with_ansi(display.colors)
        .with_target(display.target)
        .with_file(display.source)
        .with_line_number(display.source);

    match (config.format, display.time) {
        (Format::Compact, true) => base.compact().boxed(),
        (Format::Compact, false) => base.compact().without_time().boxed(),
        (Format::Pretty, true) => base.pretty().boxed(),
        (Format::Pretty, false) => base.pretty().without_time().boxed(),
        (Format::Json, true) => base
            .json()
            .flatten_event(display.flatten)
            .with_current_span(true)
            .boxed(),
        (Format::Json, false) => base
            .json()
            .flatten_event(display.flatten)
            .with_current_span(true)
            .without_time()
            .boxed(),
    }
}
