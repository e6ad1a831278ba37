//! Tracing subscriber setup.
//!
//! Libraries in this workspace only emit events; the binary installs the
//! subscriber here. Guest records arrive under the `shimbox::guest` target,
//! so `RUST_LOG=shimbox::guest=debug` shows everything a guest reports.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Tracing output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TracingFormat {
    /// Human-readable multi-line output with colors.
    #[default]
    Pretty,

    /// One line per event.
    Compact,

    /// JSON objects, one per line.
    Json,
}

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level filter.
    ///
    /// If None, uses RUST_LOG environment variable or defaults to "info".
    pub level: Option<tracing::Level>,

    pub format: TracingFormat,

    /// Include timestamps in output.
    pub timestamps: bool,

    /// Include target module names in output.
    pub target: bool,

    pub thread_ids: bool,

    /// Emit an event when a span closes, with its duration.
    pub span_timing: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: TracingFormat::Pretty,
            timestamps: true,
            target: true,
            thread_ids: false,
            span_timing: false,
        }
    }
}

impl TracingConfig {
    fn filter(&self) -> EnvFilter {
        match self.level {
            Some(level) => EnvFilter::new(level.as_str().to_lowercase()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        }
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let spans = if self.span_timing {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(self.target)
            .with_thread_ids(self.thread_ids)
            .with_span_events(spans);

        match (self.format, self.timestamps) {
            (TracingFormat::Pretty, true) => layer.pretty().boxed(),
            (TracingFormat::Pretty, false) => layer.pretty().without_time().boxed(),
            (TracingFormat::Compact, true) => layer.compact().boxed(),
            (TracingFormat::Compact, false) => layer.compact().without_time().boxed(),
            (TracingFormat::Json, true) => layer.json().boxed(),
            (TracingFormat::Json, false) => layer.json().without_time().boxed(),
        }
    }
}

/// Initialize tracing subscriber with default settings.
///
/// # Environment Variables
///
/// - `RUST_LOG=debug` - Enable debug logs
/// - `RUST_LOG=shimbox_host=trace` - Trace handle allocation
/// - `RUST_LOG=shimbox::guest=warn` - Only guest warnings and worse
pub fn init_subscriber() {
    init_subscriber_with_config(TracingConfig::default());
}

/// Initialize tracing subscriber with custom configuration.
///
/// Does nothing if a global subscriber is already installed.
///
/// # Example
///
/// ```ignore
/// use shimbox::tracing_support::{init_subscriber_with_config, TracingConfig, TracingFormat};
///
/// init_subscriber_with_config(TracingConfig {
///     format: TracingFormat::Json,
///     ..Default::default()
/// });
/// ```
pub fn init_subscriber_with_config(config: TracingConfig) {
    let _ = tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(config.filter())
        .try_init();
}
