//! Structured logging for plugin processes.
//!
//! A plugin's stdout is the protocol stream, so every subscriber installed
//! here writes to **stderr**. The host forwards that stream to its configured
//! stderr sink.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line human-readable output
    Pretty,

    /// One line per event (default)
    Compact,

    /// One JSON object per event, for hosts that parse plugin logs
    Json,
}

/// Subscriber configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level filter.
    ///
    /// If None, uses RUST_LOG environment variable or defaults to "info".
    pub level: Option<tracing::Level>,

    pub format: LogFormat,

    /// Include timestamps in output.
    pub timestamps: bool,

    /// Include target module names in output.
    pub target: bool,

    /// Emit ANSI colour codes. Off by default since stderr is usually a pipe
    /// into the host rather than a terminal.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: LogFormat::Compact,
            timestamps: true,
            target: true,
            ansi: false,
        }
    }
}

impl LogConfig {
    fn filter(&self) -> EnvFilter {
        match self.level {
            Some(level) => EnvFilter::new(level.to_string()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        }
    }
}

/// Install a stderr subscriber with default settings.
///
/// Uses `RUST_LOG` for filtering, defaulting to `info`.
///
/// # Panics
///
/// If a global subscriber is already installed.
pub fn init_subscriber() {
    init_subscriber_with_config(LogConfig::default());
}

/// Install a stderr subscriber with custom configuration.
///
/// ```ignore
/// use plugwire_sdk::logging::{init_subscriber_with_config, LogConfig, LogFormat};
///
/// init_subscriber_with_config(LogConfig {
///     format: LogFormat::Json,
///     ..Default::default()
/// });
/// ```
pub fn init_subscriber_with_config(config: LogConfig) {
    let filter = config.filter();
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.target)
        .with_ansi(config.ansi);
    let registry = tracing_subscriber::registry().with(filter);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry.with(layer.pretty()).init(),
        (LogFormat::Pretty, false) => registry.with(layer.pretty().without_time()).init(),
        (LogFormat::Compact, true) => registry.with(layer.compact()).init(),
        (LogFormat::Compact, false) => registry.with(layer.compact().without_time()).init(),
        (LogFormat::Json, true) => registry.with(layer.json()).init(),
        (LogFormat::Json, false) => registry.with(layer.json().without_time()).init(),
    }
}
