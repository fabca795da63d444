//! Structured logging configuration for RONN.
//!
//! Logging goes through the `tracing` crate. Registry and selection code emits
//! events under the `ronn_providers` target; backend messages written through a
//! [`crate::SessionLogger`] carry the session id and log id as fields.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::error::{CoreError, Result};

/// Logging configuration for the RONN runtime.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Extra `EnvFilter` directives, e.g. `ronn_providers::library=trace`
    pub directives: Vec<String>,
    /// Whether to include thread IDs
    pub with_thread_ids: bool,
    /// Whether to include source code locations
    pub with_source_location: bool,
    /// Whether to log span events (enter/exit)
    pub with_span_events: bool,
    /// Whether to output in JSON format
    pub json_format: bool,
}

/// Log level, shared by the global logger and session loggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace-level logging (most verbose)
    Trace,
    /// Debug-level logging
    Debug,
    /// Info-level logging
    Info,
    /// Warn-level logging
    Warn,
    /// Error-level logging (least verbose)
    Error,
}

impl LogLevel {
    /// Convert to `tracing::Level`.
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Warn
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            directives: Vec::new(),
            with_thread_ids: false,
            with_source_location: false,
            with_span_events: false,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum log level.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Add an `EnvFilter` directive.
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Enable or disable thread IDs.
    pub fn with_thread_ids(mut self, enable: bool) -> Self {
        self.with_thread_ids = enable;
        self
    }

    /// Enable or disable source code locations.
    pub fn with_source_location(mut self, enable: bool) -> Self {
        self.with_source_location = enable;
        self
    }

    /// Enable or disable JSON output format.
    pub fn with_json_format(mut self, enable: bool) -> Self {
        self.json_format = enable;
        self
    }

    /// Verbose output for debugging plugin loading and provider selection.
    pub fn plugin_debugging() -> Self {
        Self {
            level: LogLevel::Info,
            directives: vec![
                "ronn_providers::library=trace".to_string(),
                "ronn_providers::selection=debug".to_string(),
                "ronn_providers::registry=debug".to_string(),
            ],
            with_thread_ids: true,
            with_source_location: true,
            with_span_events: true,
            json_format: false,
        }
    }

    /// Create a production-friendly configuration (minimal).
    pub fn production() -> Self {
        Self {
            level: LogLevel::Warn,
            directives: Vec::new(),
            with_thread_ids: false,
            with_source_location: false,
            with_span_events: false,
            json_format: true, // JSON for log aggregation
        }
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.to_tracing_level().as_str()));

        for directive in &self.directives {
            match directive.parse::<Directive>() {
                Ok(parsed) => filter = filter.add_directive(parsed),
                Err(e) => eprintln!("ignoring invalid log directive '{directive}': {e}"),
            }
        }

        filter
    }
}

/// Install the global subscriber with the given configuration.
///
/// Fails if a global subscriber has already been installed.
///
/// # Example
///
/// ```no_run
/// use ronn_core::logging::{init_logging, LoggingConfig};
///
/// init_logging(LoggingConfig::plugin_debugging()).expect("logger already set");
/// ```
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let env_filter = config.env_filter();

    let span_events = if config.with_span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = if config.json_format {
        let fmt_layer = fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_current_span(true)
            .with_thread_ids(config.with_thread_ids)
            .with_file(config.with_source_location)
            .with_line_number(config.with_source_location);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_span_events(span_events)
            .with_thread_ids(config.with_thread_ids)
            .with_file(config.with_source_location)
            .with_line_number(config.with_source_location)
            .with_target(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
    };

    result.map_err(|e| CoreError::fail(format!("failed to install logger: {e}")))
}

/// Install the global subscriber with [`LoggingConfig::default`].
pub fn init_default_logging() -> Result<()> {
    init_logging(LoggingConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert!(config.directives.is_empty());
        assert!(!config.json_format);
    }

    #[test]
    fn test_plugin_debugging_targets_registry_modules() {
        let config = LoggingConfig::plugin_debugging();
        assert!(config
            .directives
            .iter()
            .any(|d| d.starts_with("ronn_providers::library")));
        assert!(config.with_span_events);
    }

    #[test]
    fn test_logging_config_builder() {
        let config = LoggingConfig::new()
            .with_level(LogLevel::Trace)
            .with_directive("ronn_providers=debug")
            .with_thread_ids(true)
            .with_json_format(true);

        assert_eq!(config.level, LogLevel::Trace);
        assert_eq!(config.directives, vec!["ronn_providers=debug".to_string()]);
        assert!(config.with_thread_ids);
        assert!(config.json_format);
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Info);
        assert!(LogLevel::Error > LogLevel::Warn);
        assert_eq!(LogLevel::default(), LogLevel::Warn);
    }
}
