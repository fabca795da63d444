//! Inference session container.
//!
//! A session owns its options, its logger and the execution provider
//! instances attached to it. Provider instances are dropped with the session,
//! which releases any backend resources they hold.

use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use crate::config::SessionOptions;
use crate::error::{CoreError, Result};
use crate::logging::LogLevel;
use crate::types::{ExecutionProvider, SessionId};

/// Logger handed to execution providers while they are created.
///
/// Messages become `tracing` events under the `ronn::session` target with the
/// session id and log id as fields. Messages below the session's minimum
/// severity are dropped.
#[derive(Debug, Clone)]
pub struct SessionLogger {
    session_id: SessionId,
    log_id: String,
    min_level: LogLevel,
}

impl SessionLogger {
    /// Create a logger for a session.
    pub fn new(session_id: SessionId, log_id: impl Into<String>, min_level: LogLevel) -> Self {
        Self {
            session_id,
            log_id: log_id.into(),
            min_level,
        }
    }

    /// Session this logger belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Log id of the session.
    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    /// Minimum severity that is forwarded.
    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    /// Whether a message at `level` would be forwarded.
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Log a message at the given level.
    pub fn log(&self, level: LogLevel, message: &str) {
        if !self.enabled(level) {
            return;
        }

        let session_id = &self.session_id;
        let log_id = self.log_id.as_str();
        match level {
            LogLevel::Trace => {
                tracing::trace!(
                    target: "ronn::session",
                    session_id = %session_id,
                    log_id,
                    "{}",
                    message
                )
            }
            LogLevel::Debug => {
                tracing::debug!(
                    target: "ronn::session",
                    session_id = %session_id,
                    log_id,
                    "{}",
                    message
                )
            }
            LogLevel::Info => {
                tracing::info!(
                    target: "ronn::session",
                    session_id = %session_id,
                    log_id,
                    "{}",
                    message
                )
            }
            LogLevel::Warn => {
                tracing::warn!(
                    target: "ronn::session",
                    session_id = %session_id,
                    log_id,
                    "{}",
                    message
                )
            }
            LogLevel::Error => {
                tracing::error!(
                    target: "ronn::session",
                    session_id = %session_id,
                    log_id,
                    "{}",
                    message
                )
            }
        }
    }
}

/// An inference session and the execution providers attached to it.
pub struct InferenceSession {
    id: SessionId,
    options: SessionOptions,
    logger: SessionLogger,
    providers: Vec<Box<dyn ExecutionProvider>>,
    created_at: Instant,
}

impl InferenceSession {
    /// Create a session with no execution providers.
    pub fn new(options: SessionOptions) -> Self {
        let id = SessionId::new_v4();
        let logger = SessionLogger::new(id, options.log_id.clone(), options.log_severity);

        tracing::debug!(session_id = %id, log_id = %options.log_id, "Created inference session");

        Self {
            id,
            options,
            logger,
            providers: Vec::new(),
            created_at: Instant::now(),
        }
    }

    /// Unique session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Session options.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Mutable session options.
    pub fn options_mut(&mut self) -> &mut SessionOptions {
        &mut self.options
    }

    /// Session logger.
    pub fn logger(&self) -> &SessionLogger {
        &self.logger
    }

    /// Time since the session was created.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Attach one execution provider.
    ///
    /// Fails with `InvalidArgument` if a provider of the same type is
    /// already attached.
    pub fn register_execution_provider(
        &mut self,
        provider: Box<dyn ExecutionProvider>,
    ) -> Result<()> {
        self.register_execution_providers(vec![provider])
    }

    /// Attach several execution providers, keeping their order.
    ///
    /// Either all providers are attached or none is.
    pub fn register_execution_providers(
        &mut self,
        providers: Vec<Box<dyn ExecutionProvider>>,
    ) -> Result<()> {
        let mut seen: HashSet<&str> = self.providers.iter().map(|p| p.provider_type()).collect();
        for provider in &providers {
            if !seen.insert(provider.provider_type()) {
                return Err(CoreError::invalid_argument(format!(
                    "execution provider '{}' is already registered with the session",
                    provider.provider_type()
                )));
            }
        }

        for provider in providers {
            tracing::debug!(
                session_id = %self.id,
                provider = provider.provider_type(),
                devices = provider.devices().len(),
                "Attached execution provider"
            );
            self.providers.push(provider);
        }

        Ok(())
    }

    /// Attached execution providers in priority order.
    pub fn execution_providers(&self) -> &[Box<dyn ExecutionProvider>] {
        &self.providers
    }

    /// Types of the attached execution providers in priority order.
    pub fn provider_types(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.provider_type()).collect()
    }

    /// Number of attached providers.
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Whether a provider of this type is attached.
    pub fn has_provider(&self, provider_type: &str) -> bool {
        self.providers.iter().any(|p| p.provider_type() == provider_type)
    }
}

impl fmt::Debug for InferenceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceSession")
            .field("id", &self.id)
            .field("log_id", &self.options.log_id)
            .field("providers", &self.provider_types())
            .finish()
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        tracing::debug!(
            session_id = %self.id,
            providers = self.providers.len(),
            "Dropping inference session"
        );
    }
}
