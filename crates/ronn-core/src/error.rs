//! Error types for the ronn-core crate.

use thiserror::Error;

/// Result type for core and provider registry operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Status codes a [`CoreError`] maps to.
///
/// These mirror the codes carried across the plugin ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Generic failure (library or symbol load failure, ABI mismatch, ...).
    Fail,
    /// A caller supplied an invalid argument.
    InvalidArgument,
    /// The requested functionality is not implemented.
    NotImplemented,
}

/// Errors that can occur in the execution provider system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Bad or duplicate registration name, unsupported device count, no
    /// candidate provider, and similar caller errors.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Library load failure, missing symbol, ABI version mismatch, or a
    /// failure reported by a provider.
    #[error("Failed: {0}")]
    Fail(String),

    /// Functionality that is deliberately not available yet.
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl CoreError {
    /// Create an [`CoreError::InvalidArgument`] error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a [`CoreError::Fail`] error.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }

    /// Create a [`CoreError::NotImplemented`] error.
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented(message.into())
    }

    /// Build an error from a status code and message.
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        match code {
            ErrorCode::Fail => Self::Fail(message.into()),
            ErrorCode::InvalidArgument => Self::InvalidArgument(message.into()),
            ErrorCode::NotImplemented => Self::NotImplemented(message.into()),
        }
    }

    /// The status code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Fail(_) => ErrorCode::Fail,
            Self::NotImplemented(_) => ErrorCode::NotImplemented,
        }
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument(m) | Self::Fail(m) | Self::NotImplemented(m) => m,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArgument(format!("invalid configuration: {err}"))
    }
}
