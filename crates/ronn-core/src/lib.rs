//! RONN Core
//!
//! Shared foundation of the RONN execution provider system: hardware device
//! identity, the status/error type, session configuration, the session
//! container that owns execution provider instances, and logging setup.
//!
//! ## Example
//!
//! ```rust
//! use ronn_core::{provider_option_key, InferenceSession, SessionOptions};
//!
//! let mut options = SessionOptions::new().with_log_id("mobilenet");
//! options.add_config_entry(provider_option_key("CPU", "threads"), "2")?;
//!
//! let session = InferenceSession::new(options);
//! assert_eq!(session.options().provider_options("CPU")["threads"], "2");
//! assert_eq!(session.provider_count(), 0);
//! # Ok::<(), ronn_core::CoreError>(())
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
/// Error types for core operations
pub mod error;
pub mod logging;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use config::{
    provider_option_key, provider_option_prefix, ConfigOptions, DevicePolicy, SessionOptions,
    DISABLE_CPU_EP_FALLBACK,
};
pub use error::{CoreError, ErrorCode, Result};
pub use logging::{init_logging, LogLevel, LoggingConfig};
pub use session::{InferenceSession, SessionLogger};
pub use types::{ExecutionProvider, HardwareDevice, HardwareDeviceKind, SessionId};
