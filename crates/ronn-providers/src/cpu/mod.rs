//! CPU execution provider module.
//!
//! This module provides the built-in CPU execution provider that automatic
//! selection falls back to.

pub mod provider;

pub use provider::{
    CpuExecutionProvider, CpuProviderConfig, CPU_EXECUTION_PROVIDER, RONN_VENDOR,
    create_cpu_factory,
};
