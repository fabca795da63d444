//! CPU execution provider implementation.
//!
//! The default fallback provider. It targets any CPU device and is always
//! registered under the name [`CPU_EXECUTION_PROVIDER`].

use std::any::Any;
use std::sync::Arc;

use ronn_core::{
    CoreError, ExecutionProvider, HardwareDevice, HardwareDeviceKind, LogLevel, Result,
    SessionOptions,
};
use tracing::info;

use crate::factory::{CreateEpArgs, DeviceSupport, InternalEpFactory};

/// Name of the built-in CPU execution provider.
pub const CPU_EXECUTION_PROVIDER: &str = "CPU";

/// Vendor reported by the built-in providers.
pub const RONN_VENDOR: &str = "RONN";

/// Configuration for CPU execution provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuProviderConfig {
    /// Number of worker threads.
    pub thread_count: usize,
    /// Whether a memory arena may be used.
    pub enable_mem_arena: bool,
}

impl Default for CpuProviderConfig {
    fn default() -> Self {
        Self {
            thread_count: default_thread_count(),
            enable_mem_arena: true,
        }
    }
}

/// Leave one core for system tasks.
fn default_thread_count() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

impl CpuProviderConfig {
    /// Build a configuration from session options.
    ///
    /// `ep.CPU.threads` wins over the session thread count; without either the
    /// thread count defaults to the number of cores minus one.
    pub fn from_session_options(options: &SessionOptions) -> Result<Self> {
        let provider_options = options.provider_options(CPU_EXECUTION_PROVIDER);

        let thread_count = match provider_options.get("threads") {
            Some(value) => {
                let threads: usize = value.trim().parse().map_err(|_| {
                    CoreError::invalid_argument(format!(
                        "invalid value '{value}' for ep.{CPU_EXECUTION_PROVIDER}.threads"
                    ))
                })?;
                if threads == 0 {
                    default_thread_count()
                } else {
                    threads
                }
            }
            None => options.thread_count.unwrap_or_else(default_thread_count),
        };

        Ok(Self {
            thread_count,
            enable_mem_arena: options.enable_cpu_mem_arena,
        })
    }
}

/// CPU execution provider.
#[derive(Debug)]
pub struct CpuExecutionProvider {
    config: CpuProviderConfig,
    devices: Vec<Arc<HardwareDevice>>,
}

impl CpuExecutionProvider {
    /// Create a CPU execution provider for `devices`.
    pub fn new(config: CpuProviderConfig, devices: Vec<Arc<HardwareDevice>>) -> Self {
        info!(
            "Created CPU execution provider with {} threads (memory arena: {})",
            config.thread_count, config.enable_mem_arena
        );
        Self { config, devices }
    }

    /// Provider configuration.
    pub fn config(&self) -> &CpuProviderConfig {
        &self.config
    }
}

impl ExecutionProvider for CpuExecutionProvider {
    fn provider_type(&self) -> &str {
        CPU_EXECUTION_PROVIDER
    }

    fn vendor(&self) -> &str {
        RONN_VENDOR
    }

    fn devices(&self) -> &[Arc<HardwareDevice>] {
        &self.devices
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn create_cpu_provider(args: CreateEpArgs<'_>) -> Result<Box<dyn ExecutionProvider>> {
    let config = CpuProviderConfig::from_session_options(args.session_options)?;
    args.logger.log(
        LogLevel::Debug,
        &format!("creating CPU execution provider with {} threads", config.thread_count),
    );
    Ok(Box::new(CpuExecutionProvider::new(config, args.devices.to_vec())))
}

/// The factory of the built-in CPU execution provider.
pub fn create_cpu_factory() -> InternalEpFactory {
    InternalEpFactory::new(
        CPU_EXECUTION_PROVIDER,
        RONN_VENDOR,
        Box::new(|device: &HardwareDevice| {
            (device.kind == HardwareDeviceKind::Cpu).then(DeviceSupport::new)
        }),
        Box::new(create_cpu_provider),
    )
}
